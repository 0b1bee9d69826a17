//! End-to-end send/receive scenarios over localhost UDP.
//!
//! A receiver thread appends every datagram payload to a byte vector until
//! the wire goes quiet, then the reconstruction is compared byte-for-byte
//! with the input file.

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use tscast::caster::Caster;
use tscast::net::MuxerConfig;
use tscast::stream::Endpoint;
use tscast::ts::gen::CbrStream;

/// Collect datagram payloads until `idle` of silence after the first one.
fn spawn_receiver(socket: UdpSocket, idle: Duration) -> thread::JoinHandle<Vec<(usize, Vec<u8>)>> {
    socket.set_read_timeout(Some(idle)).unwrap();
    thread::spawn(move || {
        let mut datagrams = Vec::new();
        let mut buf = [0u8; 2048];
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, _)) => datagrams.push((n, buf[..n].to_vec())),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if !datagrams.is_empty() || Instant::now() > deadline {
                        break;
                    }
                }
                Err(e) => panic!("receiver failed: {e}"),
            }
        }
        datagrams
    })
}

fn reassemble(datagrams: &[(usize, Vec<u8>)]) -> Vec<u8> {
    datagrams.iter().flat_map(|(_, d)| d.iter().copied()).collect()
}

fn endpoint_of(socket: &UdpSocket) -> Endpoint {
    Endpoint {
        ip: std::net::Ipv4Addr::LOCALHOST,
        port: socket.local_addr().unwrap().port(),
    }
}

#[test]
fn round_trip_single_stream() {
    // 2002 packets at 6 Mbit/s: half a second of stream, 286 datagrams.
    let stream = CbrStream::new(2002, 188, 6_000_000);
    let input = stream.bytes();
    let file = tempfile::NamedTempFile::new().unwrap();
    stream.write_to(file.path()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = endpoint_of(&socket);
    let receiver = spawn_receiver(socket, Duration::from_millis(800));

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    let started = Instant::now();
    caster.create_stream(file.path(), endpoint).unwrap();
    caster.run().unwrap();
    let elapsed = started.elapsed();

    let datagrams = receiver.join().unwrap();

    // SMPTE 2022-2 framing on every datagram.
    for (n, payload) in &datagrams {
        assert_eq!(*n, 7 * 188);
        for k in 0..7 {
            assert_eq!(payload[k * 188], 0x47);
        }
    }

    // Byte-for-byte identity.
    assert_eq!(reassemble(&datagrams), input);

    // Pacing: the play time tracks size*8/bitrate (~500 ms) plus preroll,
    // with generous scheduler slack.
    assert!(elapsed >= Duration::from_millis(350), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_500), "finished too slow: {elapsed:?}");
}

#[test]
fn round_trip_two_concurrent_streams() {
    let stream = CbrStream::new(1400, 188, 6_000_000);
    let input = stream.bytes();
    let file = tempfile::NamedTempFile::new().unwrap();
    stream.write_to(file.path()).unwrap();

    let socket_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let socket_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint_a = endpoint_of(&socket_a);
    let endpoint_b = endpoint_of(&socket_b);
    let receiver_a = spawn_receiver(socket_a, Duration::from_millis(800));
    let receiver_b = spawn_receiver(socket_b, Duration::from_millis(800));

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    caster.create_stream(file.path(), endpoint_a).unwrap();
    caster.create_stream(file.path(), endpoint_b).unwrap();
    caster.run().unwrap();

    assert_eq!(reassemble(&receiver_a.join().unwrap()), input);
    assert_eq!(reassemble(&receiver_b.join().unwrap()), input);
}

#[test]
fn sync_search_recovers_from_junk_prefix() {
    let stream = CbrStream::new(1401, 188, 6_000_000);
    let payload_bytes = stream.bytes();

    // 4096 junk bytes in front; a lone sync byte must not derail the
    // triple check.
    let mut contents = vec![0xA5u8; 4096];
    contents[1000] = 0x47;
    contents.extend_from_slice(&payload_bytes);

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &contents).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = endpoint_of(&socket);
    let receiver = spawn_receiver(socket, Duration::from_millis(800));

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    caster.create_stream(file.path(), endpoint).unwrap();
    caster.run().unwrap();

    // Only the TS payload comes out; the junk prefix is gone.
    assert_eq!(reassemble(&receiver.join().unwrap()), payload_bytes);
}

#[test]
fn round_trip_204_byte_packets() {
    let stream = CbrStream::new(1500, 204, 8_000_000);
    let input = stream.bytes();
    let file = tempfile::NamedTempFile::new().unwrap();
    stream.write_to(file.path()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = endpoint_of(&socket);
    let receiver = spawn_receiver(socket, Duration::from_millis(800));

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    caster.create_stream(file.path(), endpoint).unwrap();
    caster.run().unwrap();

    let datagrams = receiver.join().unwrap();
    for (n, _) in &datagrams {
        // 204-byte packets travel in 1428-byte payloads (the last datagram
        // of the file may be a flushed partial).
        assert!(*n == 7 * 204 || *n % 204 == 0);
    }
    assert_eq!(reassemble(&datagrams), input);
}

#[test]
fn measured_bitrate_tracks_file_bitrate() {
    // 3 s of stream at 4 Mbit/s.
    let packets = (4_000_000u64 * 3 / (188 * 8)) as usize;
    let stream = CbrStream::new(packets, 188, 4_000_000);
    let file = tempfile::NamedTempFile::new().unwrap();
    stream.write_to(file.path()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = endpoint_of(&socket);

    // Timestamp every datagram arrival.
    socket.set_read_timeout(Some(Duration::from_millis(800))).unwrap();
    let receiver = thread::spawn(move || {
        let mut arrivals: Vec<(Instant, usize)> = Vec::new();
        let mut buf = [0u8; 2048];
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, _)) => arrivals.push((Instant::now(), n)),
                Err(_) => {
                    if !arrivals.is_empty() || Instant::now() > deadline {
                        break;
                    }
                }
            }
        }
        arrivals
    });

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    caster.create_stream(file.path(), endpoint).unwrap();
    caster.run().unwrap();

    let arrivals = receiver.join().unwrap();
    assert!(arrivals.len() > 100, "not enough datagrams to measure");

    // Steady-state window: drop the first and last 10% of datagrams.
    let skip = arrivals.len() / 10;
    let window = &arrivals[skip..arrivals.len() - skip];
    let bytes: usize = window.iter().map(|(_, n)| n).sum();
    let span = window[window.len() - 1].0 - window[0].0;
    let measured = bytes as f64 * 8.0 / span.as_secs_f64();

    let error = (measured - 4_000_000.0).abs() / 4_000_000.0;
    assert!(
        error < 0.02,
        "measured {measured:.0} bit/s, off by {:.1}%",
        error * 100.0
    );
}

#[test]
fn trailing_partial_datagram_is_flushed_on_eof() {
    // 1403 packets: 200 full datagrams plus 3 trailing packets that only
    // reach the wire because EOF teardown flushes.
    let stream = CbrStream::new(1403, 188, 6_000_000);
    let input = stream.bytes();
    let file = tempfile::NamedTempFile::new().unwrap();
    stream.write_to(file.path()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let endpoint = endpoint_of(&socket);
    let receiver = spawn_receiver(socket, Duration::from_millis(800));

    let caster = Caster::new(false, MuxerConfig::default()).unwrap();
    caster.create_stream(file.path(), endpoint).unwrap();
    caster.run().unwrap();

    let datagrams = receiver.join().unwrap();
    let (last_len, _) = datagrams.last().unwrap();
    assert_eq!(*last_len, 3 * 188, "partial tail missing or padded");
    assert_eq!(reassemble(&datagrams), input);
}
