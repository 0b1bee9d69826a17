//! CBR TS file parsing: sync discovery, bitrate inference, timed reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::filter::PcrFilter;
use super::{PACKET_SIZE_188, PACKET_SIZE_204, PCR_CLOCK_HZ, SYNC_BYTE};
use crate::buffer::{Buffer, TsBuffer};
use crate::error::{Error, Result};

/// Target read size; rounded down to a whole number of packets.
pub const APPROX_READ_SIZE: usize = 128 * 1024;

/// Sync scan window: lcm(188, 204) bytes.
const SYNC_SCAN_SIZE: usize = 9_588;

/// Bytes kept between scan windows so a sync triple straddling the
/// boundary is still found (three 204-byte packets).
const SYNC_SCAN_OVERLAP: usize = 3 * PACKET_SIZE_204;

/// PCR span that ends the bitrate scan (3 s of stream).
const BITRATE_PCR_SPAN: u64 = 3 * PCR_CLOCK_HZ;

/// Reader over a CBR TS file that serves fixed-size packet chunks with
/// per-packet send timestamps.
///
/// Opening the parser finds the first sync position, infers the packet
/// size (188 or 204) and the stream bitrate from PCR distances, then
/// rewinds so [`read`](Self::read) starts at the first sync'd packet.
///
/// Timestamps are assigned from the inferred bitrate rather than from the
/// PCRs themselves: for a CBR stream the linear schedule is exact and it
/// keeps per-packet PCR parsing off the read path.
pub struct TsFileParser {
    file: File,
    path: PathBuf,
    /// 188 or 204.
    packet_size: usize,
    /// Byte offset of the first sync'd packet.
    sync_offset: u64,
    /// `APPROX_READ_SIZE` rounded down to whole packets.
    per_buffer_packets: usize,
    /// Packets served so far; the index base for timestamps.
    packets_read: u64,
    /// Inferred stream bitrate in bit/s.
    bitrate: u64,
    /// Number of buffers that make up roughly one second of stream.
    estimated_buffers_per_second: usize,
}

impl TsFileParser {
    /// Open a TS file: find sync, infer the bitrate, rewind to the first
    /// packet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mut parser = Self {
            file,
            path,
            packet_size: 0,
            sync_offset: 0,
            per_buffer_packets: 0,
            packets_read: 0,
            bitrate: 0,
            estimated_buffers_per_second: 0,
        };
        parser.sync()?;
        parser.infer_bitrate()?;

        tracing::debug!(
            path = %parser.path.display(),
            packet_size = parser.packet_size,
            sync_offset = parser.sync_offset,
            bitrate = parser.bitrate,
            "TS file parsed"
        );
        Ok(parser)
    }

    /// Locate the smallest offset where three consecutive packets start
    /// with the sync byte, for a packet size of 188 or 204 bytes (188 wins
    /// when both match at the same offset).
    fn sync(&mut self) -> Result<()> {
        let mut scan = vec![0u8; SYNC_SCAN_SIZE];
        let mut window_base: u64 = 0;

        loop {
            let read_size = read_full(&mut self.file, &mut scan)?;
            let window = &scan[..read_size];

            let mut found = None;
            'scan: for pos in 0..read_size {
                for k in [PACKET_SIZE_188, PACKET_SIZE_204] {
                    if pos + 2 * k < read_size
                        && window[pos] == SYNC_BYTE
                        && window[pos + k] == SYNC_BYTE
                        && window[pos + 2 * k] == SYNC_BYTE
                    {
                        found = Some((pos, k));
                        break 'scan;
                    }
                }
            }

            if let Some((pos, k)) = found {
                self.packet_size = k;
                self.sync_offset = window_base + pos as u64;
                break;
            }

            if read_size < SYNC_SCAN_SIZE {
                // EOF reached without a triple.
                return Err(Error::SyncNotFound(self.path.display().to_string()));
            }
            self.file.seek(SeekFrom::Current(-(SYNC_SCAN_OVERLAP as i64)))?;
            window_base += (read_size - SYNC_SCAN_OVERLAP) as u64;
        }

        self.per_buffer_packets = APPROX_READ_SIZE / self.packet_size;
        self.file.seek(SeekFrom::Start(self.sync_offset))?;
        Ok(())
    }

    /// Infer the bitrate from the PID with the greatest PCR span.
    ///
    /// Scans until some PID covers [`BITRATE_PCR_SPAN`] ticks or EOF; any
    /// PID with at least two advancing PCRs qualifies at EOF.
    fn infer_bitrate(&mut self) -> Result<()> {
        let mut filter = PcrFilter::new();
        let mut position = 0u64;

        loop {
            let Some(buffer) = self.read_chunk(false)? else {
                break;
            };
            filter.push(&buffer, position);
            position += buffer.as_slice().len() as u64;
            if filter.max_span().is_some_and(|s| s.ticks >= BITRATE_PCR_SPAN) {
                break;
            }
        }

        let span = filter
            .max_span()
            .ok_or_else(|| Error::BitrateIndeterminate(self.path.display().to_string()))?;
        self.bitrate =
            (span.bytes as u128 * 8 * PCR_CLOCK_HZ as u128 / span.ticks as u128) as u64;
        if self.bitrate == 0 {
            return Err(Error::BitrateIndeterminate(self.path.display().to_string()));
        }

        self.estimated_buffers_per_second = std::cmp::max(
            1,
            (self.bitrate / (self.per_buffer_packets * self.packet_size * 8) as u64) as usize,
        );

        self.packets_read = 0;
        self.file.seek(SeekFrom::Start(self.sync_offset))?;
        Ok(())
    }

    /// Read the next chunk of whole packets; `timed` selects whether the
    /// bitrate schedule is stamped on it.
    fn read_chunk(&mut self, timed: bool) -> Result<Option<TsBuffer>> {
        let mut buffer = Buffer::alloc(self.per_buffer_packets * self.packet_size);
        let bytes = read_full(&mut self.file, buffer.space_mut())?;
        let num_packets = bytes / self.packet_size;
        if num_packets == 0 {
            return Ok(None);
        }

        let timestamps = if timed {
            (0..num_packets as u64)
                .map(|i| self.timestamp_of(self.packets_read + i))
                .collect()
        } else {
            vec![0u64; num_packets]
        };

        let ts_buffer = TsBuffer::from_parts(buffer, self.packet_size, num_packets, timestamps);
        self.packets_read += num_packets as u64;
        Ok(Some(ts_buffer))
    }

    /// Read the next buffer of packets with their send timestamps.
    ///
    /// Returns `None` at EOF. The last buffer may hold fewer than
    /// [`packets_per_buffer`](Self::packets_per_buffer) packets; trailing
    /// bytes shorter than one packet are dropped.
    pub fn read(&mut self) -> Result<Option<TsBuffer>> {
        self.read_chunk(true)
    }

    /// Scheduled 27 MHz tick of packet `n` on the inferred CBR timeline.
    fn timestamp_of(&self, n: u64) -> u64 {
        let bits = n as u128 * self.packet_size as u128 * 8;
        ((bits * PCR_CLOCK_HZ as u128 + self.bitrate as u128 / 2) / self.bitrate as u128) as u64
    }

    /// The inferred stream bitrate in bit/s.
    #[inline]
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    /// The detected TS packet size (188 or 204).
    #[inline]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Byte offset at which sync was found.
    #[inline]
    pub fn sync_offset(&self) -> u64 {
        self.sync_offset
    }

    /// Number of packets served per full buffer.
    #[inline]
    pub fn packets_per_buffer(&self) -> usize {
        self.per_buffer_packets
    }

    /// How many buffers make up roughly one second of stream (at least 1).
    #[inline]
    pub fn estimated_buffers_per_second(&self) -> usize {
        self.estimated_buffers_per_second
    }

    /// Path of the parsed file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::gen::CbrStream;
    use std::io::Write;

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_sync_at_offset_zero() {
        let file = write_temp(&CbrStream::new(2000, 188, 4_000_000).bytes());
        let parser = TsFileParser::open(file.path()).unwrap();
        assert_eq!(parser.sync_offset(), 0);
        assert_eq!(parser.packet_size(), 188);
    }

    #[test]
    fn test_sync_after_garbage_prefix() {
        // 4096 junk bytes with a lone 0x47 that must not fool the triple
        // check, then a valid stream.
        let mut data = vec![0xAAu8; 4096];
        data[100] = SYNC_BYTE;
        data.extend_from_slice(&CbrStream::new(2000, 188, 4_000_000).bytes());

        let file = write_temp(&data);
        let parser = TsFileParser::open(file.path()).unwrap();
        assert_eq!(parser.sync_offset(), 4096);
        assert_eq!(parser.packet_size(), 188);
    }

    #[test]
    fn test_sync_detects_204() {
        let file = write_temp(&CbrStream::new(2000, 204, 8_000_000).bytes());
        let parser = TsFileParser::open(file.path()).unwrap();
        assert_eq!(parser.packet_size(), 204);
    }

    #[test]
    fn test_sync_not_found() {
        let file = write_temp(&vec![0x55u8; 20_000]);
        let err = TsFileParser::open(file.path()).err().unwrap();
        assert!(matches!(err, Error::SyncNotFound(_)), "got {err}");
    }

    #[test]
    fn test_bitrate_inference_full_span() {
        // 4 s of stream at 4 Mbit/s so the 3 s span path is taken.
        let packets = 4_000_000 * 4 / (188 * 8);
        let stream = CbrStream::new(packets as usize, 188, 4_000_000);
        let file = write_temp(&stream.bytes());

        let parser = TsFileParser::open(file.path()).unwrap();
        let err = (parser.bitrate() as f64 - 4_000_000.0).abs() / 4_000_000.0;
        assert!(err < 0.005, "bitrate {} off by {}", parser.bitrate(), err);
    }

    #[test]
    fn test_bitrate_inference_at_eof() {
        // Only ~0.7 s of stream: inference must fall back to the EOF span.
        let stream = CbrStream::new(2000, 188, 4_000_000);
        let file = write_temp(&stream.bytes());

        let parser = TsFileParser::open(file.path()).unwrap();
        let err = (parser.bitrate() as f64 - 4_000_000.0).abs() / 4_000_000.0;
        assert!(err < 0.005, "bitrate {} off by {}", parser.bitrate(), err);
    }

    #[test]
    fn test_bitrate_indeterminate_without_pcrs() {
        // One lone PCR on packet 0 is not a span.
        let stream = CbrStream::new(500, 188, 4_000_000).pcr_interval(1000);
        let file = write_temp(&stream.bytes());
        let err = TsFileParser::open(file.path()).err().unwrap();
        assert!(matches!(err, Error::BitrateIndeterminate(_)), "got {err}");
    }

    #[test]
    fn test_read_serves_all_packets_with_schedule() {
        let stream = CbrStream::new(2000, 188, 4_000_000);
        let file = write_temp(&stream.bytes());
        let mut parser = TsFileParser::open(file.path()).unwrap();
        let bitrate = parser.bitrate();

        let mut total_packets = 0u64;
        let mut collected = Vec::new();
        while let Some(buffer) = parser.read().unwrap() {
            // Timestamps follow the linear CBR schedule across buffer
            // boundaries.
            for i in 0..buffer.packet_count() {
                let n = total_packets + i as u64;
                let expected =
                    (n as u128 * 188 * 8 * PCR_CLOCK_HZ as u128 + bitrate as u128 / 2)
                        / bitrate as u128;
                assert_eq!(buffer.timestamp(i), expected as u64);
            }
            total_packets += buffer.packet_count() as u64;
            collected.extend_from_slice(buffer.as_slice());
        }

        assert_eq!(total_packets, 2000);
        assert_eq!(collected, stream.bytes());
    }

    #[test]
    fn test_estimated_buffers_per_second() {
        let stream = CbrStream::new(2000, 188, 4_000_000);
        let file = write_temp(&stream.bytes());
        let parser = TsFileParser::open(file.path()).unwrap();

        // 4 Mbit/s over ~128 KiB buffers is ~4 buffers/s.
        let per_buffer_bits = (parser.packets_per_buffer() * 188 * 8) as u64;
        assert_eq!(
            parser.estimated_buffers_per_second(),
            (parser.bitrate() / per_buffer_bits) as usize
        );
        assert!(parser.estimated_buffers_per_second() >= 1);
    }
}
