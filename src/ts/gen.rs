//! Synthetic CBR transport stream generation.
//!
//! Produces runs of null packets with a PCR-bearing PID at a fixed cadence,
//! stamped for an exact constant bitrate. Used by the test suite and handy
//! for bench/demo streams; never needed on the casting path.

use std::io::Write;
use std::path::Path;

use super::{PCR_CLOCK_HZ, SYNC_BYTE};
use crate::buffer::{Buffer, TsBuffer};

/// The stuffing PID.
const NULL_PID: u16 = 0x1FFF;

/// Builder for a synthetic CBR stream.
#[derive(Clone, Debug)]
pub struct CbrStream {
    num_packets: usize,
    packet_size: usize,
    bitrate: u64,
    pcr_pid: u16,
    pcr_interval: usize,
}

impl CbrStream {
    /// Describe a stream of `num_packets` packets of `packet_size` bytes
    /// (188 or 204) at `bitrate` bit/s.
    ///
    /// Defaults: PCRs on PID 0x0100, one PCR every 40 packets.
    pub fn new(num_packets: usize, packet_size: usize, bitrate: u64) -> Self {
        assert!(packet_size == 188 || packet_size == 204);
        assert!(bitrate > 0);
        Self {
            num_packets,
            packet_size,
            bitrate,
            pcr_pid: 0x0100,
            pcr_interval: 40,
        }
    }

    /// Set the PID carrying PCRs.
    pub fn pcr_pid(mut self, pid: u16) -> Self {
        self.pcr_pid = pid;
        self
    }

    /// Set the PCR cadence in packets.
    pub fn pcr_interval(mut self, packets: usize) -> Self {
        assert!(packets > 0);
        self.pcr_interval = packets;
        self
    }

    /// 27 MHz tick of packet `n` for the configured bitrate.
    fn ticks_of(&self, n: usize) -> u64 {
        let bits = n as u128 * self.packet_size as u128 * 8;
        ((bits * PCR_CLOCK_HZ as u128 + self.bitrate as u128 / 2) / self.bitrate as u128) as u64
    }

    fn render_packet(&self, n: usize, out: &mut [u8]) {
        out.fill(0xFF);
        out[0] = SYNC_BYTE;

        if n % self.pcr_interval == 0 {
            // PCR packet: adaptation field + payload, PCR flag set.
            out[1] = (self.pcr_pid >> 8) as u8 & 0x1F;
            out[2] = (self.pcr_pid & 0xFF) as u8;
            out[3] = 0x30 | ((n / self.pcr_interval) as u8 & 0x0F);
            out[4] = 7; // adaptation field length
            out[5] = 0x10; // PCR flag

            let ticks = self.ticks_of(n);
            let base = ticks / 300;
            let ext = ticks % 300;
            out[6] = (base >> 25) as u8;
            out[7] = (base >> 17) as u8;
            out[8] = (base >> 9) as u8;
            out[9] = (base >> 1) as u8;
            out[10] = (((base & 1) << 7) as u8) | 0x7E | ((ext >> 8) as u8 & 0x01);
            out[11] = (ext & 0xFF) as u8;
        } else {
            // Null packet, payload only.
            out[1] = (NULL_PID >> 8) as u8 & 0x1F;
            out[2] = (NULL_PID & 0xFF) as u8;
            out[3] = 0x10 | (n as u8 & 0x0F);
        }

        if self.packet_size == 204 {
            // Placeholder FEC block.
            out[188..].fill(0);
        }
    }

    /// Render the whole stream to bytes.
    pub fn bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.num_packets * self.packet_size];
        for n in 0..self.num_packets {
            self.render_packet(n, &mut data[n * self.packet_size..(n + 1) * self.packet_size]);
        }
        data
    }

    /// Render into a [`TsBuffer`] with exact per-packet timestamps.
    pub fn ts_buffer(&self) -> TsBuffer {
        let data = self.bytes();
        let mut buffer = Buffer::alloc(data.len());
        buffer.space_mut().copy_from_slice(&data);
        let timestamps = (0..self.num_packets).map(|n| self.ticks_of(n)).collect();
        TsBuffer::from_parts(buffer, self.packet_size, self.num_packets, timestamps)
    }

    /// Write the stream to a file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.bytes())?;
        file.flush()
    }

    /// Total size of the rendered stream in bytes.
    pub fn len(&self) -> usize {
        self.num_packets * self.packet_size
    }

    /// Whether the stream has no packets.
    pub fn is_empty(&self) -> bool {
        self.num_packets == 0
    }

    /// The configured bitrate in bit/s.
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }
}
