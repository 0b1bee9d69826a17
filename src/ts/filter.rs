//! PCR accumulation for bitrate inference.

use std::collections::HashMap;

use super::TsPacket;
use crate::buffer::TsBuffer;

/// One PCR sample: counter value and the byte offset of its packet within
/// the whole stream.
#[derive(Clone, Copy, Debug)]
struct PcrSample {
    pcr: u64,
    position: u64,
}

/// First-to-last PCR span of one PID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcrSpan {
    /// PID carrying the PCRs.
    pub pid: u16,
    /// Distance between first and last PCR in 27 MHz ticks.
    pub ticks: u64,
    /// Distance between first and last PCR-bearing packet in bytes.
    pub bytes: u64,
}

/// Walks TS buffers and records `(pcr, byte_offset)` of every PCR-bearing
/// packet, per PID.
#[derive(Default)]
pub struct PcrFilter {
    pids: HashMap<u16, Vec<PcrSample>>,
}

impl PcrFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a buffer whose first byte sits at `base_position` in the stream
    /// and record all PCRs found.
    pub fn push(&mut self, buffer: &TsBuffer, base_position: u64) {
        let packet_size = buffer.packet_size();
        for index in 0..buffer.packet_count() {
            let packet = TsPacket::new(buffer.packet(index));
            if packet.has_pcr() {
                self.pids.entry(packet.pid()).or_default().push(PcrSample {
                    pcr: packet.pcr(),
                    position: base_position + (index * packet_size) as u64,
                });
            }
        }
    }

    /// Get the PID with the greatest first-to-last PCR distance.
    ///
    /// PIDs with fewer than two PCRs, or whose PCRs have not advanced, are
    /// ignored. Returns `None` when no PID qualifies.
    pub fn max_span(&self) -> Option<PcrSpan> {
        let mut best: Option<PcrSpan> = None;
        for (&pid, samples) in &self.pids {
            if samples.len() < 2 {
                continue;
            }
            let first = samples[0];
            let last = samples[samples.len() - 1];
            let ticks = super::pcr_sub(first.pcr, last.pcr);
            if ticks == 0 {
                continue;
            }
            if best.map_or(true, |b| ticks > b.ticks) {
                best = Some(PcrSpan {
                    pid,
                    ticks,
                    bytes: last.position - first.position,
                });
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::gen::CbrStream;
    use crate::ts::PCR_CLOCK_HZ;

    #[test]
    fn test_empty_filter_has_no_span() {
        let filter = PcrFilter::new();
        assert_eq!(filter.max_span(), None);
    }

    #[test]
    fn test_single_pcr_is_not_enough() {
        // 10 packets with one PCR every 20 packets: only packet 0 has one.
        let stream = CbrStream::new(10, 188, 4_000_000).pcr_interval(20);
        let mut filter = PcrFilter::new();
        filter.push(&stream.ts_buffer(), 0);
        assert_eq!(filter.max_span(), None);
    }

    #[test]
    fn test_span_matches_generated_cadence() {
        // 1000 packets at 4 Mbit/s, PCR every 50 packets on PID 0x0100.
        let stream = CbrStream::new(1000, 188, 4_000_000).pcr_interval(50);
        let mut filter = PcrFilter::new();
        filter.push(&stream.ts_buffer(), 0);

        let span = filter.max_span().unwrap();
        assert_eq!(span.pid, 0x0100);
        // Last PCR is on packet 950.
        assert_eq!(span.bytes, 950 * 188);
        // 950 packets at 4 Mbit/s are 950*188*8/4e6 s of stream.
        let expected_ticks = 950u64 * 188 * 8 * PCR_CLOCK_HZ / 4_000_000;
        assert!((span.ticks as i64 - expected_ticks as i64).abs() <= 1);
    }

    #[test]
    fn test_positions_accumulate_across_buffers() {
        let stream = CbrStream::new(400, 188, 4_000_000).pcr_interval(100);
        let full = stream.ts_buffer();

        let mut filter = PcrFilter::new();
        // Feed the same stream split in two buffers of 200 packets.
        filter.push(&full.child(0, 200), 0);
        filter.push(&full.child(200, 200), 200 * 188);

        let span = filter.max_span().unwrap();
        assert_eq!(span.bytes, 300 * 188);
    }
}
