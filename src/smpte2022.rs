//! SMPTE 2022-2 encapsulation: seven TS packets per UDP payload.
//!
//! Aligned runs of seven packets become zero-copy child views of the input
//! buffer; a trailing run of one to six packets is copied into a
//! carry-over payload completed by the next buffer. The RTP header of
//! SMPTE 2022-2 is not produced.

use crate::buffer::TsBuffer;
use crate::clock::StreamTime;
use crate::error::Result;
use crate::net::Datagram;
use crate::ts::ticks_to_time;

/// TS packets per UDP datagram.
pub const TS_PER_DATAGRAM: usize = 7;

/// Downstream consumer of timed datagrams (a muxer stream).
pub trait DatagramSink {
    /// Enqueue a datagram; may block as backpressure.
    fn push(&self, datagram: Datagram) -> Result<()>;

    /// Block until everything enqueued so far has been processed.
    fn flush(&self);

    /// Hint the expected producer rate so queues can be sized.
    fn set_buffering(&self, datagrams_per_second: usize, bitrate: u64);
}

impl<S: DatagramSink + ?Sized> DatagramSink for std::sync::Arc<S> {
    fn push(&self, datagram: Datagram) -> Result<()> {
        (**self).push(datagram)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn set_buffering(&self, datagrams_per_second: usize, bitrate: u64) {
        (**self).set_buffering(datagrams_per_second, bitrate)
    }
}

/// A partially assembled datagram carried across input buffers.
///
/// Its deadline is the timestamp of the first packet copied into it.
struct Partial {
    payload: TsBuffer,
    send_tick: StreamTime,
}

/// Re-frames TS buffers into SMPTE 2022-2 datagrams and pushes them
/// downstream.
pub struct Smpte2022Encapsulator<C: DatagramSink> {
    consumer: C,
    partial: Option<Partial>,
}

impl<C: DatagramSink> Smpte2022Encapsulator<C> {
    /// Create an encapsulator feeding `consumer`.
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            partial: None,
        }
    }

    /// Encapsulate one buffer of TS packets.
    pub fn push(&mut self, buffer: &TsBuffer) -> Result<()> {
        let packet_size = buffer.packet_size();
        let num_packets = buffer.packet_count();
        let mut index = 0;

        if let Some(partial) = self.partial.as_mut() {
            let missing = TS_PER_DATAGRAM - partial.payload.packet_count();
            let take = missing.min(num_packets);
            partial
                .payload
                .append_packets(&buffer.as_slice()[..take * packet_size]);
            index = take;

            if partial.payload.packet_count() == TS_PER_DATAGRAM {
                let done = self.partial.take().unwrap();
                self.consumer
                    .push(Datagram::new(done.payload.into_buffer(), done.send_tick))?;
            }
        }

        while index + TS_PER_DATAGRAM <= num_packets {
            let payload = buffer.child(index, TS_PER_DATAGRAM).into_buffer();
            let send_tick = ticks_to_time(buffer.timestamp(index));
            self.consumer.push(Datagram::new(payload, send_tick))?;
            index += TS_PER_DATAGRAM;
        }

        if index < num_packets {
            let mut payload = TsBuffer::alloc(TS_PER_DATAGRAM, packet_size);
            payload.append_packets(&buffer.as_slice()[index * packet_size..]);
            self.partial = Some(Partial {
                payload,
                send_tick: ticks_to_time(buffer.timestamp(index)),
            });
        }

        Ok(())
    }

    /// Push any partial datagram downstream regardless of fullness, then
    /// flush the consumer.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(partial) = self.partial.take() {
            self.consumer
                .push(Datagram::new(partial.payload.into_buffer(), partial.send_tick))?;
        }
        self.consumer.flush();
        Ok(())
    }

    /// Propagate buffering hints downstream in datagrams per second.
    pub fn set_buffering(&self, _buffers_per_second: usize, bitrate: u64) {
        let datagrams_per_second = bitrate / (TS_PER_DATAGRAM as u64 * 8 * 188);
        self.consumer
            .set_buffering(datagrams_per_second as usize, bitrate);
    }
}
