//! Timed UDP datagrams.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::buffer::Buffer;
use crate::clock::StreamTime;

/// A UDP payload scheduled for a stream-time deadline.
///
/// The payload buffer is usually a zero-copy child of a parser chunk; the
/// datagram keeps that chunk alive until it has been sent.
#[derive(Clone, Debug)]
pub struct Datagram {
    target: SocketAddr,
    payload: Buffer,
    send_tick: StreamTime,
}

impl Datagram {
    /// Create a datagram with no target yet; the muxer stream it is pushed
    /// to stamps its own endpoint on it.
    pub fn new(payload: Buffer, send_tick: StreamTime) -> Self {
        Self {
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            payload,
            send_tick,
        }
    }

    /// Get the destination endpoint.
    #[inline]
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Set the destination endpoint.
    #[inline]
    pub fn set_target(&mut self, target: SocketAddr) {
        self.target = target;
    }

    /// Get the payload bytes.
    #[inline]
    pub fn payload(&self) -> &Buffer {
        &self.payload
    }

    /// Get the stream-time send deadline.
    #[inline]
    pub fn send_tick(&self) -> StreamTime {
        self.send_tick
    }
}
