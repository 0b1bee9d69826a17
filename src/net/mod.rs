//! UDP output: datagrams, the sending socket, and the timed muxer.

pub mod datagram;
pub mod muxer;
pub mod udp;

pub use datagram::Datagram;
pub use muxer::{DatagramMuxer, MuxerConfig, MuxerStream};
pub use udp::UdpSender;
