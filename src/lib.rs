//! # tscast
//!
//! Streams CBR MPEG-2 Transport Stream files over IPv4/UDP at the bitrate
//! encoded in the stream's PCRs, framed per SMPTE 2022-2 (seven TS packets
//! per datagram, no RTP header).
//!
//! The pipeline for one stream is
//! `file -> parser -> encapsulator -> muxer stream`, with a bounded SPSC
//! FIFO and a producer/consumer thread pair inside the source. A single
//! [`net::DatagramMuxer`] paces the datagrams of every stream onto one UDP
//! socket in deadline order, in ~4 ms bursts, after a ~40 ms preroll.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tscast::caster::Caster;
//! use tscast::net::MuxerConfig;
//! use tscast::stream::Endpoint;
//!
//! let caster = Caster::new(false, MuxerConfig::default())?;
//! caster.create_stream(
//!     "movie.ts",
//!     Endpoint { ip: "192.168.1.20".parse()?, port: 50_000 },
//! )?;
//! caster.run()?; // returns when every stream finished
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod buffer;
pub mod caster;
pub mod clock;
pub mod error;
pub mod fifo;
pub mod net;
pub mod smpte2022;
pub mod source;
pub mod stream;
pub mod ts;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::caster::Caster;
    pub use crate::error::{Error, Result};
    pub use crate::net::{DatagramMuxer, MuxerConfig};
    pub use crate::stream::{Endpoint, StreamStatus};
}

pub use error::{Error, Result};
