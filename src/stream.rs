//! A casting stream: one file source coupled to one muxer stream.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::StreamTime;
use crate::error::{Error, Result};
use crate::net::MuxerStream;
use crate::source::{FileSource, SourceEvent, SourceEventFn};

/// A UDP destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Destination IPv4 address.
    pub ip: Ipv4Addr,
    /// Destination port.
    pub port: u16,
}

impl Endpoint {
    /// Convert to a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Public status record of a stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Stream id, unique within the supervisor.
    pub id: u32,
    /// Source file path.
    pub source: String,
    /// Destination endpoint.
    pub endpoint: Endpoint,
}

/// What ended a stream.
#[derive(Debug)]
pub enum StreamEventKind {
    /// The source file was fully served.
    Eof,
    /// The stream died on an error.
    Error(Error),
}

/// Completion event delivered to the supervisor's event channel.
#[derive(Debug)]
pub struct StreamEvent {
    /// Id of the stream the event is about.
    pub stream_id: u32,
    /// What happened.
    pub kind: StreamEventKind,
}

/// Lifecycle object coupling a [`FileSource`] and a [`MuxerStream`].
///
/// Source events are forwarded to the supervisor's completion channel
/// tagged with the stream id, so teardown happens on the supervisor's main
/// loop rather than on a worker thread holding downstream locks.
pub struct Stream {
    id: u32,
    source: FileSource<Arc<MuxerStream>>,
    muxer_stream: Arc<MuxerStream>,
    endpoint: Endpoint,
}

impl Stream {
    /// Build a stream with the given id, wiring source events into
    /// `events`.
    pub fn new<P: AsRef<Path>>(
        id: u32,
        source_path: P,
        muxer_stream: Arc<MuxerStream>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<Self> {
        let target = muxer_stream.target();
        let endpoint = match target {
            SocketAddr::V4(v4) => Endpoint {
                ip: *v4.ip(),
                port: v4.port(),
            },
            SocketAddr::V6(_) => {
                return Err(Error::InvalidState("IPv6 targets are not supported".into()))
            }
        };

        let on_event: Arc<SourceEventFn> = Arc::new(move |event| {
            let kind = match event {
                SourceEvent::Eof => StreamEventKind::Eof,
                SourceEvent::Error(e) => StreamEventKind::Error(e),
            };
            // The supervisor may already be gone during shutdown.
            let _ = events.send(StreamEvent {
                stream_id: id,
                kind,
            });
        });

        let source = FileSource::new(source_path, Arc::clone(&muxer_stream), on_event)?;

        Ok(Self {
            id,
            source,
            muxer_stream,
            endpoint,
        })
    }

    /// Stream id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Status record for listings and the REST facade.
    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            id: self.id,
            source: self.source.name().to_string(),
            endpoint: self.endpoint,
        }
    }

    /// Current stream position (send tick of the last sent datagram).
    pub fn time(&self) -> StreamTime {
        self.muxer_stream.time()
    }

    /// Inferred bitrate of the source file in bit/s.
    pub fn bitrate(&self) -> u64 {
        self.source.bitrate()
    }

    /// Start the source.
    pub fn start(&mut self) -> Result<()> {
        self.source.start()
    }

    /// Stop the source and detach from the muxer.
    ///
    /// With `flush`, blocks until everything buffered (including a partial
    /// trailing datagram) has left the socket.
    pub fn shutdown(&mut self, flush: bool) -> Result<()> {
        let result = self.source.stop(flush);
        self.muxer_stream.close();
        result
    }
}
