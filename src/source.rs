//! File stream source: threaded producer/consumer around a TS chunk FIFO.
//!
//! The producer thread reads timed TS buffers from the parser and pushes
//! them into a FIFO holding about one second of stream; the consumer thread
//! pops them and feeds the encapsulator, which pushes datagrams to the
//! muxer stream. Backpressure travels the whole chain: a full muxer FIFO
//! blocks the consumer, a full chunk FIFO blocks the producer, and the
//! producer then simply stops reading the file.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::buffer::TsBuffer;
use crate::error::{Error, Result};
use crate::fifo::Fifo;
use crate::smpte2022::{DatagramSink, Smpte2022Encapsulator};
use crate::ts::parser::TsFileParser;

/// Terminal events reported by a source's worker threads.
///
/// Worker threads never panic across their boundary; everything fatal to
/// the stream becomes an event and the source then behaves as if EOF.
#[derive(Debug)]
pub enum SourceEvent {
    /// The file was fully served.
    Eof,
    /// Reading or encapsulation failed; the stream is dead.
    Error(Error),
}

/// Observer callback for [`SourceEvent`]s.
pub type SourceEventFn = dyn Fn(SourceEvent) + Send + Sync;

/// State shared by the control handle and the worker threads.
struct SourceShared {
    fifo: Fifo<TsBuffer>,
    exit: AtomicBool,
    eof: AtomicBool,
}

/// A media stream served from a CBR TS file.
///
/// Constructing the source parses the file (sync + bitrate) and propagates
/// buffering hints downstream; [`start`](Self::start) launches the worker
/// threads.
pub struct FileSource<C: DatagramSink + Send + 'static> {
    name: String,
    bitrate: u64,
    shared: Arc<SourceShared>,
    /// Present while the source is not running; moves into the producer
    /// thread on start and comes back on stop.
    parser: Option<TsFileParser>,
    encapsulator: Arc<Mutex<Smpte2022Encapsulator<C>>>,
    on_event: Arc<SourceEventFn>,
    producer: Option<JoinHandle<TsFileParser>>,
    consumer: Option<JoinHandle<()>>,
}

impl<C: DatagramSink + Send + 'static> FileSource<C> {
    /// Open and parse `path`, wiring datagrams into `sink`.
    pub fn new<P: AsRef<Path>>(path: P, sink: C, on_event: Arc<SourceEventFn>) -> Result<Self> {
        let parser = TsFileParser::open(&path)?;

        let encapsulator = Smpte2022Encapsulator::new(sink);
        encapsulator.set_buffering(parser.estimated_buffers_per_second(), parser.bitrate());

        let shared = Arc::new(SourceShared {
            fifo: Fifo::new(parser.estimated_buffers_per_second()),
            exit: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        });

        Ok(Self {
            name: path.as_ref().display().to_string(),
            bitrate: parser.bitrate(),
            shared,
            parser: Some(parser),
            encapsulator: Arc::new(Mutex::new(encapsulator)),
            on_event,
            producer: None,
            consumer: None,
        })
    }

    /// Launch the producer and consumer threads.
    pub fn start(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Err(Error::InvalidState("source already started".into()));
        }
        let parser = self
            .parser
            .take()
            .ok_or_else(|| Error::InvalidState("source has no parser".into()))?;

        self.shared.exit.store(false, Ordering::Relaxed);
        self.shared.eof.store(false, Ordering::Relaxed);

        self.producer = Some(
            std::thread::Builder::new()
                .name("src-producer".into())
                .spawn({
                    let shared = Arc::clone(&self.shared);
                    let on_event = Arc::clone(&self.on_event);
                    move || producer_loop(parser, &shared, on_event.as_ref())
                })?,
        );
        self.consumer = Some(
            std::thread::Builder::new()
                .name("src-consumer".into())
                .spawn({
                    let shared = Arc::clone(&self.shared);
                    let on_event = Arc::clone(&self.on_event);
                    let encapsulator = Arc::clone(&self.encapsulator);
                    move || consumer_loop(&shared, &encapsulator, on_event.as_ref())
                })?,
        );

        tracing::debug!(source = %self.name, "source started");
        Ok(())
    }

    /// Stop both threads; with `flush` the encapsulator's partial datagram
    /// is pushed downstream and the downstream is drained.
    pub fn stop(&mut self, flush: bool) -> Result<()> {
        let producer = self
            .producer
            .take()
            .ok_or_else(|| Error::InvalidState("source not started".into()))?;

        self.shared.exit.store(true, Ordering::Relaxed);
        self.shared.fifo.unblock_producer(true);
        self.shared.fifo.unblock_consumer(true);

        let parser = producer
            .join()
            .map_err(|_| Error::Internal("source producer thread panicked".into()))?;
        self.parser = Some(parser);
        if let Some(consumer) = self.consumer.take() {
            consumer
                .join()
                .map_err(|_| Error::Internal("source consumer thread panicked".into()))?;
        }
        self.shared.fifo.clear();

        if flush {
            self.encapsulator.lock().unwrap().flush()?;
        }

        tracing::debug!(source = %self.name, flush, "source stopped");
        Ok(())
    }

    /// User-facing source name (the file path).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inferred bitrate of the file in bit/s.
    #[inline]
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }
}

/// Read chunks until EOF, error or exit, pushing them into the FIFO.
fn producer_loop(
    mut parser: TsFileParser,
    shared: &SourceShared,
    on_event: &SourceEventFn,
) -> TsFileParser {
    while !shared.exit.load(Ordering::Relaxed) {
        match parser.read() {
            Ok(Some(buffer)) => {
                if shared.fifo.push(buffer).is_err() {
                    // Unblocked during stop; the chunk is re-read next start.
                    break;
                }
            }
            Ok(None) => {
                shared.eof.store(true, Ordering::Relaxed);
                shared.fifo.unblock_consumer(true);
                break;
            }
            Err(e) => {
                on_event(SourceEvent::Error(e));
                shared.eof.store(true, Ordering::Relaxed);
                shared.fifo.unblock_consumer(true);
                break;
            }
        }
    }
    parser
}

/// Drain the FIFO into the encapsulator; report EOF once the FIFO is empty
/// and the producer finished.
fn consumer_loop<C: DatagramSink + Send + 'static>(
    shared: &SourceShared,
    encapsulator: &Mutex<Smpte2022Encapsulator<C>>,
    on_event: &SourceEventFn,
) {
    while !shared.exit.load(Ordering::Relaxed) {
        if shared.fifo.wait_read_available() > 0 {
            let result = match shared.fifo.front() {
                Some(front) => encapsulator.lock().unwrap().push(front),
                None => Ok(()),
            };
            shared.fifo.pop();
            if let Err(e) = result {
                on_event(SourceEvent::Error(e));
                break;
            }
        } else if shared.eof.load(Ordering::Relaxed) {
            on_event(SourceEvent::Eof);
            break;
        }
        // A zero wait without EOF means stop() unblocked us; the loop
        // condition exits.
    }
}
