//! The supervisor: owns every stream and the muxer, drives the main loop.

use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::{DatagramMuxer, MuxerConfig};
use crate::stream::{Endpoint, Stream, StreamEvent, StreamEventKind, StreamStatus};

/// Main-loop tick when running interactively.
const MAIN_LOOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Main-loop tick in service mode, where no status line is printed.
const MAIN_LOOP_TIMEOUT_SERVICE: Duration = Duration::from_secs(1);

/// Supervisor of the casting process.
///
/// Owns the muxer and the stream list, serves create/list/delete requests
/// (from the CLI or the REST facade) and runs the main loop that collects
/// stream completion events. EOF and error events tear streams down here,
/// on the main loop, never on the worker thread that raised them.
pub struct Caster {
    muxer: DatagramMuxer,
    streams: Mutex<Vec<Stream>>,
    next_id: AtomicU32,
    events_tx: mpsc::Sender<StreamEvent>,
    events_rx: Mutex<mpsc::Receiver<StreamEvent>>,
    service_mode: bool,
    main_loop_timeout: Duration,
    failed_streams: AtomicU32,
}

impl Caster {
    /// Create a supervisor.
    ///
    /// In service mode the main loop never exits and prints no status; in
    /// interactive mode it exits once the stream list empties.
    pub fn new(service_mode: bool, muxer_config: MuxerConfig) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::channel();
        Ok(Self {
            muxer: DatagramMuxer::new(muxer_config)?,
            streams: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            events_tx,
            events_rx: Mutex::new(events_rx),
            service_mode,
            main_loop_timeout: if service_mode {
                MAIN_LOOP_TIMEOUT_SERVICE
            } else {
                MAIN_LOOP_TIMEOUT
            },
            failed_streams: AtomicU32::new(0),
        })
    }

    /// Create and start a stream casting `source` to `endpoint`.
    pub fn create_stream<P: AsRef<Path>>(
        &self,
        source: P,
        endpoint: Endpoint,
    ) -> Result<StreamStatus> {
        let mut streams = self.streams.lock().unwrap();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let muxer_stream = self.muxer.create_stream(endpoint.socket_addr());

        let mut stream =
            match Stream::new(id, source, Arc::clone(&muxer_stream), self.events_tx.clone()) {
                Ok(stream) => stream,
                Err(e) => {
                    muxer_stream.close();
                    return Err(e);
                }
            };
        if let Err(e) = stream.start() {
            muxer_stream.close();
            return Err(e);
        }

        let status = stream.status();
        streams.push(stream);

        tracing::info!(
            id,
            source = %status.source,
            target = %status.endpoint,
            "stream created"
        );
        Ok(status)
    }

    /// Stop and remove the stream with `id`.
    ///
    /// With `flush`, blocks until everything the stream buffered has been
    /// sent.
    pub fn delete_stream(&self, id: u32, flush: bool) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let index = streams
            .iter()
            .position(|s| s.id() == id)
            .ok_or(Error::StreamNotFound(id))?;

        let result = streams[index].shutdown(flush);
        streams.remove(index);

        tracing::info!(id, "stream deleted");
        result
    }

    /// Snapshot of all stream statuses.
    pub fn list_streams(&self) -> Vec<StreamStatus> {
        self.streams.lock().unwrap().iter().map(Stream::status).collect()
    }

    /// Number of active streams.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Current output bandwidth in bit/s and largest recent inter-burst
    /// gap.
    pub fn output_bandwidth(&self) -> (u64, Duration) {
        self.muxer.output_bandwidth()
    }

    /// Main loop: tick, collect completion events, print status, exit when
    /// idle (interactive mode only).
    pub fn run(&self) -> Result<()> {
        loop {
            std::thread::sleep(self.main_loop_timeout);

            self.collect_events();

            if !self.service_mode {
                self.print_status();
                if self.stream_count() == 0 {
                    break;
                }
            }
        }
        println!();

        let failed = self.failed_streams.load(Ordering::Relaxed);
        if failed > 0 {
            return Err(Error::Internal(format!("{failed} stream(s) failed")));
        }
        Ok(())
    }

    /// Drain the completion channel and tear finished streams down.
    fn collect_events(&self) {
        loop {
            let event = match self.events_rx.lock().unwrap().try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };

            let flush = match &event.kind {
                StreamEventKind::Eof => {
                    tracing::info!(id = event.stream_id, "stream reached end of file");
                    true
                }
                StreamEventKind::Error(e) => {
                    tracing::error!(id = event.stream_id, error = %e, "stream failed");
                    self.failed_streams.fetch_add(1, Ordering::Relaxed);
                    false
                }
            };

            match self.delete_stream(event.stream_id, flush) {
                Ok(()) => {}
                // Already deleted explicitly; the event raced the delete.
                Err(Error::StreamNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(id = event.stream_id, error = %e, "stream teardown failed")
                }
            }
        }
    }

    /// One-line interactive status.
    fn print_status(&self) {
        let (bandwidth, max_burst) = self.muxer.output_bandwidth();
        tracing::debug!(stats = %self.muxer.send_stats(), "send stats");

        let streams = self.streams.lock().unwrap();
        let Some(first) = streams.first() else {
            return;
        };
        let time = first.time();
        let secs = time.secs();

        print!(
            "\rIP casting {} streams. Time {:02}:{:02}:{:02}.{} Bandwidth {:.3} Mbit/s Burst {:.1} ms   ",
            streams.len(),
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            (time.millis() / 100) % 10,
            bandwidth as f64 / 1e6,
            max_burst.as_secs_f64() * 1000.0,
        );
        let _ = std::io::stdout().flush();
    }
}
