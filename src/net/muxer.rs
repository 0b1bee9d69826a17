//! Deadline-ordered datagram multiplexing onto one UDP socket.
//!
//! The muxer owns two threads:
//!
//! - the **prepare thread** round-robins over all muxer streams and moves
//!   every datagram eligible within the next preroll window into a shared,
//!   time-ordered burst list;
//! - the **send thread** wakes every burst period, takes the prefix of the
//!   burst list whose deadlines have passed and puts it on the socket.
//!
//! Splitting the two keeps a slow traversal of many streams from starving
//! the send cadence. The burst list is guarded by a spinlock: both critical
//! sections are a single append or a prefix take, far shorter than the
//! 4 ms cadence.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::datagram::Datagram;
use super::udp::UdpSender;
use crate::clock::{PeriodicTimer, StreamTime};
use crate::error::Result;
use crate::fifo::Fifo;
use crate::smpte2022::DatagramSink;

/// Timing parameters of the muxer.
#[derive(Clone, Copy, Debug)]
pub struct MuxerConfig {
    /// Send-thread cadence; the minimum pacing granularity.
    pub burst_period: Duration,
    /// Stream time buffered before a stream's first datagram is released.
    pub preroll: Duration,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            burst_period: Duration::from_millis(4),
            preroll: Duration::from_millis(40),
        }
    }
}

/// Minimal test-and-set lock for the prepared burst list.
///
/// Contended only between the prepare and send threads; both yield while
/// the other side holds it.
struct SpinLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        while self.flag.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
        SpinGuard { lock: self }
    }
}

struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

impl<T> std::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> std::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

/// One prepared datagram with its wall-clock deadline.
struct BurstEntry {
    datagram: Datagram,
    deadline: Instant,
}

/// Send-loop timing extremes, all in nanoseconds (relaxed atomics; pure
/// observability).
#[derive(Default)]
struct SendStats {
    min_timer_ns: AtomicU64,
    max_timer_ns: AtomicU64,
    min_prepare_ns: AtomicU64,
    max_prepare_ns: AtomicU64,
    min_send_ns: AtomicU64,
    max_send_ns: AtomicU64,
    high_burst_count: AtomicU32,
}

impl SendStats {
    fn new() -> Self {
        let stats = Self::default();
        stats.min_timer_ns.store(u64::MAX, Ordering::Relaxed);
        stats.min_prepare_ns.store(u64::MAX, Ordering::Relaxed);
        stats.min_send_ns.store(u64::MAX, Ordering::Relaxed);
        stats
    }

    fn record(
        &self,
        timer_delta: Duration,
        prepare_time: Duration,
        send_time: Duration,
        burst_period: Duration,
    ) {
        let timer_ns = timer_delta.as_nanos() as u64;
        let prepare_ns = prepare_time.as_nanos() as u64;
        let send_ns = send_time.as_nanos() as u64;

        self.min_timer_ns.fetch_min(timer_ns, Ordering::Relaxed);
        self.max_timer_ns.fetch_max(timer_ns, Ordering::Relaxed);
        self.min_prepare_ns.fetch_min(prepare_ns, Ordering::Relaxed);
        self.max_prepare_ns.fetch_max(prepare_ns, Ordering::Relaxed);
        self.min_send_ns.fetch_min(send_ns, Ordering::Relaxed);
        self.max_send_ns.fetch_max(send_ns, Ordering::Relaxed);

        if timer_delta >= burst_period + Duration::from_millis(2) {
            self.high_burst_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                timer_ms = timer_ns as f64 / 1e6,
                prepare_ms = prepare_ns as f64 / 1e6,
                send_ms = send_ns as f64 / 1e6,
                "high burst period"
            );
        }
    }
}

/// Snapshot of the send-loop statistics.
#[derive(Clone, Copy, Debug)]
pub struct SendStatsSnapshot {
    /// Min/max observed timer delta.
    pub timer: (Duration, Duration),
    /// Min/max observed burst-prepare time.
    pub prepare: (Duration, Duration),
    /// Min/max observed burst-send time.
    pub send: (Duration, Duration),
    /// Bursts whose timer delta exceeded the period by 2 ms or more.
    pub high_burst_count: u32,
}

impl std::fmt::Display for SendStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        write!(
            f,
            "timer(ms) [{:.3},{:.3}] prepare [{:.3},{:.3}] send [{:.3},{:.3}] highburst {}",
            ms(self.timer.0),
            ms(self.timer.1),
            ms(self.prepare.0),
            ms(self.prepare.1),
            ms(self.send.0),
            ms(self.send.1),
            self.high_burst_count
        )
    }
}

/// State shared between the muxer handle, its threads and its streams.
struct MuxerShared {
    config: MuxerConfig,
    streams: Mutex<Vec<Arc<MuxerStream>>>,
    prepared: SpinLock<VecDeque<BurstEntry>>,
    exit: AtomicBool,
    /// Counter of completed send rounds; the prepare thread waits on it.
    send_done: (Mutex<u64>, Condvar),
    stats: SendStats,
    /// Sliding window of `(burst time, burst bytes)` covering about 1 s.
    window: Mutex<VecDeque<(Instant, usize)>>,
}

impl MuxerShared {
    fn signal_send_done(&self) {
        let (lock, cvar) = &self.send_done;
        *lock.lock().unwrap() += 1;
        cvar.notify_one();
    }
}

/// Per-destination stream of timed datagrams inside the muxer.
///
/// A producer (the encapsulator, on the source's consumer thread) pushes
/// datagrams; the muxer's prepare thread pops them when their deadline
/// falls inside the preroll horizon. A full FIFO blocks the producer,
/// which is the backpressure that paces parsing to the send rate.
pub struct MuxerStream {
    target: SocketAddr,
    fifo: OnceLock<Fifo<Datagram>>,
    /// Stream-time origin in ns: the send tick of the first pushed
    /// datagram. u64::MAX until set.
    sync_point: AtomicU64,
    /// Wall-clock origin; owned by the prepare thread.
    start_point: Mutex<Option<Instant>>,
    /// Send tick of the newest datagram in the FIFO, in ns.
    tail_send_tick: AtomicU64,
    /// Send tick of the last popped datagram, in ns (stream position).
    last_popped_tick: AtomicU64,
    /// Release the stream even below preroll (set by flush).
    flushing: AtomicBool,
    closed: AtomicBool,
    preroll: Duration,
    muxer: Weak<MuxerShared>,
}

/// FIFO capacity used when a datagram arrives before `set_buffering`.
const MIN_FIFO_DATAGRAMS: usize = 16;

impl MuxerStream {
    fn new(target: SocketAddr, preroll: Duration, muxer: Weak<MuxerShared>) -> Self {
        Self {
            target,
            fifo: OnceLock::new(),
            sync_point: AtomicU64::new(u64::MAX),
            start_point: Mutex::new(None),
            tail_send_tick: AtomicU64::new(0),
            last_popped_tick: AtomicU64::new(u64::MAX),
            flushing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            preroll,
            muxer,
        }
    }

    /// Get the destination endpoint.
    #[inline]
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn fifo(&self) -> &Fifo<Datagram> {
        self.fifo.get_or_init(|| Fifo::new(MIN_FIFO_DATAGRAMS))
    }

    /// Stream time of datagrams currently buffered in the FIFO.
    fn buffered_time(&self) -> Duration {
        match self.fifo.get().and_then(|f| f.front()) {
            Some(front) => {
                let tail = StreamTime::from_nanos(self.tail_send_tick.load(Ordering::Relaxed));
                Duration::from(tail - front.send_tick())
            }
            None => Duration::ZERO,
        }
    }

    /// Pop the front datagram if its deadline has passed.
    ///
    /// `now` is the prepare horizon. Nothing is eligible until the stream
    /// has both its origins: the sync point (first push) and the start
    /// point, set here once at least `preroll` of stream time is buffered.
    /// Called only from the prepare thread.
    fn pop_eligible(&self, now: Instant) -> Option<(Datagram, Instant)> {
        let fifo = self.fifo.get()?;
        if fifo.read_available() == 0 {
            return None;
        }

        let mut start = self.start_point.lock().unwrap();
        let start_point = match *start {
            Some(point) => point,
            None => {
                if !self.flushing.load(Ordering::Relaxed) && self.buffered_time() < self.preroll {
                    return None;
                }
                *start = Some(now);
                now
            }
        };
        drop(start);

        // The sync point was stored before the first push became visible.
        let sync = StreamTime::from_nanos(self.sync_point.load(Ordering::Acquire));
        let front_tick = fifo.front()?.send_tick();
        let deadline = start_point + Duration::from(front_tick - sync);
        if deadline < now {
            let datagram = fifo.pop()?;
            self.last_popped_tick
                .store(datagram.send_tick().nanos(), Ordering::Relaxed);
            Some((datagram, deadline))
        } else {
            None
        }
    }

    /// Current stream position: the send tick of the last sent datagram
    /// relative to the stream origin.
    pub fn time(&self) -> StreamTime {
        let popped = self.last_popped_tick.load(Ordering::Relaxed);
        let sync = self.sync_point.load(Ordering::Relaxed);
        if popped == u64::MAX || sync == u64::MAX {
            return StreamTime::ZERO;
        }
        StreamTime::from_nanos(popped) - StreamTime::from_nanos(sync)
    }

    /// Block until every buffered datagram has been handed to the sender.
    ///
    /// Also releases the preroll gate so short tails drain even when less
    /// than `preroll` of stream time was ever buffered.
    pub fn flush(&self) {
        self.flushing.store(true, Ordering::Relaxed);
        while !self.closed.load(Ordering::Relaxed)
            && self.muxer.strong_count() > 0
            && self.fifo.get().is_some_and(|f| f.read_available() > 0)
        {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Remove this stream from the muxer and unblock a producer stuck in
    /// push.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(fifo) = self.fifo.get() {
            fifo.unblock_producer(true);
        }
        if let Some(shared) = self.muxer.upgrade() {
            let mut streams = shared.streams.lock().unwrap();
            streams.retain(|s| !std::ptr::eq(Arc::as_ptr(s), self as *const _));
        }
    }
}

impl DatagramSink for MuxerStream {
    /// Enqueue a datagram, blocking while the FIFO is full.
    ///
    /// The first push fixes the stream's sync point. The datagram's target
    /// is overwritten with this stream's endpoint.
    fn push(&self, mut datagram: Datagram) -> Result<()> {
        if self.sync_point.load(Ordering::Relaxed) == u64::MAX {
            self.sync_point
                .store(datagram.send_tick().nanos(), Ordering::Release);
        }

        datagram.set_target(self.target);
        let tick = datagram.send_tick();

        // Err means we were unblocked during close; the datagram is dropped.
        if self.fifo().push(datagram).is_ok() {
            self.tail_send_tick.store(tick.nanos(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush(&self) {
        MuxerStream::flush(self);
    }

    /// Size the FIFO for about one second of datagrams. Effective only
    /// before the first push.
    fn set_buffering(&self, datagrams_per_second: usize, _bitrate: u64) {
        let capacity = datagrams_per_second.max(MIN_FIFO_DATAGRAMS);
        if self.fifo.set(Fifo::new(capacity)).is_err() {
            tracing::warn!(target = %self.target, "buffering set after first push, ignored");
        }
    }
}

/// Timed multiplexer of many datagram streams onto one UDP socket.
pub struct DatagramMuxer {
    shared: Arc<MuxerShared>,
    prepare_thread: Option<JoinHandle<()>>,
    send_thread: Option<JoinHandle<()>>,
}

impl DatagramMuxer {
    /// Open the socket and start the prepare and send threads.
    pub fn new(config: MuxerConfig) -> Result<Self> {
        let sender = UdpSender::new()?;

        let shared = Arc::new(MuxerShared {
            config,
            streams: Mutex::new(Vec::new()),
            prepared: SpinLock::new(VecDeque::new()),
            exit: AtomicBool::new(false),
            send_done: (Mutex::new(0), Condvar::new()),
            stats: SendStats::new(),
            window: Mutex::new(VecDeque::new()),
        });

        let prepare_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("mux-prepare".into())
                .spawn(move || prepare_loop(&shared))?
        };
        let send_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("mux-send".into())
                .spawn(move || send_loop(&shared, sender))?
        };

        Ok(Self {
            shared,
            prepare_thread: Some(prepare_thread),
            send_thread: Some(send_thread),
        })
    }

    /// Create a stream sending to `target`.
    pub fn create_stream(&self, target: SocketAddr) -> Arc<MuxerStream> {
        let stream = Arc::new(MuxerStream::new(
            target,
            self.shared.config.preroll,
            Arc::downgrade(&self.shared),
        ));
        self.shared.streams.lock().unwrap().push(Arc::clone(&stream));
        stream
    }

    /// Snapshot of the muxer's streams.
    pub fn streams(&self) -> Vec<Arc<MuxerStream>> {
        self.shared.streams.lock().unwrap().clone()
    }

    /// Current output bandwidth in bit/s and the largest gap between
    /// bursts, both over the last ~1 s window.
    pub fn output_bandwidth(&self) -> (u64, Duration) {
        let window: Vec<(Instant, usize)> = {
            let guard = self.shared.window.lock().unwrap();
            guard.iter().copied().collect()
        };

        if window.len() < 2 {
            return (0, Duration::ZERO);
        }

        let mut bytes = 0usize;
        let mut max_gap = Duration::ZERO;
        let mut prev: Option<Instant> = None;
        for &(t, size) in &window {
            if let Some(p) = prev {
                max_gap = max_gap.max(t - p);
            }
            bytes += size;
            prev = Some(t);
        }

        let span = window[window.len() - 1].0 - window[0].0;
        if span.is_zero() {
            return (0, max_gap);
        }
        let bitrate = (bytes as u128 * 8 * 1_000_000_000 / span.as_nanos()) as u64;
        (bitrate, max_gap)
    }

    /// Snapshot of the send-loop timing statistics.
    pub fn send_stats(&self) -> SendStatsSnapshot {
        let s = &self.shared.stats;
        let load = |a: &AtomicU64| Duration::from_nanos(a.load(Ordering::Relaxed));
        let min = |a: &AtomicU64| {
            let v = a.load(Ordering::Relaxed);
            Duration::from_nanos(if v == u64::MAX { 0 } else { v })
        };
        SendStatsSnapshot {
            timer: (min(&s.min_timer_ns), load(&s.max_timer_ns)),
            prepare: (min(&s.min_prepare_ns), load(&s.max_prepare_ns)),
            send: (min(&s.min_send_ns), load(&s.max_send_ns)),
            high_burst_count: s.high_burst_count.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DatagramMuxer {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Relaxed);
        self.shared.signal_send_done();
        if let Some(handle) = self.prepare_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.send_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Move every datagram eligible inside the preroll horizon into the
/// prepared burst, in across-stream round-robin order, then wait for the
/// next send round.
fn prepare_loop(shared: &MuxerShared) {
    let (lock, cvar) = &shared.send_done;
    let mut seen = *lock.lock().unwrap();

    while !shared.exit.load(Ordering::Relaxed) {
        let horizon = Instant::now() + shared.config.preroll;

        loop {
            let mut any = false;
            let streams = shared.streams.lock().unwrap();
            for stream in streams.iter() {
                while let Some((datagram, deadline)) = stream.pop_eligible(horizon) {
                    shared
                        .prepared
                        .lock()
                        .push_back(BurstEntry { datagram, deadline });
                    any = true;
                }
            }
            drop(streams);
            if !any {
                break;
            }
        }

        // Wait for the send thread to finish a round. The timeout bounds
        // the latency of seeing a newly created stream or the exit flag.
        let guard = lock.lock().unwrap();
        if *guard == seen {
            let (guard, _) = cvar
                .wait_timeout(guard, shared.config.burst_period)
                .unwrap();
            seen = *guard;
        } else {
            seen = *guard;
        }
    }
}

/// Wake every burst period, send the due prefix of the prepared burst,
/// keep the stats and signal the prepare thread.
fn send_loop(shared: &MuxerShared, sender: UdpSender) {
    let timer = PeriodicTimer::new(shared.config.burst_period);
    let mut t_last_burst: Option<Instant> = None;
    let mut burst: Vec<BurstEntry> = Vec::new();

    while !shared.exit.load(Ordering::Relaxed) {
        let now = timer.wait();

        {
            let mut prepared = shared.prepared.lock();
            while prepared.front().is_some_and(|e| e.deadline < now) {
                if let Some(entry) = prepared.pop_front() {
                    burst.push(entry);
                }
            }
        }
        let t_prepare = Instant::now();

        let mut bytes = 0usize;
        for entry in &burst {
            let payload = entry.datagram.payload();
            bytes += payload.len();
            if let Err(e) = sender.send(payload.as_slice(), entry.datagram.target()) {
                tracing::warn!(target = %entry.datagram.target(), error = %e, "UDP send failed");
            }
        }
        let t_send = Instant::now();

        if !burst.is_empty() {
            if let Some(last) = t_last_burst {
                shared.stats.record(
                    now - last,
                    t_prepare - now,
                    t_send - t_prepare,
                    shared.config.burst_period,
                );
            }

            let mut window = shared.window.lock().unwrap();
            if window.len() > 1 {
                let span = window[window.len() - 1].0 - window[0].0;
                if span >= Duration::from_secs(1) {
                    window.pop_front();
                }
            }
            window.push_back((now, bytes));
        }

        burst.clear();
        t_last_burst = Some(now);
        shared.signal_send_done();
    }

    shared.signal_send_done();
}
