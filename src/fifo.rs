//! Waitable single-producer/single-consumer FIFO.
//!
//! The fast path is a lock-free ring (one read index, one write index);
//! a mutex/condvar pair per side is used only when a side has to block.
//! The producer can wait when the FIFO is full, the consumer when it is
//! empty, and either can be unblocked from a third thread during shutdown.
//!
//! Exactly one thread may push and exactly one thread may pop; the
//! discipline is enforced by call sites, not by the type.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Blocking-path state for one side of the FIFO.
struct Side {
    state: Mutex<SideState>,
    cond: Condvar,
}

struct SideState {
    /// The side is parked in a wait and wants a notification.
    waiting: bool,
    /// When set the side never blocks until the flag is cleared.
    unblock: bool,
}

impl Side {
    fn new() -> Self {
        Self {
            state: Mutex::new(SideState {
                waiting: false,
                unblock: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Wake the side if it indicated it is waiting.
    fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        if state.waiting {
            state.waiting = false;
            self.cond.notify_one();
        }
    }
}

/// Bounded waitable SPSC FIFO.
pub struct Fifo<T> {
    /// Ring of `capacity + 1` slots; the slot at `write` is always free.
    ring: Box<[UnsafeCell<MaybeUninit<T>>]>,
    read: AtomicUsize,
    write: AtomicUsize,
    capacity: usize,
    producer: Side,
    consumer: Side,
}

unsafe impl<T: Send> Send for Fifo<T> {}
unsafe impl<T: Send> Sync for Fifo<T> {}

impl<T> Fifo<T> {
    /// Create a FIFO that can hold up to `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FIFO capacity must be non-zero");
        let ring = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            ring,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            capacity,
            producer: Side::new(),
            consumer: Side::new(),
        }
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        if index + 1 == self.ring.len() { 0 } else { index + 1 }
    }

    /// Lock-free push attempt; the ring indices provide the ordering.
    fn ring_push(&self, value: T) -> Result<(), T> {
        let write = self.write.load(Ordering::Relaxed);
        let next = self.next(write);
        if next == self.read.load(Ordering::Acquire) {
            return Err(value); // full
        }
        unsafe { (*self.ring[write].get()).write(value) };
        self.write.store(next, Ordering::Release);
        Ok(())
    }

    fn ring_pop(&self) -> Option<T> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None; // empty
        }
        let value = unsafe { (*self.ring[read].get()).assume_init_read() };
        self.read.store(self.next(read), Ordering::Release);
        Some(value)
    }

    /// Try to push one element.
    ///
    /// Returns the element back if the FIFO is full. Producer thread only.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.ring_push(value)?;
        self.consumer.notify();
        Ok(())
    }

    /// Push one element, blocking while the FIFO is full.
    ///
    /// Returns the element back without pushing if
    /// [`unblock_producer`](Self::unblock_producer) was signalled while the
    /// FIFO was still full. Producer thread only.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut value = value;
        if let Err(v) = self.ring_push(value) {
            value = v;
            let mut state = self.producer.state.lock().unwrap();
            loop {
                match self.ring_push(value) {
                    Ok(()) => break,
                    Err(v) if state.unblock => return Err(v),
                    Err(v) => {
                        value = v;
                        state.waiting = true;
                        state = self.producer.cond.wait(state).unwrap();
                    }
                }
            }
        }
        self.consumer.notify();
        Ok(())
    }

    /// Get a reference to the front element, if any.
    ///
    /// Consumer thread only; the reference is invalidated by
    /// [`pop`](Self::pop).
    pub fn front(&self) -> Option<&T> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { (*self.ring[read].get()).assume_init_ref() })
    }

    /// Pop the front element, if any. Consumer thread only.
    pub fn pop(&self) -> Option<T> {
        let value = self.ring_pop()?;
        self.producer.notify();
        Some(value)
    }

    /// Number of elements available for pop. Consumer thread only.
    pub fn read_available(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);
        if write >= read {
            write - read
        } else {
            write + self.ring.len() - read
        }
    }

    /// Free space available for push. Producer thread only.
    pub fn write_available(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Relaxed);
        let used = if write >= read {
            write - read
        } else {
            write + self.ring.len() - read
        };
        self.capacity - used
    }

    /// Wait until at least one element can be popped.
    ///
    /// Returns the number of elements available, which is 0 only after
    /// [`unblock_consumer`](Self::unblock_consumer) was signalled while the
    /// FIFO was empty. Consumer thread only.
    pub fn wait_read_available(&self) -> usize {
        let mut available = self.read_available();
        if available == 0 {
            let mut state = self.consumer.state.lock().unwrap();
            loop {
                available = self.read_available();
                if available > 0 || state.unblock {
                    break;
                }
                state.waiting = true;
                state = self.consumer.cond.wait(state).unwrap();
            }
        }
        available
    }

    /// Total capacity of the FIFO.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enable (or disable) the producer unblock: while enabled the
    /// producer never blocks in [`push`](Self::push).
    pub fn unblock_producer(&self, unblock: bool) {
        let mut state = self.producer.state.lock().unwrap();
        state.unblock = unblock;
        state.waiting = false;
        self.producer.cond.notify_one();
    }

    /// Enable (or disable) the consumer unblock: while enabled the
    /// consumer never blocks in [`wait_read_available`](Self::wait_read_available).
    pub fn unblock_consumer(&self, unblock: bool) {
        let mut state = self.consumer.state.lock().unwrap();
        state.unblock = unblock;
        state.waiting = false;
        self.consumer.cond.notify_one();
    }

    /// Drop all queued elements and disable both unblock flags.
    ///
    /// Must not race with a concurrent push or pop.
    pub fn clear(&self) {
        while self.ring_pop().is_some() {}
        self.producer.state.lock().unwrap().unblock = false;
        self.consumer.state.lock().unwrap().unblock = false;
    }
}

impl<T> Drop for Fifo<T> {
    fn drop(&mut self) {
        while self.ring_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_push_until_full() {
        let fifo = Fifo::new(3);
        assert_eq!(fifo.write_available(), 3);
        for i in 0..3 {
            assert!(fifo.try_push(i).is_ok());
        }
        assert_eq!(fifo.read_available(), 3);
        // try_push fails exactly when read_available == capacity
        assert_eq!(fifo.try_push(99), Err(99));
    }

    #[test]
    fn test_front_then_pop_in_order() {
        let fifo = Fifo::new(4);
        fifo.try_push("a").unwrap();
        fifo.try_push("b").unwrap();
        assert_eq!(fifo.front(), Some(&"a"));
        assert_eq!(fifo.pop(), Some("a"));
        assert_eq!(fifo.front(), Some(&"b"));
        assert_eq!(fifo.pop(), Some("b"));
        assert_eq!(fifo.front(), None);
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn test_blocking_push_resumes_after_pop() {
        let fifo = Arc::new(Fifo::new(1));
        fifo.try_push(0u32).unwrap();

        let producer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.push(1).is_ok())
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(fifo.pop(), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(fifo.pop(), Some(1));
    }

    #[test]
    fn test_unblock_producer_returns_element() {
        let fifo = Arc::new(Fifo::new(1));
        fifo.try_push(0u32).unwrap();

        let producer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.push(1))
        };

        thread::sleep(Duration::from_millis(50));
        fifo.unblock_producer(true);
        assert_eq!(producer.join().unwrap(), Err(1));
        // The queued element is untouched.
        assert_eq!(fifo.pop(), Some(0));
    }

    #[test]
    fn test_wait_read_available_wakes_on_push() {
        let fifo = Arc::new(Fifo::new(4));

        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let n = fifo.wait_read_available();
                assert!(n > 0);
                fifo.pop()
            })
        };

        thread::sleep(Duration::from_millis(50));
        fifo.try_push(42u64).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_unblock_consumer_returns_zero() {
        let fifo: Arc<Fifo<u32>> = Arc::new(Fifo::new(4));

        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.wait_read_available())
        };

        thread::sleep(Duration::from_millis(50));
        fifo.unblock_consumer(true);
        assert_eq!(consumer.join().unwrap(), 0);
    }

    #[test]
    fn test_clear_resets_unblock_flags() {
        let fifo = Fifo::new(2);
        fifo.try_push(1).unwrap();
        fifo.unblock_producer(true);
        fifo.unblock_consumer(true);
        fifo.clear();
        assert_eq!(fifo.read_available(), 0);
        assert!(!fifo.producer.state.lock().unwrap().unblock);
        assert!(!fifo.consumer.state.lock().unwrap().unblock);
    }

    #[test]
    fn test_spsc_no_loss_no_reorder() {
        const N: u64 = 100_000;
        let fifo = Arc::new(Fifo::new(64));

        let producer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                for i in 0..N {
                    fifo.push(i).unwrap();
                }
            })
        };

        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut expected = 0u64;
                while expected < N {
                    if fifo.wait_read_available() > 0 {
                        let v = fifo.pop().unwrap();
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(fifo.read_available(), 0);
    }

    #[test]
    fn test_elements_dropped_on_fifo_drop() {
        let marker = Arc::new(());
        let fifo = Fifo::new(4);
        fifo.try_push(Arc::clone(&marker)).unwrap();
        fifo.try_push(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 3);
        drop(fifo);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
