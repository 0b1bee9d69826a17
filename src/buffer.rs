//! Byte buffers with zero-copy sub-views.
//!
//! A [`Buffer`] is a view over a reference-counted heap region. The root
//! view owns the allocation; [`Buffer::child`] creates a view over a
//! sub-range that shares the same region. The region is freed exactly once,
//! when the last view referring to it is dropped, so a child handed to a
//! downstream component keeps the producer's chunk alive without copying.
//!
//! [`TsBuffer`] specialises [`Buffer`] for runs of fixed-size TS packets and
//! carries a parallel array of per-packet 27 MHz timestamps.

use std::cell::UnsafeCell;
use std::sync::Arc;

/// Reference-counted heap region backing a family of buffer views.
///
/// Interior mutability is required because child views alias the root's
/// bytes. The discipline is the producer/consumer one: a region is written
/// only while its root view is the sole handle (freshly allocated, or a
/// carry-over buffer owned by a single thread), and read-only afterwards.
struct Segment {
    data: UnsafeCell<Box<[u8]>>,
}

// Accesses follow the single-writer discipline documented above.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn new(capacity: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        unsafe { (*self.data.get()).as_ptr() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    #[inline]
    fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }
}

/// A byte buffer view: either the root of an allocation or a child
/// sub-view of another buffer.
///
/// Cloning is cheap (an atomic increment); all clones and children share
/// the same underlying region.
pub struct Buffer {
    segment: Arc<Segment>,
    /// Byte offset of this view within the segment.
    offset: usize,
    /// Reserved bytes of this view.
    capacity: usize,
    /// Valid payload bytes (`<= capacity`).
    size: usize,
}

impl Buffer {
    /// Allocate a new zeroed root buffer with the given capacity and a
    /// payload size of 0.
    pub fn alloc(capacity: usize) -> Self {
        Self {
            segment: Arc::new(Segment::new(capacity)),
            offset: 0,
            capacity,
            size: 0,
        }
    }

    /// Create a child view over `capacity` bytes starting at `offset`
    /// (relative to this view), with `size` valid bytes.
    ///
    /// The child shares the underlying region and keeps it alive.
    ///
    /// # Panics
    ///
    /// Panics if the requested range does not lie within this view.
    pub fn child(&self, offset: usize, capacity: usize, size: usize) -> Self {
        assert!(offset + capacity <= self.capacity, "child range outside parent");
        assert!(size <= capacity, "child size exceeds its capacity");
        Self {
            segment: Arc::clone(&self.segment),
            offset: self.offset + offset,
            capacity,
            size,
        }
    }

    /// Get the number of valid payload bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check whether the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Set the number of valid payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size > capacity`.
    pub fn set_len(&mut self, size: usize) {
        assert!(size <= self.capacity, "size exceeds capacity");
        self.size = size;
    }

    /// Get the reserved capacity of this view in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the payload as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        debug_assert!(self.offset + self.size <= self.segment.len());
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr().add(self.offset), self.size) }
    }

    /// Get the whole reserved range as a mutable byte slice.
    ///
    /// Callers must hold the only handle that writes this range; see the
    /// module docs for the single-writer discipline.
    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.offset + self.capacity <= self.segment.len());
        unsafe {
            std::slice::from_raw_parts_mut(self.segment.as_mut_ptr().add(self.offset), self.capacity)
        }
    }

    /// Number of views (this one included) sharing the underlying region.
    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        Arc::strong_count(&self.segment)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            offset: self.offset,
            capacity: self.capacity,
            size: self.size,
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .finish()
    }
}

/// A buffer holding a run of fixed-size TS packets with a parallel
/// per-packet timestamp array in 27 MHz ticks.
///
/// `timestamps()[i]` is the scheduled send time of `packet(i)`. Child views
/// share the timestamp array, aligned to the first packet of the view.
#[derive(Clone, Debug)]
pub struct TsBuffer {
    buffer: Buffer,
    packet_size: usize,
    packet_count: usize,
    timestamps: Arc<[u64]>,
    /// Index of this view's first packet within the root timestamp array.
    ts_offset: usize,
}

impl TsBuffer {
    /// Allocate a root buffer with room for `packet_capacity` packets and
    /// no timestamps (used for copy-assembled carry-over payloads).
    pub fn alloc(packet_capacity: usize, packet_size: usize) -> Self {
        Self {
            buffer: Buffer::alloc(packet_capacity * packet_size),
            packet_size,
            packet_count: 0,
            timestamps: Arc::from(Vec::new()),
            ts_offset: 0,
        }
    }

    /// Build a root TS buffer from a filled byte buffer and its per-packet
    /// timestamps.
    ///
    /// # Panics
    ///
    /// Panics if `timestamps` has fewer entries than `packet_count` or the
    /// byte buffer cannot hold `packet_count` packets.
    pub fn from_parts(
        mut buffer: Buffer,
        packet_size: usize,
        packet_count: usize,
        timestamps: Vec<u64>,
    ) -> Self {
        assert!(timestamps.len() >= packet_count, "timestamp array too short");
        assert!(packet_count * packet_size <= buffer.capacity());
        buffer.set_len(packet_count * packet_size);
        Self {
            buffer,
            packet_size,
            packet_count,
            timestamps: Arc::from(timestamps),
            ts_offset: 0,
        }
    }

    /// Create a child view of `n_pkts` packets starting at `first_pkt`,
    /// sharing bytes and the timestamp slice with this buffer.
    pub fn child(&self, first_pkt: usize, n_pkts: usize) -> Self {
        assert!(first_pkt + n_pkts <= self.packet_count, "child range outside buffer");
        Self {
            buffer: self.buffer.child(
                first_pkt * self.packet_size,
                n_pkts * self.packet_size,
                n_pkts * self.packet_size,
            ),
            packet_size: self.packet_size,
            packet_count: n_pkts,
            timestamps: Arc::clone(&self.timestamps),
            ts_offset: self.ts_offset + first_pkt,
        }
    }

    /// Get the TS packet size (188 or 204).
    #[inline]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Get the number of valid packets in the buffer.
    #[inline]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    /// Get the maximum number of packets the buffer can hold.
    #[inline]
    pub fn packet_capacity(&self) -> usize {
        self.buffer.capacity() / self.packet_size
    }

    /// Get packet `index` as a byte slice.
    #[inline]
    pub fn packet(&self, index: usize) -> &[u8] {
        assert!(index < self.packet_count);
        &self.as_slice()[index * self.packet_size..(index + 1) * self.packet_size]
    }

    /// Get the 27 MHz timestamp of packet `index`.
    #[inline]
    pub fn timestamp(&self, index: usize) -> u64 {
        self.timestamps[self.ts_offset + index]
    }

    /// Get the valid payload (all packets) as one byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Append packets copied from `src` and grow the packet count.
    ///
    /// Used to assemble carry-over payloads; appended packets have no
    /// timestamps.
    ///
    /// # Panics
    ///
    /// Panics if `src` is not a whole number of packets or the buffer
    /// cannot hold them.
    pub fn append_packets(&mut self, src: &[u8]) {
        assert_eq!(src.len() % self.packet_size, 0, "partial packet append");
        let n_pkts = src.len() / self.packet_size;
        assert!(self.packet_count + n_pkts <= self.packet_capacity(), "append overflows buffer");
        let at = self.packet_count * self.packet_size;
        self.buffer.space_mut()[at..at + src.len()].copy_from_slice(src);
        self.packet_count += n_pkts;
        self.buffer.set_len(self.packet_count * self.packet_size);
    }

    /// Discard the TS framing and return the underlying byte view.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alloc_zeroed() {
        let mut buf = Buffer::alloc(64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.len(), 0);
        assert!(buf.space_mut().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_write_read() {
        let mut buf = Buffer::alloc(8);
        buf.space_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.set_len(4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_child_shares_bytes() {
        let mut root = Buffer::alloc(16);
        root.space_mut().copy_from_slice(&(0u8..16).collect::<Vec<_>>());
        root.set_len(16);

        let child = root.child(4, 8, 8);
        assert_eq!(child.as_slice(), &[4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_child_outlives_root_handle() {
        let mut root = Buffer::alloc(4);
        root.space_mut().copy_from_slice(&[9, 9, 9, 9]);
        root.set_len(4);
        assert_eq!(root.ref_count(), 1);

        let child = root.child(1, 2, 2);
        assert_eq!(root.ref_count(), 2);

        // Dropping the root view must not invalidate the child: the region
        // lives until the last view goes away.
        drop(root);
        assert_eq!(child.as_slice(), &[9, 9]);
        assert_eq!(child.ref_count(), 1);
    }

    #[test]
    #[should_panic(expected = "child range outside parent")]
    fn test_child_cannot_cross_parent() {
        let root = Buffer::alloc(8);
        let _ = root.child(4, 8, 0);
    }

    fn filled_ts_buffer(packets: usize, packet_size: usize) -> TsBuffer {
        let mut buf = Buffer::alloc(packets * packet_size);
        for i in 0..packets {
            buf.space_mut()[i * packet_size] = 0x47;
            buf.space_mut()[i * packet_size + 1] = i as u8;
        }
        let timestamps = (0..packets as u64).map(|n| n * 1000).collect();
        TsBuffer::from_parts(buf, packet_size, packets, timestamps)
    }

    #[test]
    fn test_ts_buffer_packets_and_timestamps() {
        let ts = filled_ts_buffer(10, 188);
        assert_eq!(ts.packet_count(), 10);
        assert_eq!(ts.packet_size(), 188);
        assert_eq!(ts.packet(3)[0], 0x47);
        assert_eq!(ts.packet(3)[1], 3);
        assert_eq!(ts.timestamp(3), 3000);
    }

    #[test]
    fn test_ts_buffer_child_aligns_timestamps() {
        let ts = filled_ts_buffer(10, 188);
        let child = ts.child(7, 3);
        assert_eq!(child.packet_count(), 3);
        assert_eq!(child.packet(0)[1], 7);
        assert_eq!(child.timestamp(0), 7000);
        assert_eq!(child.timestamp(2), 9000);
    }

    #[test]
    fn test_ts_buffer_append_packets() {
        let mut partial = TsBuffer::alloc(7, 188);
        let src = vec![0x47u8; 2 * 188];
        partial.append_packets(&src);
        assert_eq!(partial.packet_count(), 2);
        partial.append_packets(&vec![0x47u8; 5 * 188]);
        assert_eq!(partial.packet_count(), 7);
        assert_eq!(partial.as_slice().len(), 7 * 188);
    }

    #[test]
    #[should_panic(expected = "append overflows buffer")]
    fn test_ts_buffer_append_overflow() {
        let mut partial = TsBuffer::alloc(2, 188);
        partial.append_packets(&vec![0u8; 3 * 188]);
    }
}
