//! Modular cursor arithmetic over a fixed-capacity circular region.
//!
//! A [`RingCursor`] tracks up to three monotonically increasing counters
//! (`tail <= middle <= head`) over a region of `capacity` bytes. Offsets
//! into the region are always derived (`counter % capacity`); free space
//! and fill level are computed from counter differences, never stored.
//!
//! The source ring of a connection uses all three counters: `head` marks
//! bytes copied in by the writer, `middle` bytes handed to the NIC, and
//! `tail` bytes whose transfer completed. The sink ring and the local view
//! of the peer's window use only `head`/`tail`.

/// Cursor over a circular byte region. Counters are monotonic; all offsets
/// are taken modulo the capacity.
#[derive(Debug, Clone, Copy)]
pub struct RingCursor {
    capacity: u64,
    head: u64,
    middle: u64,
    tail: u64,
}

impl RingCursor {
    /// Create a cursor over a region of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            head: 0,
            middle: 0,
            tail: 0,
        }
    }

    /// Reset all counters and adopt a new capacity.
    pub fn clear(&mut self, capacity: u64) {
        *self = Self::new(capacity);
    }

    /// Region capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Offset of the head counter into the region.
    #[inline]
    pub fn head_offset(&self) -> u64 {
        self.head % self.capacity
    }

    /// Offset of the middle counter into the region.
    #[inline]
    pub fn middle_offset(&self) -> u64 {
        self.middle % self.capacity
    }

    /// Offset of the tail counter into the region.
    #[inline]
    pub fn tail_offset(&self) -> u64 {
        self.tail % self.capacity
    }

    /// Bytes between tail and head: the fill level of the region.
    #[inline]
    pub fn available(&self) -> u64 {
        self.head - self.tail
    }

    /// Bytes between middle and head: filled but not yet handed off.
    #[inline]
    pub fn pending(&self) -> u64 {
        self.head - self.middle
    }

    /// Bytes between tail and middle: handed off but not yet completed.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.middle - self.tail
    }

    /// Free space: bytes that may still be written without overrunning tail.
    #[inline]
    pub fn free(&self) -> u64 {
        self.capacity - self.available()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.available() == self.capacity
    }

    /// Advance the head by `n` bytes. Panics if the region would overfill.
    pub fn advance_head(&mut self, n: u64) {
        self.head += n;
        assert!(
            self.available() <= self.capacity,
            "ring overfill: {} > {}",
            self.available(),
            self.capacity
        );
    }

    /// Advance the middle by `n` bytes. Panics if it would pass the head.
    pub fn advance_middle(&mut self, n: u64) {
        self.middle += n;
        assert!(
            self.middle <= self.head,
            "ring middle {} passed head {}",
            self.middle,
            self.head
        );
    }

    /// Advance the tail by `n` bytes. Panics if it would pass the head;
    /// two-counter users get their unused middle kept in step.
    pub fn advance_tail(&mut self, n: u64) {
        self.tail += n;
        // Two-counter users never touch middle; keep it in step.
        if self.middle < self.tail {
            self.middle = self.tail;
        }
        assert!(
            self.tail <= self.head,
            "ring tail {} passed head {}",
            self.tail,
            self.head
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cur = RingCursor::new(64);
        assert!(cur.is_empty());
        assert!(!cur.is_full());
        assert_eq!(cur.available(), 0);
        assert_eq!(cur.free(), 64);
    }

    #[test]
    fn fill_and_drain() {
        let mut cur = RingCursor::new(64);
        cur.advance_head(40);
        assert_eq!(cur.available(), 40);
        assert_eq!(cur.free(), 24);
        cur.advance_tail(40);
        assert!(cur.is_empty());
        assert_eq!(cur.free(), 64);
    }

    #[test]
    fn offsets_wrap_at_capacity() {
        let mut cur = RingCursor::new(64);
        cur.advance_head(60);
        cur.advance_tail(60);
        cur.advance_head(10);
        // Counters are monotonic, offsets wrap.
        assert_eq!(cur.tail_offset(), 60);
        assert_eq!(cur.head_offset(), 6);
        assert_eq!(cur.available(), 10);
    }

    #[test]
    fn capacity_need_not_be_power_of_two() {
        let mut cur = RingCursor::new(100);
        for _ in 0..7 {
            cur.advance_head(30);
            cur.advance_tail(30);
        }
        assert_eq!(cur.head_offset(), 10);
        assert!(cur.is_empty());
    }

    #[test]
    fn three_counter_discipline() {
        let mut cur = RingCursor::new(128);
        cur.advance_head(100); // writer filled 100
        cur.advance_middle(60); // 60 handed to the NIC
        assert_eq!(cur.pending(), 40);
        assert_eq!(cur.in_flight(), 60);
        cur.advance_tail(60); // transfer completed
        assert_eq!(cur.in_flight(), 0);
        assert_eq!(cur.available(), 40);
        assert_eq!(cur.free(), 88);
    }

    #[test]
    fn full_ring() {
        let mut cur = RingCursor::new(32);
        cur.advance_head(32);
        assert!(cur.is_full());
        assert_eq!(cur.free(), 0);
    }

    #[test]
    #[should_panic(expected = "ring overfill")]
    fn overfill_panics() {
        let mut cur = RingCursor::new(32);
        cur.advance_head(33);
    }

    #[test]
    #[should_panic(expected = "passed head")]
    fn middle_past_head_panics() {
        let mut cur = RingCursor::new(32);
        cur.advance_head(8);
        cur.advance_middle(9);
    }
}
