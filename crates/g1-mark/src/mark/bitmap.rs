//! Heap-wide mark bitmap.
//!
//! One bit per mark granule (`1 << shift` words) over a fixed covered range.
//! Bits are set with an atomic OR, so any number of workers may mark
//! concurrently without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{HeapAddr, MemRegion};

const BITS_PER_WORD: usize = 64;

/// A mark bitmap covering a fixed address range.
///
/// # Example
///
/// ```
/// use g1_mark::{HeapAddr, MarkBitmap, MemRegion};
///
/// let covered = MemRegion::with_size(HeapAddr::new(0), 4096);
/// let bitmap = MarkBitmap::new(covered, 0);
/// let obj = HeapAddr::new(100);
///
/// assert!(bitmap.mark(obj));
/// assert!(bitmap.is_marked(obj));
/// assert_eq!(bitmap.next_marked_word(HeapAddr::new(0), covered.end()), obj);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    bits: Box<[AtomicU64]>,
    covered: MemRegion,
    shift: u32,
}

impl MarkBitmap {
    /// Creates a cleared bitmap over `covered`, one bit per `1 << shift` words.
    ///
    /// # Panics
    ///
    /// Panics if `covered` is empty.
    #[must_use]
    pub fn new(covered: MemRegion, shift: u32) -> Self {
        assert!(!covered.is_empty(), "MarkBitmap must cover a non-empty range");
        let granules = covered.word_size().div_ceil(1 << shift);
        let words = granules.div_ceil(BITS_PER_WORD);
        let bits = (0..words).map(|_| AtomicU64::new(0)).collect();
        Self {
            bits,
            covered,
            shift,
        }
    }

    /// The covered address range.
    #[must_use]
    pub const fn covered(&self) -> MemRegion {
        self.covered
    }

    /// Words per mark bit.
    #[must_use]
    pub const fn granule_words(&self) -> usize {
        1 << self.shift
    }

    #[inline]
    fn addr_to_bit(&self, addr: HeapAddr) -> usize {
        debug_assert!(
            addr >= self.covered.start() && addr <= self.covered.end(),
            "address {addr} outside bitmap range {:?}",
            self.covered
        );
        addr.words_since(self.covered.start()) >> self.shift
    }

    #[inline]
    fn bit_to_addr(&self, bit: usize) -> HeapAddr {
        self.covered.start().offset(bit << self.shift)
    }

    #[inline]
    fn round_up(&self, addr: HeapAddr) -> HeapAddr {
        let granule = self.granule_words();
        let off = addr.words_since(self.covered.start());
        self.covered.start().offset(off.div_ceil(granule) * granule)
    }

    /// Number of bits whose granule starts below `end`.
    #[inline]
    fn bits_below(&self, end: HeapAddr) -> usize {
        self.addr_to_bit(self.round_up(end))
    }

    /// Sets the bit for `addr`.
    ///
    /// Returns `true` if this call set it, `false` if it was already set.
    #[inline]
    pub fn mark(&self, addr: HeapAddr) -> bool {
        let bit = self.addr_to_bit(addr);
        let mask = 1u64 << (bit % BITS_PER_WORD);
        let prev = self.bits[bit / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Whether the bit for `addr` is set.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, addr: HeapAddr) -> bool {
        let bit = self.addr_to_bit(addr);
        (self.bits[bit / BITS_PER_WORD].load(Ordering::Acquire) >> (bit % BITS_PER_WORD)) & 1 != 0
    }

    /// First marked address in `[round_up(addr), limit)`, or `limit`.
    #[must_use]
    pub fn next_marked_word(&self, addr: HeapAddr, limit: HeapAddr) -> HeapAddr {
        let limit = limit.min(self.covered.end());
        let start = self.round_up(addr);
        if start >= limit {
            return limit;
        }
        let end_bit = self.bits_below(limit);
        let mut bit = self.addr_to_bit(start);
        let mut idx = bit / BITS_PER_WORD;
        let mut word = self.bits[idx].load(Ordering::Acquire) & (!0u64 << (bit % BITS_PER_WORD));
        loop {
            if word != 0 {
                bit = idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                if bit >= end_bit {
                    return limit;
                }
                return self.bit_to_addr(bit);
            }
            idx += 1;
            if idx * BITS_PER_WORD >= end_bit {
                return limit;
            }
            word = self.bits[idx].load(Ordering::Acquire);
        }
    }

    /// The first address past the granule of the object at `addr`.
    ///
    /// Used to resume a bitmap walk after the object at `addr` was scanned.
    #[must_use]
    pub fn next_object(&self, addr: HeapAddr) -> HeapAddr {
        self.round_up(addr.offset(1))
    }

    /// Calls `f` for every marked address in `mr`, lowest first.
    ///
    /// Stops early and returns `false` as soon as `f` returns `false`.
    pub fn iterate<F>(&self, mr: MemRegion, mut f: F) -> bool
    where
        F: FnMut(HeapAddr) -> bool,
    {
        let mr = mr.intersection(&self.covered);
        let mut cur = self.next_marked_word(mr.start(), mr.end());
        while cur < mr.end() {
            if !f(cur) {
                return false;
            }
            cur = self.next_marked_word(self.next_object(cur), mr.end());
        }
        true
    }

    /// Clears every bit whose granule lies in `mr` (clipped to the covered range).
    ///
    /// # Panics
    ///
    /// Panics if the clipped range is empty; that is a caller error.
    pub fn clear_range(&self, mr: MemRegion) {
        let mr = mr.intersection(&self.covered);
        assert!(!mr.is_empty(), "clear_range on empty or uncovered region");
        let beg = self.addr_to_bit(mr.start());
        let end = self.bits_below(mr.end());
        self.clear_bits(beg, end);
    }

    fn clear_bits(&self, beg: usize, end: usize) {
        if beg >= end {
            return;
        }
        let first = beg / BITS_PER_WORD;
        let last = (end - 1) / BITS_PER_WORD;
        let head_mask = !0u64 << (beg % BITS_PER_WORD);
        let tail_mask = !0u64 >> (BITS_PER_WORD - 1 - (end - 1) % BITS_PER_WORD);
        if first == last {
            self.bits[first].fetch_and(!(head_mask & tail_mask), Ordering::AcqRel);
            return;
        }
        self.bits[first].fetch_and(!head_mask, Ordering::AcqRel);
        for word in &self.bits[first + 1..last] {
            word.store(0, Ordering::Release);
        }
        self.bits[last].fetch_and(!tail_mask, Ordering::AcqRel);
    }

    /// Clears the whole bitmap.
    pub fn clear_all(&self) {
        for word in &*self.bits {
            word.store(0, Ordering::Release);
        }
    }

    /// True if no bit in `mr` is set.
    #[must_use]
    pub fn is_clear_range(&self, mr: MemRegion) -> bool {
        let mr = mr.intersection(&self.covered);
        self.next_marked_word(mr.start(), mr.end()) == mr.end()
    }

    /// Number of marked granules in `mr`.
    #[must_use]
    pub fn count_marked(&self, mr: MemRegion) -> usize {
        let mut n = 0;
        self.iterate(mr, |_| {
            n += 1;
            true
        });
        n
    }
}
