//! Global overflow mark stack.
//!
//! Tasks spill grey references here when their local queue fills up and
//! refill from it when they run dry. All access is bulk and serialised by a
//! single lock; the critical sections only copy a handful of words.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::MappedArray;

use crate::addr::HeapAddr;
use crate::gc::tracing;

const NO_SAVED_INDEX: usize = usize::MAX;

struct Inner {
    base: MappedArray<usize>,
    index: usize,
}

/// A fixed-capacity stack of grey object addresses shared by all tasks.
pub struct MarkStack {
    inner: Mutex<Inner>,
    // Mirrors of `inner` for lock-free queries from the clock.
    index: AtomicUsize,
    capacity: AtomicUsize,
    max_capacity: usize,
    overflow: AtomicBool,
    should_expand: AtomicBool,
    saved_index: AtomicUsize,
}

impl MarkStack {
    /// Reserves backing storage for `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns the mapping error if the storage cannot be committed. The
    /// caller must treat that as fatal for heap initialisation.
    pub fn allocate(capacity: usize, max_capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        let base = MappedArray::zeroed(capacity)?;
        Ok(Self {
            inner: Mutex::new(Inner { base, index: 0 }),
            index: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            max_capacity: max_capacity.max(capacity),
            overflow: AtomicBool::new(false),
            should_expand: AtomicBool::new(false),
            saved_index: AtomicUsize::new(NO_SAVED_INDEX),
        })
    }

    /// Pushes all of `entries` or none of them.
    ///
    /// If they do not fit, the overflow flag is raised and the stack is left
    /// unchanged.
    pub fn par_push_arr(&self, entries: &[HeapAddr]) {
        let mut inner = self.inner.lock();
        let index = inner.index;
        let next = index + entries.len();
        if next > inner.base.len() {
            self.overflow.store(true, Ordering::Release);
            return;
        }
        for (slot, addr) in inner.base[index..next].iter_mut().zip(entries) {
            *slot = addr.as_usize();
        }
        inner.index = next;
        self.index.store(next, Ordering::Release);
    }

    /// Pops up to `out.len()` entries into `out`, most recent first.
    ///
    /// Returns how many were popped; zero means the stack was empty.
    pub fn par_pop_arr(&self, out: &mut [HeapAddr]) -> usize {
        let mut inner = self.inner.lock();
        let index = inner.index;
        let n = out.len().min(index);
        for (i, dst) in out.iter_mut().take(n).enumerate() {
            *dst = HeapAddr::new(inner.base[index - 1 - i]);
        }
        inner.index = index - n;
        self.index.store(index - n, Ordering::Release);
        n
    }

    /// Doubles capacity up to the configured maximum.
    ///
    /// Failure to map the larger array is logged and leaves the stack as is.
    ///
    /// # Panics
    ///
    /// Panics if the stack is not empty.
    pub fn expand(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.index, 0, "mark stack must be empty to expand");
        self.should_expand.store(false, Ordering::Relaxed);

        let old = inner.base.len();
        if old >= self.max_capacity {
            tracing::log_stack_at_max(old);
            return;
        }
        let new = old.saturating_mul(2).min(self.max_capacity);
        match MappedArray::zeroed(new) {
            Ok(base) => {
                inner.base = base;
                self.capacity.store(new, Ordering::Release);
                tracing::log_stack_expanded(old, new);
            }
            Err(err) => tracing::log_stack_expand_failed(old, new, &err),
        }
    }

    /// Number of entries currently on the stack.
    #[must_use]
    pub fn size(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// True if no entries are on the stack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Capacity ceiling for [`expand`](Self::expand).
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// True if a push was rejected since the flag was last cleared.
    #[must_use]
    pub fn overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    pub fn clear_overflow(&self) {
        self.overflow.store(false, Ordering::Release);
    }

    /// Whether the stack should grow at the next opportunity.
    #[must_use]
    pub fn should_expand(&self) -> bool {
        self.should_expand.load(Ordering::Relaxed)
    }

    pub fn set_should_expand(&self, value: bool) {
        self.should_expand.store(value, Ordering::Relaxed);
    }

    /// Drops every entry and clears the overflow flag.
    pub fn set_empty(&self) {
        let mut inner = self.inner.lock();
        inner.index = 0;
        self.index.store(0, Ordering::Release);
        self.clear_overflow();
    }

    /// Records the index at the start of a pause in which nobody may push.
    ///
    /// # Panics
    ///
    /// Panics if a previous note was not closed.
    pub fn note_start_of_gc(&self) {
        let prev = self.saved_index.swap(self.size(), Ordering::AcqRel);
        assert_eq!(prev, NO_SAVED_INDEX, "note_start_of_gc called twice");
    }

    /// Checks that the index did not move since [`note_start_of_gc`](Self::note_start_of_gc).
    ///
    /// # Panics
    ///
    /// Panics if it did; something pushed to the stack during the pause.
    pub fn note_end_of_gc(&self) {
        let saved = self.saved_index.swap(NO_SAVED_INDEX, Ordering::AcqRel);
        let index = self.size();
        assert!(
            saved == index,
            "mark stack changed during GC: saved index {saved}, index {index}"
        );
    }
}

impl std::fmt::Debug for MarkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkStack")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .field("overflow", &self.overflow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(range: std::ops::Range<usize>) -> Vec<HeapAddr> {
        range.map(HeapAddr::new).collect()
    }

    #[test]
    fn test_push_pop_lifo_within_batch() {
        let stack = MarkStack::allocate(16, 64).unwrap();
        stack.par_push_arr(&addrs(1..5));
        assert_eq!(stack.size(), 4);

        let mut out = [HeapAddr::default(); 3];
        assert_eq!(stack.par_pop_arr(&mut out), 3);
        assert_eq!(out, [HeapAddr::new(4), HeapAddr::new(3), HeapAddr::new(2)]);
        assert_eq!(stack.par_pop_arr(&mut out), 1);
        assert_eq!(out[0], HeapAddr::new(1));
        assert_eq!(stack.par_pop_arr(&mut out), 0);
    }

    #[test]
    fn test_overflow_is_all_or_nothing() {
        let stack = MarkStack::allocate(4, 4).unwrap();
        stack.par_push_arr(&addrs(0..3));
        stack.par_push_arr(&addrs(10..12));

        assert!(stack.overflow());
        assert_eq!(stack.size(), 3);

        let mut out = [HeapAddr::default(); 8];
        assert_eq!(stack.par_pop_arr(&mut out), 3);
        assert_eq!(&out[..3], &addrs(0..3).into_iter().rev().collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_expand_doubles_up_to_max() {
        let stack = MarkStack::allocate(4, 10).unwrap();
        stack.set_should_expand(true);
        stack.expand();
        assert_eq!(stack.capacity(), 8);
        assert!(!stack.should_expand());
        stack.expand();
        assert_eq!(stack.capacity(), 10);
        stack.expand();
        assert_eq!(stack.capacity(), 10);
    }

    #[test]
    #[should_panic(expected = "must be empty to expand")]
    fn test_expand_non_empty_panics() {
        let stack = MarkStack::allocate(4, 8).unwrap();
        stack.par_push_arr(&addrs(0..1));
        stack.expand();
    }

    #[test]
    fn test_set_empty_clears_overflow() {
        let stack = MarkStack::allocate(1, 1).unwrap();
        stack.par_push_arr(&addrs(0..2));
        assert!(stack.overflow());
        stack.par_push_arr(&addrs(0..1));
        stack.set_empty();
        assert!(stack.is_empty());
        assert!(!stack.overflow());
    }

    #[test]
    fn test_note_gc_balanced() {
        let stack = MarkStack::allocate(8, 8).unwrap();
        stack.par_push_arr(&addrs(0..2));
        stack.note_start_of_gc();
        stack.note_end_of_gc();
        stack.note_start_of_gc();
        stack.note_end_of_gc();
    }

    #[test]
    #[should_panic(expected = "mark stack changed during GC")]
    fn test_note_gc_detects_push() {
        let stack = MarkStack::allocate(8, 8).unwrap();
        stack.note_start_of_gc();
        stack.par_push_arr(&addrs(0..1));
        stack.note_end_of_gc();
    }
}
