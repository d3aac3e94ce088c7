//! Heap address value types.
//!
//! Addresses are word-granular indices into the reserved heap range. Only the
//! operations the marking engine needs are provided; there is no raw pointer
//! arithmetic outside of these types.

use std::fmt;

/// A heap address, measured in words from the start of the address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HeapAddr(usize);

impl HeapAddr {
    /// Creates an address from a word index.
    #[must_use]
    pub const fn new(word: usize) -> Self {
        Self(word)
    }

    /// The word index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The address `words` words above this one.
    #[must_use]
    pub const fn offset(self, words: usize) -> Self {
        Self(self.0 + words)
    }

    /// Number of words from `base` up to this address.
    ///
    /// # Panics
    ///
    /// Panics if `base` is above `self`.
    #[must_use]
    pub const fn words_since(self, base: Self) -> usize {
        assert!(base.0 <= self.0, "address below base");
        self.0 - base.0
    }
}

impl fmt::Debug for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A half-open address range `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemRegion {
    start: HeapAddr,
    end: HeapAddr,
}

impl MemRegion {
    /// Creates `[start, end)`. An inverted range is normalised to empty.
    #[must_use]
    pub const fn new(start: HeapAddr, end: HeapAddr) -> Self {
        if end.0 < start.0 {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Creates `[start, start + words)`.
    #[must_use]
    pub const fn with_size(start: HeapAddr, words: usize) -> Self {
        Self {
            start,
            end: start.offset(words),
        }
    }

    #[must_use]
    pub const fn start(&self) -> HeapAddr {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> HeapAddr {
        self.end
    }

    #[must_use]
    pub const fn word_size(&self) -> usize {
        self.end.0 - self.start.0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start.0 == self.end.0
    }

    #[must_use]
    pub const fn contains(&self, addr: HeapAddr) -> bool {
        self.start.0 <= addr.0 && addr.0 < self.end.0
    }

    /// The overlap of two ranges; empty if they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Self::new(start, end.max(start))
    }
}
