//! Anonymous memory mappings for collector side tables.
//!
//! Side tables such as the global mark stack are sized from configuration and
//! may be large, so they are backed by fresh anonymous mappings instead of the
//! Rust allocator. Mapping failure is reported as an [`io::Error`] and never
//! aborts the process; the caller decides whether it is fatal.

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::slice;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a multiple of the system page size.
#[must_use]
pub fn page_align(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|v| v & !(page - 1))
}

/// An owned, zero-initialised anonymous mapping.
///
/// The mapping is released when the handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Maps `len` bytes of zeroed, readable and writable memory.
    ///
    /// `len` is rounded up to the page size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length, or the OS
    /// error if the mapping could not be created.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be greater than 0",
            ));
        }
        let len = page_align(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "mapping length overflows")
        })?;
        // SAFETY: a fresh mapping with no address hint cannot alias anything.
        let inner = unsafe { os::MmapInner::map_anon(len)? };
        Ok(Self { inner })
    }

    /// Start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Always false; zero-length mappings cannot be created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: shared access only hands out the base pointer.
unsafe impl Sync for Mmap {}

/// A fixed-length array of `T` living in its own anonymous mapping.
///
/// `T` must be valid when all of its bytes are zero, since the mapping starts
/// zero-filled; the bound is expressed by [`Zeroable`].
pub struct MappedArray<T: Zeroable> {
    map: Mmap,
    len: usize,
    _marker: PhantomData<T>,
}

/// Types for which the all-zero bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be `Copy` plain data with no invalid zero representation.
pub unsafe trait Zeroable: Copy {}

// SAFETY: integers are valid when zeroed.
unsafe impl Zeroable for usize {}
// SAFETY: integers are valid when zeroed.
unsafe impl Zeroable for u64 {}
// SAFETY: integers are valid when zeroed.
unsafe impl Zeroable for u32 {}

impl<T: Zeroable> MappedArray<T> {
    /// Maps an array of `len` zeroed elements.
    ///
    /// # Errors
    ///
    /// Fails if the byte size overflows or the mapping cannot be created.
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .filter(|b| *b > 0)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid mapped array length")
            })?;
        let map = Mmap::anonymous(bytes)?;
        debug_assert_eq!(map.ptr() as usize % mem::align_of::<T>(), 0);
        Ok(Self {
            map,
            len,
            _marker: PhantomData,
        })
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if the array holds no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually mapped, including page rounding.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.map.len()
    }
}

impl<T: Zeroable> Deref for MappedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: the mapping is at least `len * size_of::<T>()` bytes, aligned,
        // zero-initialised, and `T: Zeroable`.
        unsafe { slice::from_raw_parts(self.map.ptr().cast::<T>(), self.len) }
    }
}

impl<T: Zeroable> DerefMut for MappedArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as for `deref`, and `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.map.ptr().cast::<T>(), self.len) }
    }
}
