//! An in-memory region heap for tests, benches and demos.
//!
//! Word-addressed and fixed-size. Every object starts with a header word
//! holding its size and reference count, followed by its reference fields
//! and an opaque payload. Reference fields store `target + 1` so that zero
//! is null.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::addr::{HeapAddr, MemRegion};
use crate::gc::satb::SatbQueue;
use crate::heap::{HeapAccess, RegionKind};

const SIZE_BITS: u32 = 32;
const SIZE_MASK: usize = (1 << SIZE_BITS) - 1;

const fn kind_to_u8(kind: RegionKind) -> u8 {
    match kind {
        RegionKind::Free => 0,
        RegionKind::Eden => 1,
        RegionKind::Survivor => 2,
        RegionKind::Old => 3,
        RegionKind::HumongousStart => 4,
        RegionKind::HumongousContinues => 5,
    }
}

const fn kind_from_u8(raw: u8) -> RegionKind {
    match raw {
        1 => RegionKind::Eden,
        2 => RegionKind::Survivor,
        3 => RegionKind::Old,
        4 => RegionKind::HumongousStart,
        5 => RegionKind::HumongousContinues,
        _ => RegionKind::Free,
    }
}

#[derive(Debug)]
struct SimRegion {
    kind: AtomicU8,
    top: AtomicUsize,
}

/// A simple heap implementing [`HeapAccess`].
///
/// # Example
///
/// ```
/// use g1_mark::{HeapAccess, RegionKind, SimHeap};
///
/// let heap = SimHeap::new(4, 256);
/// let region = heap.new_region(RegionKind::Old).unwrap();
/// let a = heap.allocate(region, 1, 2).unwrap();
/// let b = heap.allocate(region, 0, 4).unwrap();
/// heap.set_field(a, 0, Some(b));
///
/// assert_eq!(heap.object_size(a), 4);
/// assert_eq!(heap.field(a, 0), Some(b));
/// ```
#[derive(Debug)]
pub struct SimHeap {
    base: HeapAddr,
    region_words: usize,
    words: Box<[AtomicUsize]>,
    regions: Box<[SimRegion]>,
    roots: RwLock<Vec<HeapAddr>>,
    satb: RwLock<Option<SatbQueue>>,
    alloc_lock: Mutex<()>,
    mutator_threads: AtomicUsize,
}

impl SimHeap {
    /// Creates a heap of `num_regions` free regions of `region_words` each.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    #[must_use]
    pub fn new(num_regions: usize, region_words: usize) -> Self {
        assert!(num_regions > 0 && region_words > 0, "empty heap");
        let base = HeapAddr::new(region_words);
        let regions = (0..num_regions)
            .map(|idx| SimRegion {
                kind: AtomicU8::new(kind_to_u8(RegionKind::Free)),
                top: AtomicUsize::new(base.offset(idx * region_words).as_usize()),
            })
            .collect();
        Self {
            base,
            region_words,
            words: (0..num_regions * region_words)
                .map(|_| AtomicUsize::new(0))
                .collect(),
            regions,
            roots: RwLock::new(Vec::new()),
            satb: RwLock::new(None),
            alloc_lock: Mutex::new(()),
            mutator_threads: AtomicUsize::new(1),
        }
    }

    fn word(&self, addr: HeapAddr) -> &AtomicUsize {
        &self.words[addr.words_since(self.base)]
    }

    fn set_kind(&self, idx: usize, kind: RegionKind) {
        self.regions[idx]
            .kind
            .store(kind_to_u8(kind), Ordering::Release);
    }

    fn set_top(&self, idx: usize, top: HeapAddr) {
        self.regions[idx].top.store(top.as_usize(), Ordering::Release);
    }

    /// Turns the lowest free region into a region of `kind`.
    pub fn new_region(&self, kind: RegionKind) -> Option<usize> {
        let _guard = self.alloc_lock.lock();
        let idx = (0..self.regions.len()).find(|&i| self.region_kind(i) == RegionKind::Free)?;
        self.set_kind(idx, kind);
        Some(idx)
    }

    /// Changes the kind of region `idx`, for example to retire eden to old.
    pub fn set_region_kind(&self, idx: usize, kind: RegionKind) {
        self.set_kind(idx, kind);
    }

    /// Bump-allocates an object with `nrefs` null fields and `payload` words.
    ///
    /// Returns `None` if region `idx` has no room.
    pub fn allocate(&self, idx: usize, nrefs: usize, payload: usize) -> Option<HeapAddr> {
        let size = 1 + nrefs + payload;
        let _guard = self.alloc_lock.lock();
        let top = self.region_top(idx);
        let end = self.region_end(idx);
        if top.offset(size) > end {
            return None;
        }
        self.write_header(top, size, nrefs);
        self.set_top(idx, top.offset(size));
        Some(top)
    }

    /// Allocates an object spanning as many free regions as it needs.
    pub fn allocate_humongous(&self, nrefs: usize, payload: usize) -> Option<HeapAddr> {
        let size = 1 + nrefs + payload;
        let count = size.div_ceil(self.region_words);
        let _guard = self.alloc_lock.lock();
        let n = self.regions.len();
        let first = (0..=n.checked_sub(count)?).find(|&start| {
            (start..start + count).all(|i| self.region_kind(i) == RegionKind::Free)
        })?;

        let obj = self.region_bottom(first);
        self.write_header(obj, size, nrefs);
        let obj_end = obj.offset(size);
        for idx in first..first + count {
            let kind = if idx == first {
                RegionKind::HumongousStart
            } else {
                RegionKind::HumongousContinues
            };
            self.set_kind(idx, kind);
            self.set_top(idx, obj_end.min(self.region_end(idx)));
        }
        Some(obj)
    }

    fn write_header(&self, obj: HeapAddr, size: usize, nrefs: usize) {
        debug_assert!(size <= SIZE_MASK, "object too large");
        for i in 1..size {
            self.word(obj.offset(i)).store(0, Ordering::Relaxed);
        }
        self.word(obj)
            .store(size | (nrefs << SIZE_BITS), Ordering::Release);
    }

    /// Number of reference fields of `obj`.
    #[must_use]
    pub fn nrefs(&self, obj: HeapAddr) -> usize {
        self.word(obj).load(Ordering::Acquire) >> SIZE_BITS
    }

    /// Reads reference field `i` of `obj`.
    #[must_use]
    pub fn field(&self, obj: HeapAddr, i: usize) -> Option<HeapAddr> {
        debug_assert!(i < self.nrefs(obj), "field index out of range");
        match self.word(obj.offset(1 + i)).load(Ordering::Acquire) {
            0 => None,
            raw => Some(HeapAddr::new(raw - 1)),
        }
    }

    /// Stores into reference field `i` of `obj`.
    ///
    /// The previous value is logged to the attached SATB queue while
    /// marking is active.
    pub fn set_field(&self, obj: HeapAddr, i: usize, value: Option<HeapAddr>) {
        debug_assert!(i < self.nrefs(obj), "field index out of range");
        let raw = value.map_or(0, |v| v.as_usize() + 1);
        let prev = self.word(obj.offset(1 + i)).swap(raw, Ordering::AcqRel);
        if prev != 0 {
            if let Some(queue) = &*self.satb.read() {
                queue.enqueue(HeapAddr::new(prev - 1));
            }
        }
    }

    /// Routes the pre-write barrier of [`set_field`](Self::set_field) to `queue`.
    pub fn attach_satb_queue(&self, queue: SatbQueue) {
        *self.satb.write() = Some(queue);
    }

    /// Drops the attached SATB queue, flushing it if marking is active.
    pub fn detach_satb_queue(&self) {
        self.satb.write().take();
    }

    pub fn add_root(&self, obj: HeapAddr) {
        self.roots.write().push(obj);
    }

    pub fn remove_root(&self, obj: HeapAddr) {
        self.roots.write().retain(|&r| r != obj);
    }

    pub fn clear_roots(&self) {
        self.roots.write().clear();
    }

    pub fn set_live_mutator_threads(&self, n: usize) {
        self.mutator_threads.store(n, Ordering::Relaxed);
    }

    /// Objects of region `idx`, lowest first.
    #[must_use]
    pub fn objects_in(&self, idx: usize) -> Vec<HeapAddr> {
        if self.region_kind(idx) == RegionKind::HumongousContinues {
            return Vec::new();
        }
        let top = self.region_top(idx);
        let mut cur = self.region_bottom(idx);
        let mut objs = Vec::new();
        while cur < top {
            objs.push(cur);
            cur = cur.offset(self.object_size(cur).max(1));
        }
        objs
    }

    /// Every object reachable from the roots, in no particular order.
    #[must_use]
    pub fn reachable(&self) -> Vec<HeapAddr> {
        let mut seen = std::collections::HashSet::new();
        let mut stack: Vec<HeapAddr> = self.roots.read().clone();
        while let Some(obj) = stack.pop() {
            if seen.insert(obj) {
                self.for_each_reference(obj, &mut |child| stack.push(child));
            }
        }
        seen.into_iter().collect()
    }
}

impl HeapAccess for SimHeap {
    fn reserved(&self) -> MemRegion {
        MemRegion::with_size(self.base, self.words.len())
    }

    fn region_words(&self) -> usize {
        self.region_words
    }

    fn region_kind(&self, idx: usize) -> RegionKind {
        kind_from_u8(self.regions[idx].kind.load(Ordering::Acquire))
    }

    fn region_top(&self, idx: usize) -> HeapAddr {
        HeapAddr::new(self.regions[idx].top.load(Ordering::Acquire))
    }

    fn object_size(&self, obj: HeapAddr) -> usize {
        self.word(obj).load(Ordering::Acquire) & SIZE_MASK
    }

    fn for_each_reference(&self, obj: HeapAddr, f: &mut dyn FnMut(HeapAddr)) {
        for i in 0..self.nrefs(obj) {
            if let Some(child) = self.field(obj, i) {
                f(child);
            }
        }
    }

    fn for_each_root(&self, f: &mut dyn FnMut(HeapAddr)) {
        let roots = self.roots.read().clone();
        for root in roots {
            f(root);
        }
    }

    fn survivor_regions(&self) -> Vec<usize> {
        (0..self.regions.len())
            .filter(|&i| self.region_kind(i).is_young())
            .collect()
    }

    fn free_region(&self, idx: usize) {
        let _guard = self.alloc_lock.lock();
        let mut last = idx + 1;
        if self.region_kind(idx) == RegionKind::HumongousStart {
            while last < self.regions.len()
                && self.region_kind(last) == RegionKind::HumongousContinues
            {
                last += 1;
            }
        }
        for i in idx..last {
            let bottom = self.region_bottom(i);
            for w in 0..self.region_words {
                self.word(bottom.offset(w)).store(0, Ordering::Relaxed);
            }
            self.set_top(i, bottom);
            self.set_kind(i, RegionKind::Free);
        }
    }

    fn live_mutator_threads(&self) -> usize {
        self.mutator_threads.load(Ordering::Relaxed)
    }
}
