//! The heap as seen by the marking engine.
//!
//! The engine never allocates, moves or frees objects itself. Everything it
//! needs from the region allocator and the object model goes through
//! [`HeapAccess`]; the optional callbacks at phase boundaries go through
//! [`MarkingHooks`].

use crate::addr::{HeapAddr, MemRegion};

/// What a heap region currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Free,
    Eden,
    Survivor,
    Old,
    /// First region of a humongous object; the object starts at `bottom`.
    HumongousStart,
    /// Tail of a humongous object. Holds no object header.
    HumongousContinues,
}

impl RegionKind {
    #[must_use]
    pub const fn is_young(self) -> bool {
        matches!(self, Self::Eden | Self::Survivor)
    }

    #[must_use]
    pub const fn is_humongous(self) -> bool {
        matches!(self, Self::HumongousStart | Self::HumongousContinues)
    }

    /// Regions sampled at their `top` when marking starts: what lies below
    /// must be traced, what lies above is new.
    ///
    /// A humongous tail counts, so its words are accounted once, through the
    /// start region's object.
    #[must_use]
    pub const fn is_marked_through(self) -> bool {
        matches!(
            self,
            Self::Old | Self::HumongousStart | Self::HumongousContinues
        )
    }
}

/// Region allocator and object model consumed by marking.
///
/// Regions are fixed-size and numbered from the start of the reserved range.
/// `region_top` of a region may grow while it is unclaimed but is stable
/// below the region's TAMS once marking has started.
pub trait HeapAccess: Send + Sync {
    /// The reserved heap range; marking covers all of it.
    fn reserved(&self) -> MemRegion;

    /// Words per region.
    fn region_words(&self) -> usize;

    fn region_kind(&self, idx: usize) -> RegionKind;

    /// First unallocated address of region `idx`.
    fn region_top(&self, idx: usize) -> HeapAddr;

    /// Size in words of the object starting at `obj`.
    fn object_size(&self, obj: HeapAddr) -> usize;

    /// Calls `f` with every non-null reference held by `obj`.
    fn for_each_reference(&self, obj: HeapAddr, f: &mut dyn FnMut(HeapAddr));

    /// Calls `f` with every strong root.
    fn for_each_root(&self, f: &mut dyn FnMut(HeapAddr));

    /// Young regions whose contents must be scanned as marking roots.
    fn survivor_regions(&self) -> Vec<usize>;

    /// Returns region `idx` to the free list.
    ///
    /// For a humongous start region the whole series is released.
    fn free_region(&self, idx: usize);

    /// Live application threads, for the adaptive worker count.
    fn live_mutator_threads(&self) -> usize {
        1
    }

    fn num_regions(&self) -> usize {
        self.reserved().word_size() / self.region_words()
    }

    fn region_bottom(&self, idx: usize) -> HeapAddr {
        self.reserved().start().offset(idx * self.region_words())
    }

    fn region_end(&self, idx: usize) -> HeapAddr {
        self.region_bottom(idx).offset(self.region_words())
    }

    /// Index of the region containing `addr`.
    fn region_index(&self, addr: HeapAddr) -> usize {
        addr.words_since(self.reserved().start()) / self.region_words()
    }
}

/// Callbacks into the rest of the collector at fixed points of a cycle.
///
/// All methods default to doing nothing.
pub trait MarkingHooks: Send + Sync {
    /// Remark, after reference processing: unlink dead entries from weak
    /// tables such as string and symbol tables.
    fn clean_weak_roots(&self, _is_alive: &dyn Fn(HeapAddr) -> bool) {}

    /// Remark, when class unloading is enabled.
    fn unload_classes(&self, _is_alive: &dyn Fn(HeapAddr) -> bool) {}

    /// Rebuild phase: region `idx` was selected with `live_words` live.
    fn rebuild_remembered_set(&self, _idx: usize, _live_words: usize) {}

    /// Cleanup pause, when remembered set scrubbing is enabled.
    fn scrub_remembered_sets(&self, _is_live_region: &dyn Fn(usize) -> bool) {}

    /// Cleanup pause, after dead regions were collected.
    fn purge_class_loaders(&self) {}

    /// Cleanup pause, for string deduplication bookkeeping.
    fn string_dedup_cleanup(&self) {}

    /// End of a cycle, for GC event tracing.
    fn cycle_finished(&self, _aborted: bool) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl MarkingHooks for NoHooks {}
