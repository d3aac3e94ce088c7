//! Marking statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Snapshot of [`MarkMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Concurrent cycles started (undo cycles included).
    pub cycles_started: usize,
    /// Cycles that ran cleanup to completion.
    pub cycles_completed: usize,
    /// Cycles ended by [`abort`](crate::MarkCoordinator::abort).
    pub cycles_aborted: usize,
    pub undo_cycles: usize,
    /// Mark loops re-run because remark overflowed.
    pub remark_restarts: usize,
    /// Concurrent overflow resets performed by task 0.
    pub overflow_resets: usize,
    pub mark_stack_expansions: usize,
    /// Survivor regions claimed for root scanning, all cycles.
    pub root_regions_scanned: usize,
    pub regions_reclaimed: usize,
    /// Old regions handed to the remembered set rebuild hook.
    pub rebuild_candidates: usize,
    pub objects_marked: usize,
    pub remark_pauses: usize,
    pub remark_time: Duration,
    pub cleanup_pauses: usize,
    pub cleanup_time: Duration,
}

/// Cumulative counters, updated concurrently.
#[derive(Debug, Default)]
pub struct MarkMetrics {
    cycles_started: AtomicUsize,
    cycles_completed: AtomicUsize,
    cycles_aborted: AtomicUsize,
    undo_cycles: AtomicUsize,
    remark_restarts: AtomicUsize,
    overflow_resets: AtomicUsize,
    mark_stack_expansions: AtomicUsize,
    root_regions_scanned: AtomicUsize,
    regions_reclaimed: AtomicUsize,
    rebuild_candidates: AtomicUsize,
    objects_marked: AtomicUsize,
    remark_pauses: AtomicUsize,
    remark_nanos: AtomicU64,
    cleanup_pauses: AtomicUsize,
    cleanup_nanos: AtomicU64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl MarkMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cycle_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle_aborted(&self) {
        self.cycles_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_undo_cycle(&self) {
        self.undo_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remark_restart(&self) {
        self.remark_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow_reset(&self) {
        self.overflow_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stack_expansion(&self) {
        self.mark_stack_expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_root_region_scanned(&self) {
        self.root_regions_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_regions_reclaimed(&self, n: usize) {
        self.regions_reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_rebuild_candidate(&self) {
        self.rebuild_candidates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_objects_marked(&self, n: usize) {
        self.objects_marked.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_remark(&self, elapsed: Duration) {
        self.remark_pauses.fetch_add(1, Ordering::Relaxed);
        self.remark_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_cleanup(&self, elapsed: Duration) {
        self.cleanup_pauses.fetch_add(1, Ordering::Relaxed);
        self.cleanup_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    /// Reads all counters. Individual values are consistent, the set is not.
    #[must_use]
    pub fn snapshot(&self) -> MarkStats {
        MarkStats {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_aborted: self.cycles_aborted.load(Ordering::Relaxed),
            undo_cycles: self.undo_cycles.load(Ordering::Relaxed),
            remark_restarts: self.remark_restarts.load(Ordering::Relaxed),
            overflow_resets: self.overflow_resets.load(Ordering::Relaxed),
            mark_stack_expansions: self.mark_stack_expansions.load(Ordering::Relaxed),
            root_regions_scanned: self.root_regions_scanned.load(Ordering::Relaxed),
            regions_reclaimed: self.regions_reclaimed.load(Ordering::Relaxed),
            rebuild_candidates: self.rebuild_candidates.load(Ordering::Relaxed),
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            remark_pauses: self.remark_pauses.load(Ordering::Relaxed),
            remark_time: Duration::from_nanos(self.remark_nanos.load(Ordering::Relaxed)),
            cleanup_pauses: self.cleanup_pauses.load(Ordering::Relaxed),
            cleanup_time: Duration::from_nanos(self.cleanup_nanos.load(Ordering::Relaxed)),
        }
    }
}
