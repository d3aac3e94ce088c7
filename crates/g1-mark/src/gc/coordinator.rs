//! Global marking state and phase orchestration.
//!
//! [`MarkCoordinator`] owns everything the marking tasks share: the two mark
//! bitmaps, per-region top-at-mark-start and liveness, the global finger,
//! the global mark stack, the task queues and the overflow barriers. Its
//! methods implement the phases of a cycle; [`MarkDriverThread`] sequences
//! them.
//!
//! Pause phases ([`concurrent_start`], [`remark`], [`cleanup`], [`abort`])
//! must run with every concurrent marking thread stopped, normally through a
//! [`SafepointSynchronizer`](crate::SafepointSynchronizer).
//!
//! [`MarkDriverThread`]: crate::MarkDriverThread
//! [`concurrent_start`]: MarkCoordinator::concurrent_start
//! [`remark`]: MarkCoordinator::remark
//! [`cleanup`]: MarkCoordinator::cleanup
//! [`abort`]: MarkCoordinator::abort

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};

use crate::addr::{HeapAddr, MemRegion};
use crate::gc::config::MarkConfig;
use crate::gc::refproc::{ReferenceProcessor, SimpleReferenceProcessor};
use crate::gc::root_regions::RootRegionRegistry;
use crate::gc::satb::SatbQueueSet;
use crate::gc::sync::{RendezvousBarrier, SuspendibleThreadSet, SuspendibleThreadSetJoiner};
use crate::gc::task::MarkTask;
use crate::gc::terminator::TaskTerminator;
use crate::gc::tracing;
use crate::gc::workgang::WorkGang;
use crate::gc::worklist::TaskQueueSet;
use crate::heap::{HeapAccess, MarkingHooks, NoHooks, RegionKind};
use crate::mark::bitmap::MarkBitmap;
use crate::mark::stack::MarkStack;
use crate::metrics::MarkMetrics;
use crate::policy::{ConcurrentWorkerPolicy, MmuTracker, TruncatedSeq};

/// Time target of a step that must run to completion.
const UNBOUNDED_STEP_MS: f64 = 1.0e9;

/// Marking data kept per heap region.
#[derive(Debug)]
struct RegionMarkData {
    next_tams: AtomicUsize,
    prev_tams: AtomicUsize,
    live_words: AtomicUsize,
}

#[derive(Debug)]
struct PauseStats {
    remark_times_ms: TruncatedSeq,
    cleanup_times_ms: TruncatedSeq,
    mmu: MmuTracker,
}

/// The concurrent marking engine.
pub struct MarkCoordinator {
    config: MarkConfig,
    heap: Arc<dyn HeapAccess>,
    hooks: Arc<dyn MarkingHooks>,
    ref_processor: Arc<dyn ReferenceProcessor>,
    satb: Arc<SatbQueueSet>,
    sts: Arc<SuspendibleThreadSet>,

    reserved: MemRegion,
    bitmaps: [MarkBitmap; 2],
    next_bitmap: AtomicUsize,
    regions: Box<[RegionMarkData]>,
    finger: CachePadded<AtomicUsize>,

    mark_stack: MarkStack,
    root_regions: RootRegionRegistry,
    queues: TaskQueueSet,
    tasks: Box<[Mutex<MarkTask>]>,
    active_tasks: AtomicUsize,
    terminator: TaskTerminator,
    first_overflow_barrier: RendezvousBarrier,
    second_overflow_barrier: RendezvousBarrier,

    has_overflown: AtomicBool,
    concurrent: AtomicBool,
    has_aborted: AtomicBool,
    restart_for_overflow: AtomicBool,
    concurrent_marking_in_progress: AtomicBool,
    mark_in_progress: AtomicBool,
    during_cycle: AtomicBool,

    conc_workers: WorkGang,
    parallel_workers: WorkGang,
    worker_policy: ConcurrentWorkerPolicy,
    prev_active_workers: AtomicUsize,

    pause_stats: Mutex<PauseStats>,
    epoch: Instant,
    metrics: MarkMetrics,
    cleanup_list: SegQueue<usize>,
}

impl MarkCoordinator {
    /// Creates the engine for `heap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the global mark stack cannot be allocated.
    pub fn new(config: MarkConfig, heap: Arc<dyn HeapAccess>) -> io::Result<Self> {
        let reserved = heap.reserved();
        let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let worker_policy = ConcurrentWorkerPolicy::from_config(&config, cpus);
        let max_tasks = config.max_workers();

        let regions = (0..heap.num_regions())
            .map(|idx| {
                let bottom = heap.region_bottom(idx).as_usize();
                RegionMarkData {
                    next_tams: AtomicUsize::new(bottom),
                    prev_tams: AtomicUsize::new(bottom),
                    live_words: AtomicUsize::new(0),
                }
            })
            .collect();

        Ok(Self {
            mark_stack: MarkStack::allocate(config.mark_stack_size, config.mark_stack_size_max)?,
            bitmaps: [
                MarkBitmap::new(reserved, config.mark_granule_shift),
                MarkBitmap::new(reserved, config.mark_granule_shift),
            ],
            next_bitmap: AtomicUsize::new(0),
            regions,
            finger: CachePadded::new(AtomicUsize::new(reserved.start().as_usize())),
            root_regions: RootRegionRegistry::new(),
            queues: TaskQueueSet::new(max_tasks, config.task_queue_capacity),
            tasks: (0..max_tasks).map(|id| Mutex::new(MarkTask::new(id))).collect(),
            active_tasks: AtomicUsize::new(0),
            terminator: TaskTerminator::new(max_tasks),
            first_overflow_barrier: RendezvousBarrier::new(max_tasks),
            second_overflow_barrier: RendezvousBarrier::new(max_tasks),
            has_overflown: AtomicBool::new(false),
            concurrent: AtomicBool::new(false),
            has_aborted: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            concurrent_marking_in_progress: AtomicBool::new(false),
            mark_in_progress: AtomicBool::new(false),
            during_cycle: AtomicBool::new(false),
            conc_workers: WorkGang::new("g1-conc", worker_policy.max_threads()),
            parallel_workers: WorkGang::new("g1-par", config.parallel_gc_threads),
            prev_active_workers: AtomicUsize::new(worker_policy.max_threads()),
            worker_policy,
            pause_stats: Mutex::new(PauseStats {
                remark_times_ms: TruncatedSeq::default(),
                cleanup_times_ms: TruncatedSeq::default(),
                mmu: MmuTracker::from_config(&config),
            }),
            epoch: Instant::now(),
            metrics: MarkMetrics::new(),
            cleanup_list: SegQueue::new(),
            satb: Arc::new(SatbQueueSet::new(
                config.satb_buffer_size,
                config.satb_process_threshold,
            )),
            sts: Arc::new(SuspendibleThreadSet::new()),
            hooks: Arc::new(NoHooks),
            ref_processor: Arc::new(SimpleReferenceProcessor::new()),
            reserved,
            heap,
            config,
        })
    }

    /// Replaces the phase callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn MarkingHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replaces the reference processor.
    #[must_use]
    pub fn with_reference_processor(mut self, rp: Arc<dyn ReferenceProcessor>) -> Self {
        self.ref_processor = rp;
        self
    }

    // Accessors

    #[must_use]
    pub const fn config(&self) -> &MarkConfig {
        &self.config
    }

    #[must_use]
    pub fn heap(&self) -> &dyn HeapAccess {
        &*self.heap
    }

    /// The SATB queue set mutators log into.
    #[must_use]
    pub const fn satb_queue_set(&self) -> &Arc<SatbQueueSet> {
        &self.satb
    }

    /// The thread set concurrent marking threads join.
    #[must_use]
    pub const fn thread_set(&self) -> &Arc<SuspendibleThreadSet> {
        &self.sts
    }

    pub(crate) fn satb(&self) -> &SatbQueueSet {
        &self.satb
    }

    pub(crate) fn sts(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    /// The bitmap being built by the current cycle.
    #[must_use]
    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_bitmap.load(Ordering::Acquire)]
    }

    /// The result of the last completed cycle.
    #[must_use]
    pub fn prev_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next_bitmap.load(Ordering::Acquire)]
    }

    #[must_use]
    pub const fn mark_stack(&self) -> &MarkStack {
        &self.mark_stack
    }

    #[must_use]
    pub const fn root_regions(&self) -> &RootRegionRegistry {
        &self.root_regions
    }

    #[must_use]
    pub const fn metrics(&self) -> &MarkMetrics {
        &self.metrics
    }

    pub(crate) const fn queues(&self) -> &TaskQueueSet {
        &self.queues
    }

    pub(crate) const fn terminator(&self) -> &TaskTerminator {
        &self.terminator
    }

    /// Number of marking tasks.
    #[must_use]
    pub fn max_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks taking part in the current phase.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Takes exclusive hold of task `id` for running steps.
    ///
    /// # Panics
    ///
    /// Panics if the task is already held; two threads must never run the
    /// same task.
    pub fn claim_task(&self, id: usize) -> MutexGuard<'_, MarkTask> {
        self.tasks[id]
            .try_lock()
            .unwrap_or_else(|| panic!("marking task {id} claimed twice"))
    }

    // State queries

    /// True from concurrent start until cleanup or abort.
    #[must_use]
    pub fn is_marking_in_progress(&self) -> bool {
        self.mark_in_progress.load(Ordering::Acquire)
    }

    /// True from concurrent start until the driver finishes the cycle.
    #[must_use]
    pub fn during_cycle(&self) -> bool {
        self.during_cycle.load(Ordering::Acquire)
    }

    /// True while concurrent marking has not yet terminated.
    #[must_use]
    pub fn concurrent_marking_in_progress(&self) -> bool {
        self.concurrent_marking_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn clear_concurrent_marking_in_progress(&self) {
        self.concurrent_marking_in_progress.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    fn set_has_overflown(&self) {
        self.has_overflown.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    /// Whether the last remark overflowed and marking must run again.
    #[must_use]
    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    /// True while tasks run in the concurrent phase rather than a pause.
    #[must_use]
    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    /// The global finger: regions below it have been claimed.
    #[must_use]
    pub fn finger(&self) -> HeapAddr {
        HeapAddr::new(self.finger.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.reserved.end()
    }

    /// Top-at-mark-start of region `idx` for the current cycle.
    #[must_use]
    pub fn next_tams(&self, idx: usize) -> HeapAddr {
        HeapAddr::new(self.regions[idx].next_tams.load(Ordering::Acquire))
    }

    /// Top-at-mark-start of region `idx` for the last completed cycle.
    #[must_use]
    pub fn prev_tams(&self, idx: usize) -> HeapAddr {
        HeapAddr::new(self.regions[idx].prev_tams.load(Ordering::Acquire))
    }

    /// Live words of region `idx`: marked data plus everything allocated
    /// since marking started.
    #[must_use]
    pub fn region_live_words(&self, idx: usize) -> usize {
        let allocated = self
            .heap
            .region_top(idx)
            .as_usize()
            .saturating_sub(self.next_tams(idx).as_usize());
        self.regions[idx].live_words.load(Ordering::Acquire) + allocated
    }

    /// Whether `obj` survives the current marking.
    #[must_use]
    pub fn is_alive(&self, obj: HeapAddr) -> bool {
        if !self.reserved.contains(obj) {
            return true;
        }
        let idx = self.heap.region_index(obj);
        obj >= self.next_tams(idx) || self.next_bitmap().is_marked(obj)
    }

    /// Records that region `idx` was freed and reused during marking.
    ///
    /// Its limit drops to `bottom`, so a task holding it stops scanning.
    pub fn note_region_reused(&self, idx: usize) {
        let bottom = self.heap.region_bottom(idx).as_usize();
        let data = &self.regions[idx];
        data.next_tams.store(bottom, Ordering::Release);
        data.prev_tams.store(bottom, Ordering::Release);
        data.live_words.store(0, Ordering::Release);
    }

    // Marking primitives

    /// Marks `obj` in the next bitmap and accounts its size.
    ///
    /// Objects at or above their region's TAMS are implicitly live and are
    /// never marked. Returns `true` if this call marked the object.
    pub(crate) fn mark_and_count(&self, obj: HeapAddr) -> bool {
        if !self.reserved.contains(obj) {
            return false;
        }
        let idx = self.heap.region_index(obj);
        if obj >= self.next_tams(idx) {
            return false;
        }
        if !self.next_bitmap().mark(obj) {
            return false;
        }
        self.add_live_words(obj, idx);
        true
    }

    /// Spreads the size of `obj` over the regions it spans.
    fn add_live_words(&self, obj: HeapAddr, idx: usize) {
        let mut remaining = self.heap.object_size(obj);
        let mut cur = obj;
        let mut idx = idx;
        while remaining > 0 && idx < self.regions.len() {
            let end = self.heap.region_end(idx);
            let here = remaining.min(end.words_since(cur));
            self.regions[idx].live_words.fetch_add(here, Ordering::AcqRel);
            remaining -= here;
            cur = end;
            idx += 1;
        }
    }

    fn clear_live_data(&self) {
        for data in &*self.regions {
            data.live_words.store(0, Ordering::Release);
        }
    }

    /// Pushes `entries` onto the global stack, flagging overflow on failure.
    pub(crate) fn mark_stack_push(&self, entries: &[HeapAddr]) -> bool {
        self.mark_stack.par_push_arr(entries);
        if self.mark_stack.overflow() {
            self.set_has_overflown();
            return false;
        }
        true
    }

    /// Claims the region at the global finger and moves the finger past it.
    ///
    /// Returns `None` if the claimed region has nothing to scan, or if the
    /// finger reached the end of the heap; the caller just tries again.
    pub(crate) fn claim_region(&self) -> Option<usize> {
        let heap_end = self.reserved.end().as_usize();
        let mut finger = self.finger.load(Ordering::Acquire);
        while finger < heap_end {
            let idx = self.heap.region_index(HeapAddr::new(finger));
            let bottom = self.heap.region_bottom(idx);
            let end = self.heap.region_end(idx);
            let limit = self.next_tams(idx);
            match self.finger.compare_exchange(
                finger,
                end.as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (limit > bottom).then_some(idx),
                Err(actual) => finger = actual,
            }
        }
        None
    }

    // Phase setup

    fn reset_marking_state(&self, clear_overflow: bool) {
        if self.has_overflown() {
            self.mark_stack.set_should_expand(true);
        }
        self.mark_stack.set_empty();
        if clear_overflow {
            self.has_overflown.store(false, Ordering::Release);
        } else {
            debug_assert!(self.has_overflown(), "preserving an overflow that never happened");
        }
        self.finger
            .store(self.reserved.start().as_usize(), Ordering::Release);
        self.queues.set_empty();
    }

    fn set_non_marking_state(&self) {
        self.reset_marking_state(true);
        self.active_tasks.store(0, Ordering::Release);
        self.clear_concurrent_marking_in_progress();
    }

    /// Sets the number of tasks taking part in the next phase.
    ///
    /// Must not be called while tasks are running.
    pub fn set_concurrency(&self, active_tasks: usize) {
        assert!(
            active_tasks >= 1 && active_tasks <= self.tasks.len(),
            "active task count {active_tasks} out of range"
        );
        self.active_tasks.store(active_tasks, Ordering::Release);
        self.terminator.reset_for_reuse(active_tasks);
        self.first_overflow_barrier.set_n_workers(active_tasks);
        self.second_overflow_barrier.set_n_workers(active_tasks);
    }

    /// [`set_concurrency`](Self::set_concurrency) plus the phase tasks run in.
    pub fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.set_concurrency(active_tasks);
        self.concurrent.store(concurrent, Ordering::Release);
        if concurrent {
            self.concurrent_marking_in_progress
                .store(true, Ordering::Release);
        }
    }

    fn reset(&self) {
        self.reset_marking_state(true);
        for task in &*self.tasks {
            task.lock().reset();
        }
        self.clear_live_data();
        while self.cleanup_list.pop().is_some() {}
        self.has_aborted.store(false, Ordering::Release);
        self.restart_for_overflow.store(false, Ordering::Release);
        self.concurrent_marking_in_progress
            .store(true, Ordering::Release);
    }

    fn set_tams(&self) {
        for idx in 0..self.regions.len() {
            let tams = if self.heap.region_kind(idx).is_marked_through() {
                self.heap.region_top(idx)
            } else {
                self.heap.region_bottom(idx)
            };
            self.regions[idx]
                .next_tams
                .store(tams.as_usize(), Ordering::Release);
        }
    }

    fn mark_strong_roots(&self) {
        let mut marked = 0;
        self.heap.for_each_root(&mut |obj| {
            if self.mark_and_count(obj) {
                marked += 1;
            }
        });
        self.metrics.record_objects_marked(marked);
    }

    fn start_cycle(&self, undo: bool) {
        assert!(!self.during_cycle(), "concurrent cycle already in progress");
        self.reset();
        self.set_tams();
        self.mark_strong_roots();
        self.during_cycle.store(true, Ordering::Release);
        self.metrics.record_cycle_started();
        if undo {
            self.metrics.record_undo_cycle();
            self.clear_concurrent_marking_in_progress();
            return;
        }
        self.satb.set_active_all_threads(true, false);
        self.ref_processor.enable_discovery();
        self.mark_in_progress.store(true, Ordering::Release);
        self.root_regions.prepare_for_scan(self.heap.survivor_regions());
    }

    /// Concurrent start pause: resets marking, snapshots TAMS, activates the
    /// SATB log, marks strong roots and registers survivor root regions.
    pub fn concurrent_start(&self) {
        let start = Instant::now();
        tracing::log_phase_start("concurrent-start");
        self.start_cycle(false);
        tracing::log_phase_end("concurrent-start", start.elapsed());
    }

    /// Pause that starts a cycle which will be undone.
    ///
    /// The roots are marked as at a normal start, but nothing else is set up:
    /// the concurrent part only clears the bitmap again.
    pub fn concurrent_undo_start(&self) {
        let start = Instant::now();
        tracing::log_phase_start("undo");
        self.start_cycle(true);
        tracing::log_phase_end("undo", start.elapsed());
    }

    // Concurrent phases

    /// Scans every registered survivor region, marking what it references.
    pub fn scan_root_regions(&self) {
        if !self.root_regions.scan_in_progress() {
            return;
        }
        let start = Instant::now();
        tracing::log_phase_start("root-region-scan");
        let n = self
            .worker_policy
            .max_threads()
            .min(self.root_regions.num_regions());
        self.conc_workers.set_active_workers(n);
        self.conc_workers.run_task(|_| {
            let joiner = self.sts.joiner();
            while let Some(idx) = self.root_regions.claim_next() {
                self.scan_root_region(idx);
                self.metrics.record_root_region_scanned();
                if joiner.should_yield() {
                    joiner.yield_now();
                }
            }
        });
        self.root_regions.scan_finished();
        tracing::log_phase_end("root-region-scan", start.elapsed());
    }

    fn scan_root_region(&self, idx: usize) {
        let top = self.heap.region_top(idx);
        let mut cur = self.heap.region_bottom(idx);
        let mut marked = 0;
        while cur < top {
            let size = self.heap.object_size(cur).max(1);
            self.heap.for_each_reference(cur, &mut |obj| {
                if self.mark_and_count(obj) {
                    marked += 1;
                }
            });
            cur = cur.offset(size);
        }
        self.metrics.record_objects_marked(marked);
    }

    fn calc_active_marking_workers(&self) -> usize {
        self.worker_policy
            .active_workers(
                self.prev_active_workers.load(Ordering::Acquire),
                self.heap.live_mutator_threads(),
            )
            .clamp(1, self.tasks.len())
    }

    /// The concurrent mark loop: runs time-sliced steps on every active
    /// task until all terminate or marking is aborted.
    ///
    /// The calling thread must not be a member of the suspendible thread set.
    pub fn mark_from_roots(&self) {
        self.restart_for_overflow.store(false, Ordering::Release);
        let start = Instant::now();
        tracing::log_phase_start("mark-from-roots");

        let active = self
            .conc_workers
            .set_active_workers(self.calc_active_marking_workers());
        self.set_concurrency_and_phase(active, true);
        tracing::log_active_workers("mark-from-roots", active, self.conc_workers.total_workers());

        let step_ms = self.config.mark_step_duration_ms;
        let sleep_factor = self.worker_policy.sleep_factor();
        self.conc_workers.run_task(|worker_id| {
            let joiner = self.sts.joiner();
            if self.has_aborted() {
                return;
            }
            loop {
                let started = Instant::now();
                let aborted = {
                    let mut task = self.claim_task(worker_id);
                    task.do_marking_step(self, step_ms, true, false);
                    task.has_aborted()
                };
                let elapsed = started.elapsed();
                Self::do_yield_check(&joiner);
                if !self.has_aborted() && aborted && sleep_factor > 0.0 {
                    let _leaver = self.sts.leaver(true);
                    thread::sleep(elapsed.mul_f64(sleep_factor));
                }
                if self.has_aborted() || !aborted {
                    break;
                }
            }
        });

        self.prev_active_workers.store(active, Ordering::Release);
        tracing::log_phase_end("mark-from-roots", start.elapsed());
    }

    fn do_yield_check(joiner: &SuspendibleThreadSetJoiner<'_>) {
        if joiner.should_yield() {
            joiner.yield_now();
        }
    }

    /// Returns `false` if marking was aborted while waiting.
    pub(crate) fn enter_first_sync_barrier(&self, worker_id: usize) -> bool {
        let released = {
            let _leaver = self.sts.leaver(self.concurrent());
            self.first_overflow_barrier.enter()
        };
        if !released {
            // Marking was aborted; nothing to reset.
            return false;
        }
        // In remark the overflow flag must survive so the pause can restart
        // marking; the reset happens after reference processing instead.
        if self.concurrent() && worker_id == 0 {
            self.reset_marking_state(true);
            self.metrics.record_overflow_reset();
            tracing::log_reset_for_overflow(worker_id);
        }
        true
    }

    /// Returns `false` if marking was aborted while waiting.
    pub(crate) fn enter_second_sync_barrier(&self) -> bool {
        let _leaver = self.sts.leaver(self.concurrent());
        if !self.concurrent() {
            return self.second_overflow_barrier.enter();
        }
        // Every task is parked here, so the reset state cannot move.
        self.second_overflow_barrier.enter_with(|| {
            assert_eq!(self.finger(), self.reserved.start(), "finger not reset for overflow");
            assert!(self.mark_stack.is_empty(), "mark stack not emptied for overflow");
            assert!(
                !self.queues.peek(self.queues.len()),
                "task queues not emptied for overflow"
            );
            assert!(!self.has_overflown(), "overflow flag survived the reset");
        })
    }

    // Remark

    /// Remark pause: completes marking, processes references and decides
    /// whether marking must restart because the global stack overflowed.
    pub fn remark(&self) {
        if self.has_aborted() {
            self.mark_in_progress.store(false, Ordering::Release);
            return;
        }
        let start = Instant::now();
        tracing::log_phase_start("remark");

        self.finalize_marking();
        self.weak_refs_work();

        if self.has_overflown() {
            self.restart_for_overflow.store(true, Ordering::Release);
            self.reset_marking_state(true);
        } else {
            self.restart_for_overflow.store(false, Ordering::Release);
            self.satb.set_active_all_threads(false, true);
            self.set_non_marking_state();
        }

        if self.mark_stack.should_expand() {
            let before = self.mark_stack.capacity();
            self.mark_stack.expand();
            if self.mark_stack.capacity() != before {
                self.metrics.record_stack_expansion();
            }
        }

        let elapsed = start.elapsed();
        self.record_pause(start, elapsed, true);
        self.metrics.record_remark(elapsed);
        tracing::log_phase_end("remark", elapsed);
    }

    fn finalize_marking(&self) {
        self.satb.flush_partial_buffers();
        let active = self.parallel_workers.active_workers();
        self.set_concurrency_and_phase(active, false);
        self.parallel_workers.run_task(|worker_id| {
            let mut task = self.claim_task(worker_id);
            loop {
                task.do_marking_step(self, UNBOUNDED_STEP_MS, true, false);
                if !task.has_aborted() || self.has_overflown() {
                    break;
                }
            }
        });
        debug_assert!(
            self.has_overflown() || self.satb.completed_buffers_num() == 0,
            "SATB buffers left after remark marking"
        );
    }

    fn weak_refs_work(&self) {
        if self.has_overflown() {
            // The bitmap is incomplete; processing would clear live referents.
            return;
        }
        let is_alive = |obj: HeapAddr| self.is_alive(obj);

        self.set_concurrency(1);
        {
            let mut guard = self.claim_task(0);
            let task = RefCell::new(&mut *guard);
            let interval = self.config.ref_proc_drain_interval.max(1);
            let step_ms = self.config.mark_step_duration_ms;
            let mut ref_counter = interval;

            let mut keep_alive = |obj: HeapAddr| {
                if self.has_overflown() {
                    return false;
                }
                let mut task = task.borrow_mut();
                task.deal_with_reference(self, obj);
                ref_counter -= 1;
                if ref_counter == 0 {
                    loop {
                        task.do_marking_step(self, step_ms, false, true);
                        if !task.has_aborted() || self.has_overflown() {
                            break;
                        }
                    }
                    ref_counter = interval;
                }
                !self.has_overflown()
            };
            let mut drain = || {
                let mut task = task.borrow_mut();
                loop {
                    task.do_marking_step(self, UNBOUNDED_STEP_MS, true, true);
                    if !task.has_aborted() || self.has_overflown() {
                        break;
                    }
                }
                !self.has_overflown()
            };
            let stats = self.ref_processor.process_discovered_references(
                &is_alive,
                &mut keep_alive,
                &mut drain,
                self.config.clear_all_soft_refs,
            );
            tracing::log_reference_processing(&stats);
        }

        if self.mark_stack.overflow() {
            self.set_has_overflown();
        }
        if self.has_overflown() {
            return;
        }
        debug_assert!(self.mark_stack.is_empty(), "marking should have completed");

        self.hooks.clean_weak_roots(&is_alive);
        if self.config.class_unloading {
            self.hooks.unload_classes(&is_alive);
        }
    }

    // Rebuild and cleanup

    /// Hands every old region with little live data to the remembered set
    /// rebuild hook. Returns the number of regions selected.
    pub fn rebuild_remembered_sets(&self) -> usize {
        let start = Instant::now();
        tracing::log_phase_start("rebuild");
        let joiner = self.sts.joiner();
        let threshold =
            self.heap.region_words() * self.config.mixed_gc_live_threshold_percent as usize / 100;
        let mut selected = 0;
        for idx in 0..self.regions.len() {
            if self.has_aborted() {
                break;
            }
            if self.heap.region_kind(idx) != RegionKind::Old {
                continue;
            }
            let live = self.region_live_words(idx);
            // Empty regions are reclaimed at cleanup instead.
            if live > 0 && live < threshold {
                self.hooks.rebuild_remembered_set(idx, live);
                self.metrics.record_rebuild_candidate();
                selected += 1;
            }
            Self::do_yield_check(&joiner);
        }
        drop(joiner);
        tracing::log_rebuild_selected(selected);
        tracing::log_phase_end("rebuild", start.elapsed());
        selected
    }

    /// Cleanup pause: ends marking, swaps the bitmaps and collects regions
    /// with no live data for [`complete_cleanup`](Self::complete_cleanup).
    pub fn cleanup(&self) {
        if self.has_aborted() {
            self.mark_in_progress.store(false, Ordering::Release);
            return;
        }
        let start = Instant::now();
        tracing::log_phase_start("cleanup");
        self.mark_stack.note_start_of_gc();
        self.mark_in_progress.store(false, Ordering::Release);

        let mut reclaimable = 0;
        let mut live_total = 0;
        for idx in 0..self.regions.len() {
            let live = self.region_live_words(idx);
            live_total += live;
            let kind = self.heap.region_kind(idx);
            if kind.is_young() || matches!(kind, RegionKind::Free | RegionKind::HumongousContinues)
            {
                continue;
            }
            let used = self
                .heap
                .region_top(idx)
                .words_since(self.heap.region_bottom(idx));
            if used > 0 && live == 0 {
                self.cleanup_list.push(idx);
                reclaimable += 1;
            }
        }

        for data in &*self.regions {
            data.prev_tams
                .store(data.next_tams.load(Ordering::Acquire), Ordering::Release);
        }
        self.next_bitmap.fetch_xor(1, Ordering::AcqRel);

        if self.config.scrub_rem_sets {
            self.hooks
                .scrub_remembered_sets(&|idx| self.region_live_words(idx) > 0);
        }
        if self.config.class_unloading {
            self.hooks.purge_class_loaders();
        }
        self.hooks.string_dedup_cleanup();
        self.mark_stack.note_end_of_gc();

        let elapsed = start.elapsed();
        self.record_pause(start, elapsed, false);
        self.metrics.record_cleanup(elapsed);
        self.metrics.record_cycle_completed();
        tracing::log_cleanup(reclaimable, live_total);
        tracing::log_phase_end("cleanup", elapsed);
    }

    /// Frees the regions found empty at cleanup. Returns how many.
    pub fn complete_cleanup(&self) -> usize {
        if self.has_aborted() {
            return 0;
        }
        let mut freed = 0;
        while let Some(idx) = self.cleanup_list.pop() {
            let mut end = idx + 1;
            if self.heap.region_kind(idx) == RegionKind::HumongousStart {
                while end < self.regions.len()
                    && self.heap.region_kind(end) == RegionKind::HumongousContinues
                {
                    end += 1;
                }
            }
            self.heap.free_region(idx);
            for reused in idx..end {
                self.note_region_reused(reused);
            }
            freed += 1;
        }
        self.metrics.record_regions_reclaimed(freed);
        freed
    }

    /// Clears the next bitmap in chunks, yielding between them.
    ///
    /// Stops early if marking is aborted; the abort clears the bitmap itself.
    pub fn clear_next_bitmap(&self) {
        let start = Instant::now();
        tracing::log_phase_start("clear-bitmap");
        let joiner = self.sts.joiner();
        let bitmap = self.next_bitmap();
        let covered = bitmap.covered();
        let chunk = self.config.clear_bitmap_chunk_words.max(1);
        let mut cur = covered.start();
        while cur < covered.end() && !self.has_aborted() {
            let end = cur.offset(chunk).min(covered.end());
            bitmap.clear_range(MemRegion::new(cur, end));
            cur = end;
            Self::do_yield_check(&joiner);
        }
        drop(joiner);
        self.clear_live_data();
        tracing::log_phase_end("clear-bitmap", start.elapsed());
    }

    /// Ends the cycle started at concurrent start.
    ///
    /// The driver calls this after the last phase; code sequencing the
    /// phases by hand must do the same before starting another cycle.
    pub fn note_cycle_end(&self) {
        self.concurrent.store(false, Ordering::Release);
        self.during_cycle.store(false, Ordering::Release);
        self.hooks.cycle_finished(self.has_aborted());
    }

    // Abort

    /// Abandons the current cycle, for example because a full collection
    /// takes over.
    ///
    /// Clears the next bitmap (the previous one stays valid), drops all
    /// marking work, releases tasks blocked in the overflow barriers and
    /// makes every task stop at its next clock call. Must run in a pause.
    pub fn abort(&self) {
        if !self.during_cycle() || self.has_aborted() {
            return;
        }
        self.next_bitmap().clear_all();
        self.clear_live_data();
        self.reset_marking_state(true);
        for task in &*self.tasks {
            // A task blocked in a barrier clears its own fields when woken.
            if let Some(mut task) = task.try_lock() {
                task.clear_region_fields();
            }
        }
        self.first_overflow_barrier.abort();
        self.second_overflow_barrier.abort();
        self.has_aborted.store(true, Ordering::Release);
        self.root_regions.abort();
        self.mark_in_progress.store(false, Ordering::Release);

        self.satb.abandon_partial_marking();
        self.satb
            .set_active_all_threads(false, self.satb.is_active());
        self.ref_processor.abandon_partial_discovery();
        self.metrics.record_cycle_aborted();
        tracing::log_abort();
    }

    /// Makes running tasks stop without resetting any state. Used at
    /// shutdown.
    pub(crate) fn abort_marking_threads(&self) {
        self.has_aborted.store(true, Ordering::Release);
        self.first_overflow_barrier.abort();
        self.second_overflow_barrier.abort();
    }

    // Pacing

    fn record_pause(&self, start: Instant, elapsed: Duration, remark: bool) {
        let begin = start.duration_since(self.epoch).as_secs_f64();
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut stats = self.pause_stats.lock();
        if remark {
            stats.remark_times_ms.add(ms);
        } else {
            stats.cleanup_times_ms.add(ms);
        }
        stats.mmu.add_pause(begin, begin + elapsed.as_secs_f64());
    }

    /// How long to wait before a remark (or cleanup) pause to keep the
    /// pause time goal.
    #[must_use]
    pub fn mmu_delay(&self, remark: bool) -> Duration {
        let stats = self.pause_stats.lock();
        let predicted_ms = if remark {
            stats.remark_times_ms.predict()
        } else {
            stats.cleanup_times_ms.predict()
        };
        let now = self.epoch.elapsed().as_secs_f64();
        Duration::from_millis(stats.mmu.when_ms(now, predicted_ms))
    }

    // Diagnostics

    /// Writes accumulated statistics. Safe to call at any time.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn print_summary_info(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let s = self.metrics.snapshot();
        writeln!(out, "Concurrent marking:")?;
        writeln!(
            out,
            "  cycles: {} started, {} completed, {} aborted, {} undone",
            s.cycles_started, s.cycles_completed, s.cycles_aborted, s.undo_cycles
        )?;
        {
            let stats = self.pause_stats.lock();
            print_pauses(out, "remark", s.remark_pauses, s.remark_time, &stats.remark_times_ms)?;
            print_pauses(out, "cleanup", s.cleanup_pauses, s.cleanup_time, &stats.cleanup_times_ms)?;
        }
        writeln!(
            out,
            "  overflow: {} remark restarts, {} concurrent resets",
            s.remark_restarts, s.overflow_resets
        )?;
        writeln!(
            out,
            "  mark stack: capacity {} (max {}), {} expansions",
            self.mark_stack.capacity(),
            self.mark_stack.max_capacity(),
            s.mark_stack_expansions
        )?;
        writeln!(
            out,
            "  {} objects marked, {} root regions scanned, {} regions reclaimed, {} rebuild candidates",
            s.objects_marked, s.root_regions_scanned, s.regions_reclaimed, s.rebuild_candidates
        )?;
        for (id, task) in self.tasks.iter().enumerate() {
            match task.try_lock() {
                Some(task) => {
                    let times = task.step_times_ms();
                    writeln!(
                        out,
                        "  task {id}: {} steps, recent avg {:.3} ms, max {:.3} ms",
                        task.calls(),
                        times.avg(),
                        times.maximum()
                    )?;
                }
                None => writeln!(out, "  task {id}: running")?,
            }
        }
        Ok(())
    }

    /// Lists the worker gangs.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn print_worker_threads_on(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for gang in [&self.conc_workers, &self.parallel_workers] {
            writeln!(
                out,
                "{}: {} of {} workers active",
                gang.name(),
                gang.active_workers(),
                gang.total_workers()
            )?;
        }
        Ok(())
    }
}

fn print_pauses(
    out: &mut dyn fmt::Write,
    name: &str,
    count: usize,
    total: Duration,
    recent: &TruncatedSeq,
) -> fmt::Result {
    let total_ms = total.as_secs_f64() * 1000.0;
    let avg_ms = if count == 0 { 0.0 } else { total_ms / count as f64 };
    writeln!(
        out,
        "  {name}: {count} pauses, total {total_ms:.2} ms, avg {avg_ms:.2} ms, recent max {:.2} ms",
        recent.maximum()
    )
}

impl fmt::Debug for MarkCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkCoordinator")
            .field("reserved", &self.reserved)
            .field("finger", &self.finger())
            .field("active_tasks", &self.active_tasks())
            .field("has_overflown", &self.has_overflown())
            .field("has_aborted", &self.has_aborted())
            .field("mark_in_progress", &self.is_marking_in_progress())
            .field("mark_stack", &self.mark_stack)
            .finish_non_exhaustive()
    }
}
