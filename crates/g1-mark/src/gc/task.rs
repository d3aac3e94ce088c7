//! Per-worker marking task.
//!
//! A [`MarkTask`] does the actual tracing. Each call to
//! [`do_marking_step`](MarkTask::do_marking_step) is a time-boxed slice of
//! work: drain the SATB log, walk the bitmap of claimed regions, drain the
//! local queue and the global stack, steal, and finally offer termination.
//! The step can be aborted at any clock call and is simply called again.
//!
//! Grey objects below the task's local finger, or below the global finger
//! when the task holds no region, are pushed; anything ahead of both is
//! left for the bitmap walk to find.

use std::time::Instant;

use crate::addr::{HeapAddr, MemRegion};
use crate::gc::coordinator::MarkCoordinator;
use crate::gc::tracing;
use crate::policy::TruncatedSeq;

/// Entries moved between a local queue and the global stack at once.
const GLOBAL_STACK_TRANSFER_SIZE: usize = 16;

/// Upper bound on what a partial local drain leaves behind.
const DRAIN_STACK_TARGET_SIZE: usize = 64;

/// Marking state of one worker.
#[derive(Debug)]
pub struct MarkTask {
    worker_id: usize,

    curr_region: Option<usize>,
    finger: Option<HeapAddr>,
    region_limit: HeapAddr,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,

    start_time: Instant,
    time_target_ms: f64,
    step_times_ms: TruncatedSeq,
    marking_step_diffs_ms: TruncatedSeq,

    hash_seed: usize,
    calls: usize,
    objects_marked: usize,
    overflow_barrier_passes: [usize; 2],
}

impl MarkTask {
    pub(crate) fn new(worker_id: usize) -> Self {
        let mut marking_step_diffs_ms = TruncatedSeq::default();
        // Start with a non-zero correction so the first steps stop early.
        marking_step_diffs_ms.add(0.5);
        Self {
            worker_id,
            curr_region: None,
            finger: None,
            region_limit: HeapAddr::default(),
            words_scanned: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            start_time: Instant::now(),
            time_target_ms: 0.0,
            step_times_ms: TruncatedSeq::default(),
            marking_step_diffs_ms,
            hash_seed: worker_id,
            calls: 0,
            objects_marked: 0,
            overflow_barrier_passes: [0; 2],
        }
    }

    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether the last step returned before finishing its work.
    #[must_use]
    pub const fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    /// Whether the last step ran out of time.
    #[must_use]
    pub const fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }

    /// Steps run since the last cycle reset.
    #[must_use]
    pub const fn calls(&self) -> usize {
        self.calls
    }

    /// How often this task passed the first and the second overflow
    /// barrier since the last cycle reset.
    #[must_use]
    pub const fn overflow_barrier_passes(&self) -> [usize; 2] {
        self.overflow_barrier_passes
    }

    /// Region currently being walked, if any.
    #[must_use]
    pub const fn current_region(&self) -> Option<usize> {
        self.curr_region
    }

    /// Recent step durations.
    #[must_use]
    pub const fn step_times_ms(&self) -> &TruncatedSeq {
        &self.step_times_ms
    }

    pub(crate) fn reset(&mut self) {
        self.clear_region_fields();
        self.calls = 0;
        self.overflow_barrier_passes = [0; 2];
        self.has_aborted = false;
        self.has_timed_out = false;
    }

    pub(crate) fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = None;
        self.region_limit = HeapAddr::default();
    }

    fn giveup_current_region(&mut self) {
        self.clear_region_fields();
    }

    fn setup_for_region(&mut self, cm: &MarkCoordinator, region: usize) {
        self.curr_region = Some(region);
        self.finger = Some(cm.heap().region_bottom(region));
        self.region_limit = HeapAddr::default();
        self.update_region_limit(cm);
    }

    /// Re-reads the scan limit of the current region.
    ///
    /// The limit only moves down, when the region was freed and reused after
    /// it was claimed.
    fn update_region_limit(&mut self, cm: &MarkCoordinator) {
        let Some(region) = self.curr_region else {
            return;
        };
        let limit = cm.next_tams(region);
        if limit < self.region_limit {
            // Freed and reused since the claim; the rest of the walk is stale.
            self.finger = Some(limit);
        } else {
            debug_assert!(self.finger.is_some_and(|f| limit >= f), "limit below finger");
        }
        self.region_limit = limit;
    }

    fn move_finger_to(&mut self, addr: HeapAddr) {
        debug_assert!(addr < self.region_limit, "finger past region limit");
        self.finger = Some(addr);
    }

    fn recalculate_limits(&mut self, cm: &MarkCoordinator) {
        let config = cm.config();
        self.real_words_scanned_limit = self.words_scanned + config.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + config.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pulls the next clock call closer after an expensive operation.
    fn decrease_limits(&mut self, cm: &MarkCoordinator) {
        let config = cm.config();
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * config.words_scanned_period / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * config.refs_reached_period / 4);
    }

    fn check_limits(&mut self, cm: &MarkCoordinator) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.regular_clock_call(cm);
        }
    }

    fn regular_clock_call(&mut self, cm: &MarkCoordinator) {
        if self.has_aborted {
            return;
        }
        self.recalculate_limits(cm);

        if cm.has_overflown() {
            self.has_aborted = true;
            return;
        }
        // Remark runs to completion; the remaining checks are for the
        // concurrent phase only.
        if !cm.concurrent() {
            return;
        }
        if cm.has_aborted() {
            self.has_aborted = true;
            return;
        }
        if cm.sts().should_yield() {
            self.has_aborted = true;
            return;
        }
        if self.elapsed_ms() > self.time_target_ms {
            self.has_aborted = true;
            self.has_timed_out = true;
            return;
        }
        if !self.draining_satb_buffers && cm.satb().process_completed_buffers() {
            self.has_aborted = true;
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64() * 1000.0
    }

    /// Marks `obj` and makes it grey if a bitmap walk will not reach it.
    pub(crate) fn deal_with_reference(&mut self, cm: &MarkCoordinator, obj: HeapAddr) {
        self.refs_reached += 1;
        if !cm.mark_and_count(obj) {
            return;
        }
        self.objects_marked += 1;
        if self.finger.is_some_and(|f| obj < f) {
            self.push(cm, obj);
        } else if self.curr_region.is_some() && obj < self.region_limit {
            // Ahead of our finger in our own region.
        } else if obj < cm.finger() {
            self.push(cm, obj);
        }
    }

    fn push(&mut self, cm: &MarkCoordinator, obj: HeapAddr) {
        let queue = cm.queues().queue(self.worker_id);
        if !queue.push(obj) {
            self.move_entries_to_global_stack(cm);
            let pushed = queue.push(obj);
            debug_assert!(pushed, "local queue full after spilling");
        }
    }

    fn move_entries_to_global_stack(&mut self, cm: &MarkCoordinator) {
        let queue = cm.queues().queue(self.worker_id);
        let mut buffer = [HeapAddr::default(); GLOBAL_STACK_TRANSFER_SIZE];
        let mut n = 0;
        while n < GLOBAL_STACK_TRANSFER_SIZE {
            let Some(obj) = queue.pop() else { break };
            buffer[n] = obj;
            n += 1;
        }
        // On overflow the popped entries are dropped; they are marked and the
        // restart walks the bitmap from the heap start.
        if n > 0 && !cm.mark_stack_push(&buffer[..n]) {
            self.has_aborted = true;
        }
        self.decrease_limits(cm);
    }

    fn get_entries_from_global_stack(&mut self, cm: &MarkCoordinator) {
        let mut buffer = [HeapAddr::default(); GLOBAL_STACK_TRANSFER_SIZE];
        let n = cm.mark_stack().par_pop_arr(&mut buffer);
        let queue = cm.queues().queue(self.worker_id);
        for &obj in &buffer[..n] {
            if !queue.push(obj) {
                self.scan_object(cm, obj);
            }
        }
        self.decrease_limits(cm);
    }

    fn scan_object(&mut self, cm: &MarkCoordinator, obj: HeapAddr) {
        let heap = cm.heap();
        self.words_scanned += heap.object_size(obj);
        heap.for_each_reference(obj, &mut |child| self.deal_with_reference(cm, child));
        self.check_limits(cm);
    }

    fn drain_local_queue(&mut self, cm: &MarkCoordinator, partially: bool) {
        if self.has_aborted {
            return;
        }
        let queue = cm.queues().queue(self.worker_id);
        let target = if partially {
            (queue.capacity() / 3).min(DRAIN_STACK_TARGET_SIZE)
        } else {
            0
        };
        while queue.len() > target && !self.has_aborted {
            let Some(obj) = queue.pop() else { break };
            self.scan_object(cm, obj);
        }
    }

    fn drain_global_stack(&mut self, cm: &MarkCoordinator, partially: bool) {
        if self.has_aborted {
            return;
        }
        let stack = cm.mark_stack();
        let target = if partially { stack.capacity() / 3 } else { 0 };
        while !self.has_aborted && stack.size() > target {
            self.get_entries_from_global_stack(cm);
            self.drain_local_queue(cm, partially);
        }
    }

    fn drain_satb_buffers(&mut self, cm: &MarkCoordinator) {
        self.draining_satb_buffers = true;
        while !self.has_aborted
            && cm
                .satb()
                .apply_closure_to_completed_buffer(|obj| self.deal_with_reference(cm, obj))
        {
            self.regular_clock_call(cm);
        }
        self.draining_satb_buffers = false;
        self.decrease_limits(cm);
    }

    /// Walks the rest of the current region's bitmap.
    fn scan_current_region(&mut self, cm: &MarkCoordinator, region: usize) {
        self.update_region_limit(cm);
        let bottom = cm.heap().region_bottom(region);
        let start = self.finger.unwrap_or(bottom);
        let mr = MemRegion::new(start, self.region_limit);

        if mr.is_empty() {
            self.giveup_current_region();
            self.regular_clock_call(cm);
            return;
        }

        let bitmap = cm.next_bitmap();
        if cm.heap().region_kind(region).is_humongous() && mr.start() == bottom {
            // A humongous object starts at bottom and nowhere else.
            if bitmap.is_marked(bottom) {
                self.visit_marked(cm, bottom);
            }
            self.giveup_current_region();
            self.regular_clock_call(cm);
            return;
        }

        if bitmap.iterate(mr, |addr| self.visit_marked(cm, addr)) {
            self.giveup_current_region();
            self.regular_clock_call(cm);
        } else {
            // Aborted inside the walk. Skip the object just scanned so a
            // resumed step does not scan it again.
            let finger = self.finger.unwrap_or(bottom);
            let new_finger = bitmap.next_object(finger);
            if new_finger >= self.region_limit {
                self.giveup_current_region();
            } else {
                self.move_finger_to(new_finger);
            }
        }
    }

    fn visit_marked(&mut self, cm: &MarkCoordinator, addr: HeapAddr) -> bool {
        self.move_finger_to(addr);
        self.scan_object(cm, addr);
        self.drain_local_queue(cm, true);
        self.drain_global_stack(cm, true);
        !self.has_aborted
    }

    /// Runs one slice of marking work.
    ///
    /// `time_target_ms` bounds the slice during concurrent marking.
    /// `do_termination` makes the task steal and take part in termination
    /// once its own work is done. `is_serial` is set when the task runs
    /// alone, which skips stealing partners and the overflow barriers.
    ///
    /// On return, [`has_aborted`](Self::has_aborted) tells whether the
    /// caller must call again.
    pub fn do_marking_step(
        &mut self,
        cm: &MarkCoordinator,
        time_target_ms: f64,
        do_termination: bool,
        is_serial: bool,
    ) {
        self.start_time = Instant::now();
        self.calls += 1;
        self.time_target_ms = time_target_ms - self.marking_step_diffs_ms.predict();

        self.words_scanned = 0;
        self.refs_reached = 0;
        self.recalculate_limits(cm);
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb_buffers = false;

        if cm.has_overflown() {
            // Go straight to the overflow protocol below.
            self.has_aborted = true;
        }

        self.drain_satb_buffers(cm);
        self.drain_local_queue(cm, true);
        self.drain_global_stack(cm, true);

        loop {
            if !self.has_aborted {
                if let Some(region) = self.curr_region {
                    self.scan_current_region(cm, region);
                }
            }

            self.drain_local_queue(cm, true);
            self.drain_global_stack(cm, true);

            while !self.has_aborted && self.curr_region.is_none() && !cm.out_of_regions() {
                if let Some(region) = cm.claim_region() {
                    self.setup_for_region(cm, region);
                }
                // Bounds latency through long runs of empty regions.
                self.regular_clock_call(cm);
            }

            if self.curr_region.is_none() || self.has_aborted {
                break;
            }
        }
        debug_assert!(
            self.curr_region.is_none() || self.has_aborted,
            "left region loop holding a region"
        );

        if !self.has_aborted {
            // Less SATB work left for remark.
            self.drain_satb_buffers(cm);
        }
        self.drain_local_queue(cm, false);
        self.drain_global_stack(cm, false);

        if do_termination && !is_serial && cm.config().work_stealing {
            let active = cm.active_tasks();
            while !self.has_aborted {
                let Some(obj) = cm.queues().steal(self.worker_id, active, &mut self.hash_seed)
                else {
                    break;
                };
                self.scan_object(cm, obj);
                self.drain_local_queue(cm, false);
                self.drain_global_stack(cm, false);
            }
        }

        if do_termination && !self.has_aborted {
            let finished = is_serial
                || cm.terminator().offer_termination(cm.queues(), || {
                    self.regular_clock_call(cm);
                    !cm.mark_stack().is_empty() || self.has_aborted
                });
            if finished {
                if self.worker_id == 0 && cm.concurrent() {
                    cm.clear_concurrent_marking_in_progress();
                }
                debug_assert!(cm.mark_stack().is_empty(), "finished with a non-empty stack");
                debug_assert!(
                    cm.queues().queue(self.worker_id).is_empty(),
                    "finished with a non-empty queue"
                );
            } else {
                // More work showed up; the caller runs another step.
                self.has_aborted = true;
            }
        }

        let elapsed_ms = self.elapsed_ms();
        self.step_times_ms.add(elapsed_ms);
        if self.objects_marked > 0 {
            cm.metrics().record_objects_marked(self.objects_marked);
            self.objects_marked = 0;
        }

        if self.has_aborted {
            if self.has_timed_out {
                self.marking_step_diffs_ms.add(elapsed_ms - self.time_target_ms);
                tracing::log_step_timed_out(self.worker_id, self.time_target_ms, elapsed_ms);
            }
            if cm.has_overflown() {
                // Nobody may resume marking until every task has stopped and
                // the global state was reset.
                if !is_serial && cm.enter_first_sync_barrier(self.worker_id) {
                    self.overflow_barrier_passes[0] += 1;
                }
                self.clear_region_fields();
                if !is_serial && cm.enter_second_sync_barrier() {
                    self.overflow_barrier_passes[1] += 1;
                }
            }
        }
    }
}
