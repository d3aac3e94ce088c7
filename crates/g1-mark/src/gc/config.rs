//! Marking configuration.

use std::thread;

/// Tunables for concurrent marking.
///
/// Fields are public; the setters clamp values into their valid range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkConfig {
    /// Stop-the-world worker threads, used at remark.
    pub parallel_gc_threads: usize,
    /// Fixed concurrent worker count. 0 derives it from the other settings.
    pub conc_gc_threads: usize,
    /// Scale concurrent workers with the number of live mutator threads.
    pub use_dynamic_worker_count: bool,
    /// Marking overhead target relative to the pause goal. 0 disables it.
    pub marking_overhead_percent: u32,
    /// Pause time goal for the MMU tracker.
    pub max_gc_pause_ms: u64,
    /// Time slice of the MMU tracker.
    pub gc_pause_interval_ms: u64,
    /// Initial global mark stack capacity in entries.
    pub mark_stack_size: usize,
    /// Global mark stack capacity ceiling in entries.
    pub mark_stack_size_max: usize,
    /// Per-task queue capacity; a power of two.
    pub task_queue_capacity: usize,
    /// Time slice of one concurrent marking step.
    pub mark_step_duration_ms: f64,
    /// Words scanned between two clock calls.
    pub words_scanned_period: usize,
    /// References visited between two clock calls.
    pub refs_reached_period: usize,
    /// Completed SATB buffers above which tasks drain them.
    pub satb_process_threshold: usize,
    /// Entries per SATB buffer.
    pub satb_buffer_size: usize,
    /// References kept alive between two drains during reference processing.
    pub ref_proc_drain_interval: usize,
    pub work_stealing: bool,
    pub class_unloading: bool,
    pub scrub_rem_sets: bool,
    /// Clear soft references regardless of policy.
    pub clear_all_soft_refs: bool,
    /// Words cleared between two yield checks when clearing a bitmap.
    pub clear_bitmap_chunk_words: usize,
    /// Old regions with less live data than this share of their size are
    /// selected for remembered set rebuild.
    pub mixed_gc_live_threshold_percent: u32,
    /// Sleep before remark and cleanup to honour the MMU goal.
    pub adaptive_mmu_delay: bool,
    /// log2 of words per mark bit.
    pub mark_granule_shift: u32,
}

impl Default for MarkConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            parallel_gc_threads: cpus,
            conc_gc_threads: 0,
            use_dynamic_worker_count: false,
            marking_overhead_percent: 0,
            max_gc_pause_ms: 200,
            gc_pause_interval_ms: 201,
            mark_stack_size: 32 * 1024,
            mark_stack_size_max: 4 * 1024 * 1024,
            task_queue_capacity: 16 * 1024,
            mark_step_duration_ms: 10.0,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 384,
            satb_process_threshold: 20,
            satb_buffer_size: 1024,
            ref_proc_drain_interval: 10,
            work_stealing: true,
            class_unloading: true,
            scrub_rem_sets: false,
            clear_all_soft_refs: false,
            clear_bitmap_chunk_words: 1024 * 1024,
            mixed_gc_live_threshold_percent: 85,
            adaptive_mmu_delay: true,
            mark_granule_shift: 0,
        }
    }
}

impl MarkConfig {
    /// Default configuration with `workers` threads for both phases.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            parallel_gc_threads: workers,
            conc_gc_threads: workers,
            ..Default::default()
        }
    }

    pub const fn set_parallel_gc_threads(&mut self, n: usize) {
        self.parallel_gc_threads = if n < 1 { 1 } else { n };
    }

    /// 0 means derive.
    pub const fn set_conc_gc_threads(&mut self, n: usize) {
        self.conc_gc_threads = n;
    }

    pub const fn set_use_dynamic_worker_count(&mut self, enabled: bool) {
        self.use_dynamic_worker_count = enabled;
    }

    pub const fn set_marking_overhead_percent(&mut self, percent: u32) {
        self.marking_overhead_percent = if percent > 100 { 100 } else { percent };
    }

    /// Sets the MMU goal. The interval is kept above the pause.
    pub const fn set_pause_goal(&mut self, max_pause_ms: u64, interval_ms: u64) {
        self.max_gc_pause_ms = max_pause_ms;
        self.gc_pause_interval_ms = if interval_ms > max_pause_ms {
            interval_ms
        } else {
            max_pause_ms + 1
        };
    }

    /// Sets initial and maximum global stack capacity.
    pub const fn set_mark_stack_size(&mut self, size: usize, max: usize) {
        self.mark_stack_size = if size < 1 { 1 } else { size };
        self.mark_stack_size_max = if max < self.mark_stack_size {
            self.mark_stack_size
        } else {
            max
        };
    }

    /// Rounded up to a power of two, at least 2.
    pub const fn set_task_queue_capacity(&mut self, capacity: usize) {
        self.task_queue_capacity = if capacity < 2 {
            2
        } else {
            capacity.next_power_of_two()
        };
    }

    pub const fn set_mark_step_duration_ms(&mut self, ms: f64) {
        self.mark_step_duration_ms = ms;
    }

    pub const fn set_clock_periods(&mut self, words: usize, refs: usize) {
        self.words_scanned_period = if words < 4 { 4 } else { words };
        self.refs_reached_period = if refs < 4 { 4 } else { refs };
    }

    pub const fn set_satb(&mut self, buffer_size: usize, process_threshold: usize) {
        self.satb_buffer_size = if buffer_size < 1 { 1 } else { buffer_size };
        self.satb_process_threshold = process_threshold;
    }

    pub const fn set_ref_proc_drain_interval(&mut self, n: usize) {
        self.ref_proc_drain_interval = if n < 1 { 1 } else { n };
    }

    pub const fn set_work_stealing(&mut self, enabled: bool) {
        self.work_stealing = enabled;
    }

    pub const fn set_class_unloading(&mut self, enabled: bool) {
        self.class_unloading = enabled;
    }

    pub const fn set_scrub_rem_sets(&mut self, enabled: bool) {
        self.scrub_rem_sets = enabled;
    }

    pub const fn set_clear_all_soft_refs(&mut self, enabled: bool) {
        self.clear_all_soft_refs = enabled;
    }

    pub const fn set_clear_bitmap_chunk_words(&mut self, words: usize) {
        self.clear_bitmap_chunk_words = if words < 64 { 64 } else { words };
    }

    pub const fn set_mixed_gc_live_threshold_percent(&mut self, percent: u32) {
        self.mixed_gc_live_threshold_percent = if percent > 100 { 100 } else { percent };
    }

    pub const fn set_adaptive_mmu_delay(&mut self, enabled: bool) {
        self.adaptive_mmu_delay = enabled;
    }

    pub const fn set_mark_granule_shift(&mut self, shift: u32) {
        self.mark_granule_shift = shift;
    }

    /// Number of marking task slots.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.parallel_gc_threads.max(self.conc_gc_threads).max(1)
    }
}
