//! Prediction and pacing.
//!
//! [`TruncatedSeq`] keeps decaying statistics over recent samples and feeds
//! the step-time correction of marking tasks and the remark and cleanup pause
//! predictions. [`MmuTracker`] answers how long to wait before a pause so the
//! pause time goal holds. [`ConcurrentWorkerPolicy`] sizes the concurrent
//! worker set; it is a pure function of its inputs so it can be tested on
//! its own.

use std::collections::VecDeque;

use crate::gc::config::MarkConfig;

const DEFAULT_ALPHA: f64 = 0.7;
const DEFAULT_LENGTH: usize = 10;
/// Spread used by [`TruncatedSeq::predict`], in standard deviations.
const SIGMA: f64 = 0.5;

/// A sequence of samples with a decaying average and deviation, plus plain
/// statistics over the last few samples.
#[derive(Debug, Clone)]
pub struct TruncatedSeq {
    num: usize,
    davg: f64,
    dvariance: f64,
    alpha: f64,
    window: VecDeque<f64>,
    length: usize,
}

impl Default for TruncatedSeq {
    fn default() -> Self {
        Self::new(DEFAULT_LENGTH)
    }
}

impl TruncatedSeq {
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self::with_alpha(length, DEFAULT_ALPHA)
    }

    #[must_use]
    pub fn with_alpha(length: usize, alpha: f64) -> Self {
        let length = length.max(1);
        Self {
            num: 0,
            davg: 0.0,
            dvariance: 0.0,
            alpha,
            window: VecDeque::with_capacity(length),
            length,
        }
    }

    pub fn add(&mut self, val: f64) {
        if self.num == 0 {
            self.davg = val;
            self.dvariance = 0.0;
        } else {
            self.davg = (1.0 - self.alpha).mul_add(val, self.alpha * self.davg);
            let diff = val - self.davg;
            self.dvariance = (1.0 - self.alpha).mul_add(diff * diff, self.alpha * self.dvariance);
        }
        self.num += 1;
        if self.window.len() == self.length {
            self.window.pop_front();
        }
        self.window.push_back(val);
    }

    /// Total samples ever added.
    #[must_use]
    pub const fn num(&self) -> usize {
        self.num
    }

    #[must_use]
    pub const fn davg(&self) -> f64 {
        self.davg
    }

    #[must_use]
    pub fn dsd(&self) -> f64 {
        self.dvariance.max(0.0).sqrt()
    }

    /// Sum over the window.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.window.iter().sum()
    }

    /// Average over the window, 0 when empty.
    #[must_use]
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum() / self.window.len() as f64
        }
    }

    #[must_use]
    pub fn maximum(&self) -> f64 {
        self.window.iter().copied().fold(0.0, f64::max)
    }

    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.window.back().copied()
    }

    /// A conservative next-value prediction.
    ///
    /// With few samples the decaying average is inflated, so early
    /// predictions err on the high side.
    #[must_use]
    pub fn predict(&self) -> f64 {
        let confidence = if self.num > 4 {
            1.0
        } else {
            SIGMA.mul_add((5 - self.num) as f64 / 2.0, 1.0)
        };
        SIGMA
            .mul_add(self.dsd(), self.davg)
            .max(self.davg * confidence)
    }
}

const MMU_QUEUE_LENGTH: usize = 64;

/// Sliding-window record of pauses for a minimum mutator utilisation goal:
/// at most `max_gc_time` seconds of pause in any `time_slice` seconds.
///
/// Times are seconds on any monotonic clock used consistently by the caller.
#[derive(Debug, Clone)]
pub struct MmuTracker {
    time_slice: f64,
    max_gc_time: f64,
    pauses: VecDeque<(f64, f64)>,
}

impl MmuTracker {
    #[must_use]
    pub fn new(time_slice: f64, max_gc_time: f64) -> Self {
        Self {
            time_slice,
            max_gc_time,
            pauses: VecDeque::with_capacity(MMU_QUEUE_LENGTH),
        }
    }

    #[must_use]
    pub fn from_config(config: &MarkConfig) -> Self {
        Self::new(
            config.gc_pause_interval_ms as f64 / 1000.0,
            config.max_gc_pause_ms as f64 / 1000.0,
        )
    }

    #[must_use]
    pub const fn time_slice(&self) -> f64 {
        self.time_slice
    }

    #[must_use]
    pub const fn max_gc_time(&self) -> f64 {
        self.max_gc_time
    }

    /// Records a pause from `start` to `end`.
    pub fn add_pause(&mut self, start: f64, end: f64) {
        self.remove_expired_entries(end);
        if self.pauses.len() == MMU_QUEUE_LENGTH {
            // Full: overwrite the oldest entry.
            self.pauses.pop_front();
        }
        self.pauses.push_back((start, end));
    }

    fn remove_expired_entries(&mut self, now: f64) {
        let limit = now - self.time_slice;
        while let Some(&(_, end)) = self.pauses.front() {
            if limit >= end {
                self.pauses.pop_front();
            } else {
                break;
            }
        }
    }

    /// Pause time recorded in the window ending at `now`.
    #[must_use]
    pub fn calculate_gc_time(&self, now: f64) -> f64 {
        let limit = now - self.time_slice;
        self.pauses
            .iter()
            .filter(|(_, end)| *end > limit)
            .map(|&(start, end)| if start > limit { end - start } else { end - limit })
            .sum()
    }

    /// Seconds from `now` until a pause of `pause_time` seconds fits the goal.
    #[must_use]
    pub fn when_sec(&self, now: f64, pause_time: f64) -> f64 {
        let adjusted = pause_time.min(self.max_gc_time);
        let earliest_end = now + adjusted;
        let limit = earliest_end - self.time_slice;
        let mut diff = self.calculate_gc_time(earliest_end) + adjusted - self.max_gc_time;
        if diff <= 0.0 {
            return 0.0;
        }
        for &(start, end) in &self.pauses {
            if end > limit {
                diff -= if start > limit { end - start } else { end - limit };
                if diff <= 0.0 {
                    return (end + diff + self.time_slice - adjusted - now).max(0.0);
                }
            }
        }
        // Unreachable for a consistent history; wait a whole slice.
        self.time_slice
    }

    /// [`when_sec`](Self::when_sec) in whole milliseconds.
    #[must_use]
    pub fn when_ms(&self, now: f64, pause_time_ms: f64) -> u64 {
        let secs = self.when_sec(now, pause_time_ms / 1000.0);
        (secs * 1000.0) as u64
    }
}

/// Worker count bands used when scaling the STW worker count down for
/// concurrent work.
#[must_use]
pub const fn scale_parallel_threads(n: usize) -> usize {
    let scaled = (n + 2) / 4;
    if scaled < 1 {
        1
    } else {
        scaled
    }
}

/// GC workers allowed per application thread by the adaptive count.
const WORKERS_PER_MUTATOR: usize = 2;

/// Adaptive active worker count.
///
/// Grows instantly towards `WORKERS_PER_MUTATOR * app_threads` (clamped to
/// `[min, total]`) and shrinks by halving the distance from `prev_active`.
#[must_use]
pub fn calc_default_active_workers(
    total: usize,
    min: usize,
    prev_active: usize,
    app_threads: usize,
) -> usize {
    let min = min.clamp(1, total.max(1));
    let by_mutators = (WORKERS_PER_MUTATOR * app_threads).max(min);
    let mut active = by_mutators.min(total);
    if active < prev_active {
        active = min.max((prev_active + active) / 2);
    }
    active.clamp(min, total.max(min))
}

/// Sizing of the concurrent worker set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrentWorkerPolicy {
    max_threads: usize,
    dynamic: bool,
    sleep_factor: f64,
    task_overhead: f64,
}

impl ConcurrentWorkerPolicy {
    /// Derives the policy from `config` on a machine with `cpus` processors.
    ///
    /// A fixed `conc_gc_threads` wins; otherwise a marking overhead target
    /// derives both the thread count and a sleep factor; otherwise the STW
    /// worker count is scaled down.
    #[must_use]
    pub fn from_config(config: &MarkConfig, cpus: usize) -> Self {
        let slots = config.max_workers();
        let fixed = config.conc_gc_threads > 0;
        if fixed {
            return Self {
                max_threads: config.conc_gc_threads.min(slots),
                dynamic: false,
                sleep_factor: 0.0,
                task_overhead: 1.0,
            };
        }
        if config.marking_overhead_percent > 0 {
            let (threads, task_overhead, sleep_factor) = overhead_threads(
                config.max_gc_pause_ms,
                config.gc_pause_interval_ms,
                config.marking_overhead_percent,
                cpus,
            );
            return Self {
                max_threads: threads.clamp(1, slots),
                dynamic: config.use_dynamic_worker_count,
                sleep_factor,
                task_overhead,
            };
        }
        Self {
            max_threads: scale_parallel_threads(config.parallel_gc_threads).min(slots),
            dynamic: config.use_dynamic_worker_count,
            sleep_factor: 0.0,
            task_overhead: 1.0,
        }
    }

    #[must_use]
    pub const fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Multiple of a step's elapsed time a task sleeps after a timed-out step.
    #[must_use]
    pub const fn sleep_factor(&self) -> f64 {
        self.sleep_factor
    }

    #[must_use]
    pub const fn task_overhead(&self) -> f64 {
        self.task_overhead
    }

    /// Active workers for the next concurrent phase.
    #[must_use]
    pub fn active_workers(&self, prev_active: usize, app_threads: usize) -> usize {
        if self.dynamic {
            calc_default_active_workers(self.max_threads, 1, prev_active, app_threads)
        } else {
            self.max_threads
        }
    }
}

/// Thread count, per-task overhead and sleep factor meeting an overhead goal.
///
/// Returns `(threads, task_overhead, sleep_factor)`.
#[must_use]
pub fn overhead_threads(
    max_pause_ms: u64,
    interval_ms: u64,
    overhead_percent: u32,
    cpus: usize,
) -> (usize, f64, f64) {
    let cpus = cpus.max(1) as f64;
    let marking_overhead = f64::from(overhead_percent) / 100.0;
    let overall = max_pause_ms as f64 * marking_overhead / interval_ms.max(1) as f64;
    let cpu_ratio = 1.0 / cpus;
    let threads = (overall / cpu_ratio).ceil().max(1.0);
    let task_overhead = (overall / threads * cpus).min(1.0);
    let sleep_factor = if task_overhead > 0.0 {
        (1.0 - task_overhead) / task_overhead
    } else {
        0.0
    };
    (threads as usize, task_overhead, sleep_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_seq_first_sample() {
        let mut seq = TruncatedSeq::default();
        seq.add(4.0);
        assert!((seq.davg() - 4.0).abs() < f64::EPSILON);
        assert!(seq.dsd().abs() < f64::EPSILON);
        // One sample: confidence factor 1 + 0.5 * 4 / 2 = 2.
        assert!((seq.predict() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_truncated_seq_window() {
        let mut seq = TruncatedSeq::new(3);
        for v in [1.0, 2.0, 3.0, 10.0] {
            seq.add(v);
        }
        assert_eq!(seq.num(), 4);
        assert!((seq.sum() - 15.0).abs() < 1e-9);
        assert!((seq.maximum() - 10.0).abs() < 1e-9);
        assert_eq!(seq.last(), Some(10.0));
    }

    #[test]
    fn test_mmu_no_history_no_wait() {
        let mmu = MmuTracker::new(0.201, 0.2);
        assert_eq!(mmu.when_ms(10.0, 50.0), 0);
    }

    #[test]
    fn test_mmu_waits_after_recent_pause() {
        // 100ms budget per second; 80ms just used.
        let mut mmu = MmuTracker::new(1.0, 0.1);
        mmu.add_pause(9.92, 10.0);
        let wait = mmu.when_sec(10.0, 0.05);
        assert!(wait > 0.0);
        // After waiting, the new pause fits.
        let now = 10.0 + wait;
        assert!(mmu.calculate_gc_time(now + 0.05) + 0.05 <= 0.1 + 1e-9);
    }

    #[test]
    fn test_mmu_expires_old_pauses() {
        let mut mmu = MmuTracker::new(1.0, 0.1);
        mmu.add_pause(0.0, 0.09);
        mmu.add_pause(5.0, 5.01);
        assert!((mmu.calculate_gc_time(5.01) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_scale_parallel_threads() {
        assert_eq!(scale_parallel_threads(1), 1);
        assert_eq!(scale_parallel_threads(4), 1);
        assert_eq!(scale_parallel_threads(8), 2);
        assert_eq!(scale_parallel_threads(16), 4);
    }

    #[test]
    fn test_dynamic_workers_grow_fast_shrink_slow() {
        assert_eq!(calc_default_active_workers(8, 1, 1, 3), 6);
        assert_eq!(calc_default_active_workers(8, 1, 1, 10), 8);
        // Shrinking from 8 towards 2 goes halfway.
        assert_eq!(calc_default_active_workers(8, 1, 8, 1), 5);
    }

    #[test]
    fn test_overhead_threads() {
        let (threads, overhead, sleep) = overhead_threads(200, 201, 50, 4);
        // overall = 200 * 0.5 / 201 ~ 0.4975, ceil(0.4975 * 4) = 2
        assert_eq!(threads, 2);
        assert!((overhead - 0.4975 * 2.0).abs() < 1e-3);
        assert!(sleep > 0.0 && sleep < 0.1);
    }

    #[test]
    fn test_policy_from_config() {
        let mut cfg = MarkConfig::new(8);
        cfg.set_conc_gc_threads(3);
        let p = ConcurrentWorkerPolicy::from_config(&cfg, 8);
        assert_eq!(p.max_threads(), 3);
        assert_eq!(p.active_workers(1, 100), 3);

        cfg.set_conc_gc_threads(0);
        cfg.set_use_dynamic_worker_count(true);
        let p = ConcurrentWorkerPolicy::from_config(&cfg, 8);
        assert_eq!(p.max_threads(), 2);
        assert_eq!(p.active_workers(2, 0), 1);
        assert!(p.sleep_factor().abs() < f64::EPSILON);
    }
}
