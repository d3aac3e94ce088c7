//! Distributed termination for parallel marking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

use crate::gc::worklist::TaskQueueSet;

/// Detects the point at which every active task is idle at the same time.
///
/// A task with no local work calls [`offer_termination`](Self::offer_termination).
/// The call returns `true` once all `n` tasks have offered, or `false` as
/// soon as work shows up in some queue or the caller's exit predicate fires,
/// in which case the offer is withdrawn.
#[derive(Debug)]
pub struct TaskTerminator {
    n_threads: AtomicUsize,
    offered: AtomicUsize,
}

const SLEEP: Duration = Duration::from_millis(1);

impl TaskTerminator {
    #[must_use]
    pub const fn new(n_threads: usize) -> Self {
        Self {
            n_threads: AtomicUsize::new(n_threads),
            offered: AtomicUsize::new(0),
        }
    }

    /// Prepares for another termination round with `n_threads` parties.
    ///
    /// Must not be called while any task is inside `offer_termination`.
    pub fn reset_for_reuse(&self, n_threads: usize) {
        self.n_threads.store(n_threads, Ordering::Release);
        self.offered.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads.load(Ordering::Acquire)
    }

    /// Offers termination on behalf of the calling task.
    ///
    /// `should_exit` is polled while waiting; returning `true` withdraws the
    /// offer. Work is also detected by peeking the first `n_threads` queues.
    pub fn offer_termination<F>(&self, queues: &TaskQueueSet, mut should_exit: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let n = self.n_threads();
        self.offered.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.offered.load(Ordering::Acquire) >= n {
                return true;
            }
            if backoff.is_completed() {
                thread::sleep(SLEEP);
            } else {
                backoff.snooze();
            }
            if self.offered.load(Ordering::Acquire) >= n {
                return true;
            }
            if queues.peek(n) || should_exit() {
                self.offered.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::HeapAddr;
    use std::sync::Arc;

    #[test]
    fn test_single_party_terminates_immediately() {
        let queues = TaskQueueSet::new(1, 4);
        let t = TaskTerminator::new(1);
        assert!(t.offer_termination(&queues, || false));
    }

    #[test]
    fn test_all_parties_terminate() {
        let queues = Arc::new(TaskQueueSet::new(4, 4));
        let t = Arc::new(TaskTerminator::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queues = Arc::clone(&queues);
                let t = Arc::clone(&t);
                std::thread::spawn(move || t.offer_termination(&queues, || false))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn test_visible_work_withdraws_offer() {
        let queues = TaskQueueSet::new(2, 4);
        queues.queue(1).push(HeapAddr::new(8));
        let t = TaskTerminator::new(2);
        assert!(!t.offer_termination(&queues, || false));

        queues.set_empty();
        let mut polls = 0;
        assert!(!t.offer_termination(&queues, || {
            polls += 1;
            polls > 3
        }));
    }
}
