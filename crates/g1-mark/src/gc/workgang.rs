//! A gang of named worker threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Runs a task on a bounded number of worker threads and waits for them.
///
/// Threads are scoped to a single [`run_task`](Self::run_task) call, so the
/// task may borrow from the caller's stack.
#[derive(Debug)]
pub struct WorkGang {
    name: String,
    total_workers: usize,
    active_workers: AtomicUsize,
}

impl WorkGang {
    #[must_use]
    pub fn new(name: impl Into<String>, total_workers: usize) -> Self {
        let total_workers = total_workers.max(1);
        Self {
            name: name.into(),
            total_workers,
            active_workers: AtomicUsize::new(total_workers),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn total_workers(&self) -> usize {
        self.total_workers
    }

    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Sets the worker count of later runs, clamped to `[1, total]`.
    pub fn set_active_workers(&self, n: usize) -> usize {
        let n = n.clamp(1, self.total_workers);
        self.active_workers.store(n, Ordering::Release);
        n
    }

    /// Calls `task(worker_id)` for every active worker id, each on its own
    /// thread, and returns when all have finished.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be created or a worker panicked.
    pub fn run_task<F>(&self, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let n = self.active_workers();
        let task = &task;
        thread::scope(|scope| {
            for worker_id in 0..n {
                thread::Builder::new()
                    .name(format!("{}#{worker_id}", self.name))
                    .spawn_scoped(scope, move || task(worker_id))
                    .unwrap_or_else(|err| {
                        panic!("cannot create worker thread for {}: {err}", self.name)
                    });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_run_task_visits_each_worker_once() {
        let gang = WorkGang::new("test-gang", 4);
        assert_eq!(gang.set_active_workers(9), 4);
        gang.set_active_workers(3);

        let seen = Mutex::new(Vec::new());
        gang.run_task(|id| {
            let name = thread::current().name().map(str::to_owned);
            seen.lock().push((id, name));
        });

        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen.len(), 3);
        for (i, (id, name)) in seen.iter().enumerate() {
            assert_eq!(*id, i);
            assert_eq!(name.as_deref(), Some(format!("test-gang#{i}").as_str()));
        }
    }
}
