//! Cooperative suspension and rendezvous primitives.
//!
//! # Lock Ordering
//!
//! | Level | Lock                  | Holder                                        |
//! |-------|-----------------------|-----------------------------------------------|
//! | 1     | driver state          | [`MarkDriverThread`](crate::MarkDriverThread)  |
//! | 2     | `SuspendibleThreadSet` | joiners, leavers, the safepoint collaborator  |
//! | 2     | task slot             | its claimant for one step; others `try_lock`   |
//! | 3     | root region registry  | root region scan waiters                       |
//! | 3     | rendezvous barrier    | tasks in the overflow protocol                 |
//! | 4     | mark stack            | every task, bulk push and pop only             |
//!
//! Locks are acquired in increasing level. A task slot is the one exception
//! to the rule below: its claimant keeps it while waiting in an overflow
//! barrier, and nobody else ever blocks on it. No other lock is
//! held across a call to
//! [`SuspendibleThreadSet::yield_now`], a barrier [`enter`](RendezvousBarrier::enter)
//! or a wait on the root region registry.
//!
//! A thread blocked in a barrier must not count as running for the
//! suspendible thread set; otherwise a pause requested while one task waits
//! for a peer that already yielded would never synchronise. Callers wrap
//! such waits in a [`SuspendibleThreadSetLeaver`].

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct StsState {
    nthreads: usize,
    nthreads_stopped: usize,
    suspend_all: bool,
}

/// The set of concurrent GC threads that can be stopped for a pause.
///
/// Concurrent threads [`join`](Self::join) the set, poll
/// [`should_yield`](Self::should_yield) at safe points and call
/// [`yield_now`](Self::yield_now) when asked. The pause initiator calls
/// [`synchronize`](Self::synchronize), which returns once every joined thread
/// is either stopped in `yield_now` or has left the set.
#[derive(Debug, Default)]
pub struct SuspendibleThreadSet {
    state: Mutex<StsState>,
    cond: Condvar,
    suspend_all: AtomicBool,
}

impl SuspendibleThreadSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the calling thread to the set, waiting out a pause in progress.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.suspend_all {
            self.cond.wait(&mut state);
        }
        state.nthreads += 1;
    }

    /// Removes the calling thread from the set.
    ///
    /// # Panics
    ///
    /// Panics if no thread is joined.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        assert!(state.nthreads > 0, "leave without join");
        state.nthreads -= 1;
        if state.suspend_all && state.nthreads == state.nthreads_stopped {
            self.cond.notify_all();
        }
    }

    /// True while a pause wants joined threads to stop.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.suspend_all.load(Ordering::Acquire)
    }

    /// Blocks the calling (joined) thread until the current pause ends.
    pub fn yield_now(&self) {
        if !self.should_yield() {
            return;
        }
        let mut state = self.state.lock();
        if !state.suspend_all {
            return;
        }
        state.nthreads_stopped += 1;
        if state.nthreads_stopped == state.nthreads {
            self.cond.notify_all();
        }
        while state.suspend_all {
            self.cond.wait(&mut state);
        }
        state.nthreads_stopped -= 1;
    }

    /// Stops every joined thread. Returns once all are stopped or gone.
    ///
    /// # Panics
    ///
    /// Panics if a pause is already in progress.
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        assert!(!state.suspend_all, "nested synchronize");
        state.suspend_all = true;
        self.suspend_all.store(true, Ordering::Release);
        while state.nthreads_stopped < state.nthreads {
            self.cond.wait(&mut state);
        }
    }

    /// Ends the pause started by [`synchronize`](Self::synchronize).
    pub fn desynchronize(&self) {
        let mut state = self.state.lock();
        state.suspend_all = false;
        self.suspend_all.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    /// Joins for the lifetime of the returned guard.
    #[must_use]
    pub fn joiner(&self) -> SuspendibleThreadSetJoiner<'_> {
        self.join();
        SuspendibleThreadSetJoiner { sts: self }
    }

    /// Leaves for the lifetime of the returned guard if `active`.
    ///
    /// The caller must currently be joined when `active` is true.
    #[must_use]
    pub fn leaver(&self, active: bool) -> SuspendibleThreadSetLeaver<'_> {
        if active {
            self.leave();
        }
        SuspendibleThreadSetLeaver { sts: self, active }
    }

    /// Number of joined threads.
    #[must_use]
    pub fn joined(&self) -> usize {
        self.state.lock().nthreads
    }
}

/// RAII membership in a [`SuspendibleThreadSet`].
#[derive(Debug)]
pub struct SuspendibleThreadSetJoiner<'a> {
    sts: &'a SuspendibleThreadSet,
}

impl SuspendibleThreadSetJoiner<'_> {
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.sts.should_yield()
    }

    pub fn yield_now(&self) {
        self.sts.yield_now();
    }
}

impl Drop for SuspendibleThreadSetJoiner<'_> {
    fn drop(&mut self) {
        self.sts.leave();
    }
}

/// RAII temporary absence from a [`SuspendibleThreadSet`].
#[derive(Debug)]
pub struct SuspendibleThreadSetLeaver<'a> {
    sts: &'a SuspendibleThreadSet,
    active: bool,
}

impl Drop for SuspendibleThreadSetLeaver<'_> {
    fn drop(&mut self) {
        if self.active {
            self.sts.join();
        }
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    n_workers: usize,
    n_arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable N-party rendezvous.
///
/// The last of `n` callers to [`enter`](Self::enter) releases the others and
/// resets the count, so the barrier can be entered again straight away.
/// [`abort`](Self::abort) releases everyone and makes every later `enter`
/// return immediately until [`set_n_workers`](Self::set_n_workers) re-arms it.
#[derive(Debug, Default)]
pub struct RendezvousBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl RendezvousBarrier {
    #[must_use]
    pub fn new(n_workers: usize) -> Self {
        let barrier = Self::default();
        barrier.set_n_workers(n_workers);
        barrier
    }

    /// Re-arms the barrier for `n` parties and clears the aborted state.
    pub fn set_n_workers(&self, n: usize) {
        let mut state = self.state.lock();
        state.n_workers = n;
        state.n_arrived = 0;
        state.aborted = false;
    }

    /// Waits until all parties arrived.
    ///
    /// Returns `false` if the barrier was aborted.
    pub fn enter(&self) -> bool {
        self.enter_with(|| {})
    }

    /// [`enter`](Self::enter), where the last party to arrive runs
    /// `on_release` before anyone leaves.
    ///
    /// `on_release` runs under the barrier lock and must not block.
    pub fn enter_with(&self, on_release: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.n_arrived += 1;
        if state.n_arrived >= state.n_workers {
            on_release();
            state.n_arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cond.wait(&mut state);
        }
        !state.aborted
    }

    /// Releases all waiters; they see `enter` return `false`.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    #[must_use]
    pub fn n_workers(&self) -> usize {
        self.state.lock().n_workers
    }
}
