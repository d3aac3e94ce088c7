//! The concurrent mark driver thread.
//!
//! One dedicated thread waits for cycle requests and walks each cycle
//! through its phases: root region scan, the mark loop (repeated while
//! remark overflows), rebuild, cleanup and bitmap clearing. Pauses go
//! through the [`SafepointSynchronizer`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::gc::coordinator::MarkCoordinator;
use crate::gc::tracing;
use crate::safepoint::{PauseKind, SafepointSynchronizer};
use crate::tracing::internal::next_cycle_id;

/// What kind of cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleKind {
    Mark,
    Undo,
}

impl CycleKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Mark => "mark",
            Self::Undo => "undo",
        }
    }
}

#[derive(Debug, Default)]
struct DriverState {
    request: Option<CycleKind>,
    in_progress: bool,
    should_terminate: bool,
    cycles_finished: u64,
}

struct Shared {
    cm: Arc<MarkCoordinator>,
    safepoint: Arc<dyn SafepointSynchronizer>,
    state: Mutex<DriverState>,
    cond: Condvar,
}

/// Handle on the running driver thread.
pub struct MarkDriverThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MarkDriverThread {
    /// Spawns the driver thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be created.
    pub fn start(
        cm: Arc<MarkCoordinator>,
        safepoint: Arc<dyn SafepointSynchronizer>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            cm,
            safepoint,
            state: Mutex::new(DriverState::default()),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("g1-mark-driver".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<MarkCoordinator> {
        &self.shared.cm
    }

    /// Whether a cycle is requested or running.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        let state = self.shared.state.lock();
        state.in_progress
    }

    /// Cycles the driver has finished, aborted ones included.
    #[must_use]
    pub fn cycles_finished(&self) -> u64 {
        self.shared.state.lock().cycles_finished
    }

    /// Runs the concurrent start pause and hands the cycle to the driver.
    ///
    /// Returns `false`, doing nothing, if a cycle is already in progress or
    /// the driver is stopping.
    pub fn request_concurrent_cycle(&self) -> bool {
        self.request(CycleKind::Mark)
    }

    /// Starts a cycle that only undoes its concurrent start pause.
    ///
    /// Returns `false` if a cycle is already in progress.
    pub fn request_undo_cycle(&self) -> bool {
        self.request(CycleKind::Undo)
    }

    fn request(&self, kind: CycleKind) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.in_progress || state.should_terminate {
                return false;
            }
            state.in_progress = true;
        }
        let cm = &self.shared.cm;
        let mut start = || match kind {
            CycleKind::Mark => cm.concurrent_start(),
            CycleKind::Undo => cm.concurrent_undo_start(),
        };
        self.shared
            .safepoint
            .request_synchronizing_pause(PauseKind::ConcurrentStart, &mut start);

        let mut state = self.shared.state.lock();
        state.request = Some(kind);
        self.shared.cond.notify_all();
        true
    }

    /// Aborts the running cycle the way a full collection does.
    ///
    /// Waits for root region scanning to stop first, then aborts in a pause.
    pub fn abort_cycle(&self) {
        let cm = &self.shared.cm;
        cm.root_regions().abort();
        cm.root_regions().wait_until_scan_finished();
        self.shared
            .safepoint
            .request_synchronizing_pause(PauseKind::FullGc, &mut || cm.abort());
        self.shared.cond.notify_all();
    }

    /// Blocks until no cycle is in progress.
    pub fn wait_for_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.in_progress && !state.should_terminate {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Like [`wait_for_idle`](Self::wait_for_idle) with a timeout. Returns
    /// whether the driver became idle.
    pub fn wait_for_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.in_progress && !state.should_terminate {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return !state.in_progress;
            }
        }
        !state.in_progress
    }

    /// Stops the driver and joins it.
    ///
    /// A cycle in progress is cut short: root region scanning is aborted and
    /// waited for, then the marking tasks are told to stop.
    pub fn stop_service(&self) {
        let cm = &self.shared.cm;
        let in_progress = {
            let mut state = self.shared.state.lock();
            state.should_terminate = true;
            state.in_progress
        };
        if in_progress {
            cm.root_regions().abort();
            cm.root_regions().wait_until_scan_finished();
            cm.abort_marking_threads();
        }
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            assert!(handle.join().is_ok(), "concurrent mark driver thread panicked");
        }
    }
}

impl Drop for MarkDriverThread {
    fn drop(&mut self) {
        if self.handle.get_mut().is_some() {
            self.stop_service();
        }
    }
}

impl std::fmt::Debug for MarkDriverThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MarkDriverThread")
            .field("in_progress", &state.in_progress)
            .field("should_terminate", &state.should_terminate)
            .field("cycles_finished", &state.cycles_finished)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn run(&self) {
        while let Some(kind) = self.wait_for_next_cycle() {
            let _span = tracing::span_cycle(kind.name(), next_cycle_id());
            match kind {
                CycleKind::Mark => self.run_mark_cycle(),
                CycleKind::Undo => self.run_undo_cycle(),
            }
            self.cm.note_cycle_end();

            let mut state = self.state.lock();
            state.in_progress = false;
            state.cycles_finished += 1;
            self.cond.notify_all();
        }
    }

    fn wait_for_next_cycle(&self) -> Option<CycleKind> {
        let mut state = self.state.lock();
        loop {
            // A posted request already ran its start pause and must be
            // wound down even when stopping.
            if let Some(kind) = state.request.take() {
                return Some(kind);
            }
            if state.should_terminate {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    fn should_terminate(&self) -> bool {
        self.state.lock().should_terminate
    }

    fn run_mark_cycle(&self) {
        let cm = &*self.cm;

        if !cm.has_aborted() {
            cm.scan_root_regions();
        } else if cm.root_regions().scan_in_progress() {
            cm.root_regions().cancel_scan();
        }

        let mut iteration = 0;
        loop {
            iteration += 1;
            if !cm.has_aborted() {
                cm.mark_from_roots();
            }
            if !cm.has_aborted() {
                self.delay_to_keep_mmu(true);
                self.pause(PauseKind::Remark, &mut || cm.remark());
            }
            if cm.restart_for_overflow() && !cm.has_aborted() {
                tracing::log_remark_restart(iteration);
                cm.metrics().record_remark_restart();
            } else {
                break;
            }
        }

        if !cm.has_aborted() {
            cm.rebuild_remembered_sets();
        }
        if !cm.has_aborted() {
            self.delay_to_keep_mmu(false);
        }
        self.pause(PauseKind::Cleanup, &mut || cm.cleanup());
        cm.complete_cleanup();

        if !cm.has_aborted() {
            cm.clear_next_bitmap();
        }
    }

    fn run_undo_cycle(&self) {
        let cm = &*self.cm;
        if !cm.has_aborted() {
            cm.clear_next_bitmap();
        }
    }

    fn pause(&self, kind: PauseKind, op: &mut dyn FnMut()) {
        if self.should_terminate() {
            return;
        }
        self.safepoint.request_synchronizing_pause(kind, op);
    }

    /// Sleeps until the predicted pause fits the MMU goal, or until abort
    /// or shutdown.
    fn delay_to_keep_mmu(&self, remark: bool) {
        if !self.cm.config().adaptive_mmu_delay {
            return;
        }
        let delay = self.cm.mmu_delay(remark);
        if delay.is_zero() {
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        while !state.should_terminate && !self.cm.has_aborted() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }
}
