//! Stop-the-world pauses requested by marking.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gc::sync::SuspendibleThreadSet;

/// Why a pause is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseKind {
    /// Concurrent start (initial mark) work.
    ConcurrentStart,
    Remark,
    Cleanup,
    /// A full collection preempting marking.
    FullGc,
}

impl fmt::Display for PauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConcurrentStart => "Pause Concurrent Start",
            Self::Remark => "Pause Remark",
            Self::Cleanup => "Pause Cleanup",
            Self::FullGc => "Pause Full",
        })
    }
}

/// Runs an operation with every mutator and concurrent GC thread stopped.
pub trait SafepointSynchronizer: Send + Sync {
    /// Runs `op` inside a pause of kind `kind` and returns when it is done.
    ///
    /// The calling thread must not be a member of the suspendible thread set.
    fn request_synchronizing_pause(&self, kind: PauseKind, op: &mut dyn FnMut());
}

/// A [`SafepointSynchronizer`] that stops the threads of a
/// [`SuspendibleThreadSet`].
///
/// Pauses are serialised; a second request waits for the first to finish.
#[derive(Debug)]
pub struct StsSafepoint {
    sts: Arc<SuspendibleThreadSet>,
    pause_lock: Mutex<()>,
}

impl StsSafepoint {
    #[must_use]
    pub fn new(sts: Arc<SuspendibleThreadSet>) -> Self {
        Self {
            sts,
            pause_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn thread_set(&self) -> &Arc<SuspendibleThreadSet> {
        &self.sts
    }
}

impl SafepointSynchronizer for StsSafepoint {
    fn request_synchronizing_pause(&self, _kind: PauseKind, op: &mut dyn FnMut()) {
        let _serial = self.pause_lock.lock();
        self.sts.synchronize();
        op();
        self.sts.desynchronize();
    }
}
