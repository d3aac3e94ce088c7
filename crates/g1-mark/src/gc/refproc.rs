//! Reference processing at remark.
//!
//! The marking engine drives a [`ReferenceProcessor`] with three callbacks:
//! an is-alive predicate backed by the next mark bitmap, a keep-alive
//! callback that marks a referent and traces from it, and a drain callback
//! that completes all tracing work queued so far.
//!
//! Both tracing callbacks report whether marking can still complete. Once
//! the global mark stack overflows the bitmap is incomplete, so a processor
//! must stop deciding liveness and leave the remaining references to the
//! remark that follows the restart.

use parking_lot::Mutex;

use crate::addr::HeapAddr;

/// Strength of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Cleared only when the soft reference policy says so.
    Soft,
    Weak,
    /// Referent is kept alive and the reference queued for finalization.
    Final,
    Phantom,
}

const PHASES: [ReferenceKind; 4] = [
    ReferenceKind::Soft,
    ReferenceKind::Weak,
    ReferenceKind::Final,
    ReferenceKind::Phantom,
];

/// Outcome of one reference processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub discovered: usize,
    pub cleared: usize,
    pub kept_alive: usize,
    pub enqueued: usize,
    /// Processing stopped early because marking overflowed.
    pub interrupted: bool,
}

/// The reference processing subsystem, as consumed by marking.
pub trait ReferenceProcessor: Send + Sync {
    /// Starts discovery for a new cycle.
    fn enable_discovery(&self);

    /// Processes the references discovered this cycle.
    ///
    /// `keep_alive` and `drain` return `false` when marking overflowed. The
    /// processor must then return at once with `interrupted` set, keeping
    /// only the decisions made before the overflow, and stay ready to
    /// process the rest when called again.
    fn process_discovered_references(
        &self,
        is_alive: &dyn Fn(HeapAddr) -> bool,
        keep_alive: &mut dyn FnMut(HeapAddr) -> bool,
        drain: &mut dyn FnMut() -> bool,
        clear_all_soft_refs: bool,
    ) -> ReferenceStats;

    /// Drops whatever was discovered; the cycle was aborted.
    fn abandon_partial_discovery(&self);
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    reference: HeapAddr,
    referent: Option<HeapAddr>,
    kind: ReferenceKind,
    enqueued: bool,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    discovering: bool,
}

/// An in-memory reference processor.
///
/// References are registered explicitly with their referent; the referent
/// is not a field the heap reports to marking, so it is reached only through
/// processing. Supports the four strengths in the usual order, draining
/// after each.
#[derive(Debug, Default)]
pub struct SimpleReferenceProcessor {
    state: Mutex<State>,
}

impl SimpleReferenceProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the reference object `reference` pointing at `referent`.
    pub fn register(&self, reference: HeapAddr, referent: HeapAddr, kind: ReferenceKind) {
        self.state.lock().entries.push(Entry {
            reference,
            referent: Some(referent),
            kind,
            enqueued: false,
        });
    }

    /// The current referent of `reference`; `None` once cleared.
    #[must_use]
    pub fn referent(&self, reference: HeapAddr) -> Option<HeapAddr> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.reference == reference)
            .and_then(|e| e.referent)
    }

    /// Whether `reference` was handed to its queue.
    #[must_use]
    pub fn is_enqueued(&self, reference: HeapAddr) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|e| e.reference == reference && e.enqueued)
    }

    #[must_use]
    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovering
    }
}

impl ReferenceProcessor for SimpleReferenceProcessor {
    fn enable_discovery(&self) {
        self.state.lock().discovering = true;
    }

    fn process_discovered_references(
        &self,
        is_alive: &dyn Fn(HeapAddr) -> bool,
        keep_alive: &mut dyn FnMut(HeapAddr) -> bool,
        drain: &mut dyn FnMut() -> bool,
        clear_all_soft_refs: bool,
    ) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        // The callbacks trace the heap; do not hold our lock across them.
        let mut pending: Vec<Entry> = {
            let state = self.state.lock();
            if !state.discovering {
                return stats;
            }
            state.entries.clone()
        };

        'phases: for kind in PHASES {
            for entry in pending.iter_mut().filter(|e| e.kind == kind && !e.enqueued) {
                let Some(referent) = entry.referent else {
                    continue;
                };
                // Unreachable reference objects were never discovered.
                if !is_alive(entry.reference) {
                    continue;
                }
                stats.discovered += 1;
                if is_alive(referent) {
                    continue;
                }
                let traced = match kind {
                    ReferenceKind::Soft if !clear_all_soft_refs => {
                        stats.kept_alive += 1;
                        keep_alive(referent)
                    }
                    ReferenceKind::Final => {
                        entry.enqueued = true;
                        stats.kept_alive += 1;
                        stats.enqueued += 1;
                        keep_alive(referent)
                    }
                    _ => {
                        entry.referent = None;
                        entry.enqueued = true;
                        stats.cleared += 1;
                        stats.enqueued += 1;
                        true
                    }
                };
                if !traced {
                    stats.interrupted = true;
                    break 'phases;
                }
            }
            if !drain() {
                stats.interrupted = true;
                break;
            }
        }

        let mut state = self.state.lock();
        for updated in pending {
            if let Some(e) = state
                .entries
                .iter_mut()
                .find(|e| e.reference == updated.reference)
            {
                e.referent = updated.referent;
                e.enqueued = updated.enqueued;
            }
        }
        if !stats.interrupted {
            state.discovering = false;
        }
        stats
    }

    fn abandon_partial_discovery(&self) {
        self.state.lock().discovering = false;
    }
}
