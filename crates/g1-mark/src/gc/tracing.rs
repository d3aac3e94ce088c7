//! Marking events.
//!
//! Every helper has a no-op twin when the `tracing` feature is off, so call
//! sites stay unconditional.

use std::time::Duration;

use crate::gc::refproc::ReferenceStats;
use crate::tracing::CycleId;

#[cfg(feature = "tracing")]
pub type SpanGuard = tracing::span::EnteredSpan;
#[cfg(not(feature = "tracing"))]
pub type SpanGuard = ();

/// Enter the span covering one concurrent cycle.
#[cfg(feature = "tracing")]
pub fn span_cycle(kind: &str, id: CycleId) -> SpanGuard {
    tracing::debug_span!("concurrent_cycle", kind = kind, cycle_id = id.0).entered()
}

#[cfg(not(feature = "tracing"))]
pub fn span_cycle(_kind: &str, _id: CycleId) -> SpanGuard {}

#[cfg(feature = "tracing")]
pub fn log_phase_start(phase: &str) {
    tracing::debug!(phase = phase, "phase_start");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_phase_start(_phase: &str) {}

#[cfg(feature = "tracing")]
pub fn log_phase_end(phase: &str, elapsed: Duration) {
    tracing::debug!(
        phase = phase,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "phase_end"
    );
}

#[cfg(not(feature = "tracing"))]
pub const fn log_phase_end(_phase: &str, _elapsed: Duration) {}

/// Active concurrent workers chosen for a phase.
#[cfg(feature = "tracing")]
pub fn log_active_workers(phase: &str, active: usize, max: usize) {
    tracing::debug!(phase = phase, active = active, max = max, "active_workers");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_active_workers(_phase: &str, _active: usize, _max: usize) {}

#[cfg(feature = "tracing")]
pub fn log_reset_for_overflow(task_id: usize) {
    tracing::debug!(task_id = task_id, "concurrent-mark-reset-for-overflow");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_reset_for_overflow(_task_id: usize) {}

#[cfg(feature = "tracing")]
pub fn log_remark_restart(iteration: usize) {
    tracing::info!(iteration = iteration, "remark-restart-for-overflow");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_remark_restart(_iteration: usize) {}

#[cfg(feature = "tracing")]
pub fn log_abort() {
    tracing::info!("concurrent-mark-abort");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_abort() {}

#[cfg(feature = "tracing")]
pub fn log_stack_expanded(from: usize, to: usize) {
    tracing::debug!(from = from, to = to, "mark_stack_expanded");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_stack_expanded(_from: usize, _to: usize) {}

#[cfg(feature = "tracing")]
pub fn log_stack_expand_failed(from: usize, to: usize, err: &std::io::Error) {
    tracing::warn!(from = from, to = to, error = %err, "mark_stack_expand_failed");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_stack_expand_failed(_from: usize, _to: usize, _err: &std::io::Error) {}

#[cfg(feature = "tracing")]
pub fn log_stack_at_max(capacity: usize) {
    tracing::debug!(capacity = capacity, "mark_stack_at_max_capacity");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_stack_at_max(_capacity: usize) {}

/// A marking step ran past its time target.
#[cfg(feature = "tracing")]
pub fn log_step_timed_out(task_id: usize, target_ms: f64, elapsed_ms: f64) {
    tracing::debug!(
        task_id = task_id,
        target_ms = target_ms,
        elapsed_ms = elapsed_ms,
        "mark_step_timed_out"
    );
}

#[cfg(not(feature = "tracing"))]
pub const fn log_step_timed_out(_task_id: usize, _target_ms: f64, _elapsed_ms: f64) {}

#[cfg(feature = "tracing")]
pub fn log_cleanup(regions_reclaimed: usize, live_words: usize) {
    tracing::debug!(
        regions_reclaimed = regions_reclaimed,
        live_words = live_words,
        "cleanup"
    );
}

#[cfg(not(feature = "tracing"))]
pub const fn log_cleanup(_regions_reclaimed: usize, _live_words: usize) {}

#[cfg(feature = "tracing")]
pub fn log_rebuild_selected(candidates: usize) {
    tracing::debug!(candidates = candidates, "rebuild_selected");
}

#[cfg(not(feature = "tracing"))]
pub const fn log_rebuild_selected(_candidates: usize) {}

#[cfg(feature = "tracing")]
pub fn log_reference_processing(stats: &ReferenceStats) {
    tracing::debug!(
        discovered = stats.discovered,
        cleared = stats.cleared,
        kept_alive = stats.kept_alive,
        enqueued = stats.enqueued,
        interrupted = stats.interrupted,
        "reference_processing"
    );
}

#[cfg(not(feature = "tracing"))]
pub const fn log_reference_processing(_stats: &ReferenceStats) {}
