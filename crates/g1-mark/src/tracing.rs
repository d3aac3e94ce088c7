//! Marking cycle identifiers.
//!
//! When the `tracing` feature is enabled every concurrent cycle gets a
//! [`CycleId`] so all events of one cycle can be correlated.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Stable identifier for one concurrent marking cycle.
    ///
    /// Monotonically increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CycleId(pub u64);

    static NEXT_CYCLE_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique cycle ID.
    pub fn next_cycle_id() -> CycleId {
        CycleId(NEXT_CYCLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CycleId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_cycle_id() -> CycleId {
        CycleId(0)
    }
}

pub use internal::CycleId;
