//! Concurrent marking: coordination, tasks and the driver thread.
//!
//! This module provides:
//! - The coordinator holding global marking state and running the phases
//! - Per-worker marking tasks with work stealing and overflow recovery
//! - The driver thread that sequences a cycle
//! - Synchronisation primitives and their lock ordering

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod refproc;
pub mod root_regions;
pub mod satb;
pub mod sync;
pub mod task;
pub mod terminator;
pub(crate) mod tracing;
pub mod workgang;
pub mod worklist;

pub use config::MarkConfig;
pub use coordinator::MarkCoordinator;
pub use driver::MarkDriverThread;
pub use refproc::{ReferenceKind, ReferenceProcessor, ReferenceStats, SimpleReferenceProcessor};
pub use root_regions::RootRegionRegistry;
pub use satb::{SatbQueue, SatbQueueSet};
pub use sync::{RendezvousBarrier, SuspendibleThreadSet};
pub use task::MarkTask;
pub use terminator::TaskTerminator;
pub use workgang::WorkGang;
pub use worklist::{TaskQueue, TaskQueueSet};
