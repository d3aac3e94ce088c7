//! Concurrent marking for a region-based, G1-style garbage collector.
//!
//! `g1-mark` computes the set of live objects in the old generation while the
//! application keeps running. It implements snapshot-at-the-beginning (SATB)
//! marking over two mark bitmaps, with per-region top-at-mark-start (TAMS)
//! sampling, a global finger for claiming regions, bounded per-task queues
//! with work stealing, a global overflow stack with a two-barrier restart
//! protocol, and a remark pause that finishes marking and processes weak
//! references.
//!
//! # Architecture
//!
//! - [`MarkCoordinator`]: global marking state and the phases of a cycle
//! - [`MarkTask`]: one worker's time-sliced marking step
//! - [`MarkDriverThread`]: the dedicated thread that sequences cycles
//! - [`HeapAccess`]: everything marking needs from the heap and object model
//! - [`SafepointSynchronizer`]: how pauses stop the world
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use g1_mark::{HeapAccess, MarkConfig, MarkCoordinator, RegionKind, SimHeap};
//!
//! let heap = Arc::new(SimHeap::new(8, 1024));
//! let region = heap.new_region(RegionKind::Old).unwrap();
//! let live = heap.allocate(region, 1, 4).unwrap();
//! let dead = heap.allocate(region, 0, 4).unwrap();
//! heap.add_root(live);
//!
//! let cm = MarkCoordinator::new(MarkConfig::new(2), heap.clone()).unwrap();
//! cm.concurrent_start();
//! cm.scan_root_regions();
//! cm.mark_from_roots();
//! cm.remark();
//! cm.cleanup();
//! cm.note_cycle_end();
//!
//! assert!(cm.prev_bitmap().is_marked(live));
//! assert!(!cm.prev_bitmap().is_marked(dead));
//! ```
//!
//! Outside of a test the phases are driven by a [`MarkDriverThread`], which
//! runs the pauses through a [`SafepointSynchronizer`].

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod gc;
pub mod heap;
pub mod mark;
pub mod metrics;
pub mod policy;
pub mod safepoint;
pub mod sim_heap;
pub mod tracing;

pub use addr::{HeapAddr, MemRegion};
pub use gc::{
    MarkConfig, MarkCoordinator, MarkDriverThread, MarkTask, ReferenceKind, ReferenceProcessor,
    ReferenceStats, RootRegionRegistry, SatbQueue, SatbQueueSet, SimpleReferenceProcessor,
    SuspendibleThreadSet,
};
pub use heap::{HeapAccess, MarkingHooks, NoHooks, RegionKind};
pub use mark::{MarkBitmap, MarkStack};
pub use metrics::{MarkMetrics, MarkStats};
pub use policy::{ConcurrentWorkerPolicy, MmuTracker, TruncatedSeq};
pub use safepoint::{PauseKind, SafepointSynchronizer, StsSafepoint};
pub use sim_heap::SimHeap;
pub use crate::tracing::CycleId;
