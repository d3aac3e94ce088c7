//! Shared helpers for the marking integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use g1_mark::{HeapAccess, HeapAddr, MarkConfig, MarkCoordinator, RegionKind, SimHeap};

pub const REGION_WORDS: usize = 1024;

/// A config for deterministic tests: `workers` threads in both phases and no
/// MMU pacing.
pub fn test_config(workers: usize) -> MarkConfig {
    let mut config = MarkConfig::new(workers);
    config.set_adaptive_mmu_delay(false);
    config
}

pub fn coordinator(config: MarkConfig, heap: &Arc<SimHeap>) -> MarkCoordinator {
    let heap: Arc<dyn HeapAccess> = heap.clone();
    MarkCoordinator::new(config, heap).expect("mark stack allocation")
}

/// Runs a full cycle by hand, the way the driver thread sequences it.
///
/// Returns the number of remark pauses it took.
pub fn run_cycle(cm: &MarkCoordinator) -> usize {
    cm.concurrent_start();
    cm.scan_root_regions();
    run_cycle_from_mark(cm)
}

/// Finishes a cycle whose root regions have been scanned.
pub fn run_cycle_from_mark(cm: &MarkCoordinator) -> usize {
    let mut remarks = 0;
    loop {
        cm.mark_from_roots();
        cm.remark();
        remarks += 1;
        if !cm.restart_for_overflow() {
            break;
        }
    }
    cm.rebuild_remembered_sets();
    cm.cleanup();
    cm.complete_cleanup();
    cm.clear_next_bitmap();
    cm.note_cycle_end();
    remarks
}

/// Whether the last completed cycle found `obj` live.
pub fn prev_live(cm: &MarkCoordinator, obj: HeapAddr) -> bool {
    let idx = cm.heap().region_index(obj);
    obj >= cm.prev_tams(idx) || cm.prev_bitmap().is_marked(obj)
}

/// Every object of the heap below its region's TAMS that the last completed
/// cycle found live.
pub fn prev_marked_set(cm: &MarkCoordinator, heap: &SimHeap) -> HashSet<HeapAddr> {
    (0..heap.num_regions())
        .flat_map(|idx| heap.objects_in(idx))
        .filter(|&obj| cm.prev_bitmap().is_marked(obj))
        .collect()
}

/// A test object graph and what should survive marking.
pub struct Graph {
    pub live: Vec<HeapAddr>,
    pub dead: Vec<HeapAddr>,
}

/// Builds a chain of `n` one-field objects in `region`, rooted at the head.
pub fn rooted_chain(heap: &SimHeap, region: usize, n: usize) -> Vec<HeapAddr> {
    let objs: Vec<_> = (0..n)
        .map(|_| heap.allocate(region, 1, 2).expect("region full"))
        .collect();
    for pair in objs.windows(2) {
        heap.set_field(pair[0], 0, Some(pair[1]));
    }
    if let Some(&head) = objs.first() {
        heap.add_root(head);
    }
    objs
}

/// The graph of the basic end-to-end scenario on a 10-region heap.
///
/// Regions 0-2 hold a live graph linked across region boundaries together
/// with some unreachable objects; regions 3-9 hold only garbage.
pub fn scenario_graph(heap: &SimHeap) -> Graph {
    let live_regions: Vec<_> = (0..3)
        .map(|_| heap.new_region(RegionKind::Old).expect("free region"))
        .collect();

    let mut live = Vec::new();
    let mut dead = Vec::new();
    for &region in &live_regions {
        for i in 0..60 {
            let obj = heap.allocate(region, 2, 3).expect("region full");
            if i % 4 == 3 {
                dead.push(obj);
            } else {
                live.push(obj);
            }
        }
    }

    // A spine from the last live object back to the first, so every region
    // references the ones below it, plus a cross link into every region.
    for pair in live.windows(2).rev() {
        heap.set_field(pair[1], 0, Some(pair[0]));
    }
    let stride = live.len() / 3;
    for (i, &obj) in live.iter().enumerate().step_by(7) {
        let target = live[(i + stride) % live.len()];
        heap.set_field(obj, 1, Some(target));
    }
    // Garbage may point at live objects; that must not matter.
    for (i, &obj) in dead.iter().enumerate() {
        heap.set_field(obj, 0, Some(live[i % live.len()]));
    }
    heap.add_root(*live.last().expect("live objects"));

    for _ in 0..7 {
        let region = heap.new_region(RegionKind::Old).expect("free region");
        let mut prev = None;
        while let Some(obj) = heap.allocate(region, 1, 13) {
            heap.set_field(obj, 0, prev);
            prev = Some(obj);
            dead.push(obj);
        }
    }
    Graph { live, dead }
}

/// A root with `fan_out` children in lower regions, each with one child.
///
/// Scanning the root pushes every child at once, which floods a small local
/// queue and the global stack.
pub fn wide_graph(heap: &SimHeap, fan_out: usize) -> Graph {
    let low = heap.new_region(RegionKind::Old).expect("free region");
    let mid = heap.new_region(RegionKind::Old).expect("free region");
    let high = heap.new_region(RegionKind::Old).expect("free region");

    let mut live = Vec::new();
    let mut dead = Vec::new();
    let root = heap.allocate(high, fan_out, 0).expect("region full");
    live.push(root);
    for i in 0..fan_out {
        let region = if i % 2 == 0 { low } else { mid };
        let child = heap.allocate(region, 1, 0).expect("region full");
        let grandchild = heap.allocate(region, 0, 1).expect("region full");
        heap.set_field(root, i, Some(child));
        heap.set_field(child, 0, Some(grandchild));
        live.push(child);
        live.push(grandchild);
        dead.push(heap.allocate(region, 0, 1).expect("region full"));
    }
    heap.add_root(root);
    Graph { live, dead }
}
