//! End-to-end marking cycles over the simulated heap.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use g1_mark::{
    HeapAccess, MemRegion, PauseKind, RegionKind, SafepointSynchronizer, SimHeap, StsSafepoint,
};

use common::{
    coordinator, prev_live, prev_marked_set, rooted_chain, run_cycle, run_cycle_from_mark,
    scenario_graph, test_config, wide_graph, REGION_WORDS,
};

#[test]
fn test_full_cycle_marks_reachable_and_reclaims_garbage_regions() {
    let heap = Arc::new(SimHeap::new(10, REGION_WORDS));
    let graph = scenario_graph(&heap);
    let cm = coordinator(test_config(4), &heap);

    cm.concurrent_start();
    assert!(cm.is_marking_in_progress());
    assert!(cm.satb_queue_set().is_active());

    cm.scan_root_regions();
    assert_eq!(cm.metrics().snapshot().root_regions_scanned, 0);

    cm.mark_from_roots();
    assert!(!cm.concurrent_marking_in_progress());
    cm.remark();
    assert!(!cm.restart_for_overflow());
    assert!(!cm.satb_queue_set().is_active());

    // Before cleanup the result is in the next bitmap.
    for &obj in &graph.live {
        assert!(cm.next_bitmap().is_marked(obj), "live {obj} not marked");
    }
    for &obj in &graph.dead {
        assert!(!cm.next_bitmap().is_marked(obj), "dead {obj} marked");
    }

    cm.rebuild_remembered_sets();
    cm.cleanup();
    assert!(!cm.is_marking_in_progress());
    assert_eq!(cm.complete_cleanup(), 7);
    cm.clear_next_bitmap();
    cm.note_cycle_end();

    let expected: HashSet<_> = graph.live.iter().copied().collect();
    assert_eq!(prev_marked_set(&cm, &heap), expected);
    for idx in 3..10 {
        assert_eq!(heap.region_kind(idx), RegionKind::Free);
    }
    for idx in 0..3 {
        assert_eq!(heap.region_kind(idx), RegionKind::Old);
    }
    assert!(cm.next_bitmap().is_clear_range(heap.reserved()));

    let stats = cm.metrics().snapshot();
    assert_eq!(stats.cycles_started, 1);
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.regions_reclaimed, 7);
    assert_eq!(stats.remark_pauses, 1);
    assert!(stats.objects_marked >= graph.live.len());
}

#[test]
fn test_tiny_mark_stack_gives_same_result() {
    let reference = {
        let heap = Arc::new(SimHeap::new(10, REGION_WORDS));
        let graph = wide_graph(&heap, 200);
        let cm = coordinator(test_config(4), &heap);
        run_cycle(&cm);
        assert_eq!(cm.metrics().snapshot().overflow_resets, 0);
        (graph.live.len(), prev_marked_set(&cm, &heap))
    };

    let heap = Arc::new(SimHeap::new(10, REGION_WORDS));
    let graph = wide_graph(&heap, 200);
    let mut config = test_config(4);
    config.set_mark_stack_size(1, 1024);
    config.set_task_queue_capacity(4);
    let cm = coordinator(config, &heap);
    run_cycle(&cm);

    let stats = cm.metrics().snapshot();
    assert!(
        stats.overflow_resets + stats.remark_restarts >= 1,
        "expected an overflow restart: {stats:?}"
    );
    assert!(cm.mark_stack().capacity() > 1);

    let marked = prev_marked_set(&cm, &heap);
    assert_eq!(marked.len(), reference.0);
    assert_eq!(marked, reference.1);
    for &obj in &graph.dead {
        assert!(!prev_live(&cm, obj));
    }
}

#[test]
fn test_abort_mid_mark_then_fresh_cycle() {
    let heap = Arc::new(SimHeap::new(32, 4096));
    let mut live = Vec::new();
    for _ in 0..24 {
        let region = heap.new_region(RegionKind::Old).unwrap();
        live.extend(common::rooted_chain(&heap, region, 1300));
    }

    let mut config = test_config(2);
    config.set_clock_periods(64, 16);
    config.set_mark_step_duration_ms(0.5);
    let cm = Arc::new(coordinator(config, &heap));
    let safepoint = StsSafepoint::new(Arc::clone(cm.thread_set()));

    cm.concurrent_start();
    cm.scan_root_regions();
    let marker = {
        let cm = Arc::clone(&cm);
        thread::spawn(move || cm.mark_from_roots())
    };
    thread::sleep(Duration::from_millis(2));
    safepoint.request_synchronizing_pause(PauseKind::FullGc, &mut || cm.abort());
    marker.join().unwrap();

    assert!(cm.has_aborted());
    assert!(cm.mark_stack().is_empty());
    assert!(!cm.is_marking_in_progress());
    assert!(!cm.satb_queue_set().is_active());
    assert!(cm.next_bitmap().is_clear_range(heap.reserved()));
    assert_eq!(cm.metrics().snapshot().cycles_aborted, 1);

    // What the driver does with an aborted cycle.
    cm.remark();
    cm.cleanup();
    assert_eq!(cm.complete_cleanup(), 0);
    cm.note_cycle_end();

    run_cycle(&cm);
    assert!(!cm.has_aborted());
    for &obj in &live {
        assert!(prev_live(&cm, obj));
    }
    let stats = cm.metrics().snapshot();
    assert_eq!(stats.cycles_started, 2);
    assert_eq!(stats.cycles_completed, 1);
}

#[test]
fn test_remark_overflow_restart_does_not_rescan_root_regions() {
    let heap = Arc::new(SimHeap::new(10, REGION_WORDS));
    let graph = wide_graph(&heap, 150);
    let eden = heap.new_region(RegionKind::Eden).unwrap();
    let young = heap.allocate(eden, 1, 0).unwrap();
    let old_region = heap.new_region(RegionKind::Old).unwrap();
    let from_young = heap.allocate(old_region, 0, 4).unwrap();
    heap.set_field(young, 0, Some(from_young));

    let mut config = test_config(2);
    config.set_mark_stack_size(1, 4096);
    config.set_task_queue_capacity(2);
    let cm = coordinator(config, &heap);

    cm.concurrent_start();
    cm.scan_root_regions();
    assert_eq!(cm.root_regions().num_claimed(), 1);
    // Leave everything to remark so the remark pause itself overflows.
    cm.remark();
    assert!(cm.restart_for_overflow());
    assert!(cm.is_marking_in_progress());
    let mut restarts = 1;
    loop {
        cm.mark_from_roots();
        cm.remark();
        if !cm.restart_for_overflow() {
            break;
        }
        restarts += 1;
    }
    cm.rebuild_remembered_sets();
    cm.cleanup();
    cm.complete_cleanup();
    cm.note_cycle_end();

    let stats = cm.metrics().snapshot();
    assert!(stats.remark_pauses > 1);
    assert!(restarts >= 1);
    assert_eq!(stats.root_regions_scanned, 1);
    assert_eq!(cm.root_regions().num_claimed(), 1);
    assert!(!cm.root_regions().scan_in_progress());

    assert!(prev_live(&cm, from_young));
    for &obj in &graph.live {
        assert!(prev_live(&cm, obj));
    }
    for &obj in &graph.dead {
        assert!(!prev_live(&cm, obj));
    }
}

#[test]
fn test_objects_allocated_during_marking_are_live() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let region = heap.new_region(RegionKind::Old).unwrap();
    let before = heap.allocate(region, 0, 4).unwrap();
    let cm = coordinator(test_config(2), &heap);

    cm.concurrent_start();
    let tams = cm.next_tams(region);
    let after = heap.allocate(region, 0, 4).unwrap();
    assert!(after >= tams);
    assert!(cm.is_alive(after));
    assert!(!cm.is_alive(before));

    cm.scan_root_regions();
    cm.mark_from_roots();
    cm.remark();
    // Counted through TAMS, so the region is not empty.
    assert_eq!(cm.region_live_words(region), 5);
    cm.cleanup();
    assert_eq!(cm.complete_cleanup(), 0);
    cm.note_cycle_end();

    assert!(prev_live(&cm, after));
    assert!(!prev_live(&cm, before));
}

#[test]
fn test_region_reused_under_a_claiming_task() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let reused = heap.new_region(RegionKind::Old).unwrap();
    let other = heap.new_region(RegionKind::Old).unwrap();
    let first = heap.allocate(reused, 1, 3).unwrap();
    let second = heap.allocate(reused, 1, 3).unwrap();
    heap.add_root(first);
    heap.add_root(second);
    let chain = rooted_chain(&heap, other, 5);
    let garbage = heap.allocate(other, 0, 4).unwrap();

    let mut config = test_config(1);
    config.set_clock_periods(4, 4);
    let cm = coordinator(config, &heap);
    cm.concurrent_start();
    cm.scan_root_regions();
    cm.set_concurrency_and_phase(1, true);
    {
        let mut task = cm.claim_task(0);
        // A zero time target stops a step at its first clock call: here
        // right after claiming the region.
        task.do_marking_step(&cm, 0.0, true, false);
        assert!(task.has_timed_out());
        assert_eq!(task.current_region(), Some(reused));
        // Scans `first`, then stops holding the rest of the region.
        task.do_marking_step(&cm, 0.0, true, false);
        assert!(task.has_timed_out());
        assert_eq!(task.current_region(), Some(reused));
    }

    // Freed and handed out again while the task still holds it.
    heap.remove_root(first);
    heap.remove_root(second);
    heap.free_region(reused);
    cm.note_region_reused(reused);
    assert_eq!(heap.new_region(RegionKind::Old), Some(reused));
    let fresh = heap.allocate(reused, 1, 3).unwrap();
    let fresh2 = heap.allocate(reused, 1, 3).unwrap();
    assert_eq!((fresh, fresh2), (first, second));
    // Resuming the walk at the old finger would trace these.
    heap.set_field(fresh, 0, Some(garbage));
    heap.set_field(fresh2, 0, Some(garbage));

    run_cycle_from_mark(&cm);
    assert_eq!(cm.claim_task(0).current_region(), None);
    assert!(!prev_live(&cm, garbage));
    assert!(chain.iter().all(|&obj| prev_live(&cm, obj)));
    assert!(prev_live(&cm, fresh) && prev_live(&cm, fresh2));
    assert_eq!(heap.region_kind(reused), RegionKind::Old);
}

#[test]
fn test_mark_stack_check_closed_after_cleanup() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let region = heap.new_region(RegionKind::Old).unwrap();
    rooted_chain(&heap, region, 8);
    let cm = coordinator(test_config(2), &heap);

    run_cycle(&cm);
    // Cleanup closed its own note, so a new one can be opened.
    cm.mark_stack().note_start_of_gc();
    cm.mark_stack().note_end_of_gc();
}

#[test]
#[should_panic(expected = "note_start_of_gc called twice")]
fn test_cleanup_opens_mark_stack_check() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let region = heap.new_region(RegionKind::Old).unwrap();
    rooted_chain(&heap, region, 8);
    let cm = coordinator(test_config(1), &heap);

    cm.concurrent_start();
    cm.scan_root_regions();
    cm.mark_from_roots();
    cm.remark();
    cm.mark_stack().note_start_of_gc();
    cm.cleanup();
}

#[test]
fn test_survivor_references_are_marked() {
    let heap = Arc::new(SimHeap::new(6, REGION_WORDS));
    let old = heap.new_region(RegionKind::Old).unwrap();
    let targets: Vec<_> = (0..10).map(|_| heap.allocate(old, 1, 1).unwrap()).collect();
    let unreferenced = heap.allocate(old, 0, 1).unwrap();
    for pair in targets.windows(2) {
        heap.set_field(pair[0], 0, Some(pair[1]));
    }

    let survivor = heap.new_region(RegionKind::Survivor).unwrap();
    let holder = heap.allocate(survivor, 1, 0).unwrap();
    heap.set_field(holder, 0, Some(targets[0]));

    let cm = coordinator(test_config(2), &heap);
    run_cycle(&cm);

    assert_eq!(cm.metrics().snapshot().root_regions_scanned, 1);
    for &obj in &targets {
        assert!(prev_live(&cm, obj));
    }
    assert!(!prev_live(&cm, unreferenced));
}

#[test]
fn test_humongous_objects() {
    let heap = Arc::new(SimHeap::new(10, REGION_WORDS));
    let old = heap.new_region(RegionKind::Old).unwrap();
    let small = heap.allocate(old, 2, 0).unwrap();
    let live_big = heap.allocate_humongous(1, 2 * REGION_WORDS).unwrap();
    let dead_big = heap.allocate_humongous(0, REGION_WORDS + 10).unwrap();
    let leaf = heap.allocate(old, 0, 8).unwrap();
    heap.set_field(small, 0, Some(live_big));
    heap.set_field(live_big, 0, Some(leaf));
    heap.add_root(small);

    let cm = coordinator(test_config(3), &heap);
    cm.concurrent_start();
    cm.scan_root_regions();
    cm.mark_from_roots();
    cm.remark();

    let big_region = heap.region_index(live_big);
    assert_eq!(cm.region_live_words(big_region), REGION_WORDS);
    assert_eq!(cm.region_live_words(big_region + 1), REGION_WORDS);
    assert_eq!(cm.region_live_words(big_region + 2), 2);

    cm.cleanup();
    // Only the dead humongous start region is listed, its tail goes with it.
    assert_eq!(cm.complete_cleanup(), 1);
    cm.note_cycle_end();

    assert!(prev_live(&cm, live_big));
    assert!(prev_live(&cm, leaf));
    let dead_region = heap.region_index(dead_big);
    assert_eq!(heap.region_kind(dead_region), RegionKind::Free);
    assert_eq!(heap.region_kind(dead_region + 1), RegionKind::Free);
    assert_eq!(heap.region_kind(big_region), RegionKind::HumongousStart);
}

#[test]
fn test_satb_keeps_snapshot_alive_under_mutation() {
    let heap = Arc::new(SimHeap::new(16, 4096));
    let region = heap.new_region(RegionKind::Old).unwrap();
    let chain = common::rooted_chain(&heap, region, 1000);
    let head = chain[0];

    let mut config = test_config(2);
    config.set_satb(8, 0);
    config.set_clock_periods(32, 8);
    let cm = Arc::new(coordinator(config, &heap));
    heap.attach_satb_queue(cm.satb_queue_set().register_queue());
    let safepoint = StsSafepoint::new(Arc::clone(cm.thread_set()));

    cm.concurrent_start();
    let cut = chain[1];

    let mutator = {
        let heap = Arc::clone(&heap);
        let sts = Arc::clone(cm.thread_set());
        let chain = chain.clone();
        thread::spawn(move || {
            let joiner = sts.joiner();
            // Keep cutting the chain right behind the head and splicing the
            // tail back on. Snapshot objects must be marked regardless.
            for round in 0..200 {
                let at = 1 + (round * 37) % (chain.len() - 2);
                heap.set_field(chain[0], 0, Some(chain[at]));
                heap.set_field(chain[0], 0, Some(chain[1]));
                if joiner.should_yield() {
                    joiner.yield_now();
                }
            }
        })
    };

    cm.scan_root_regions();
    cm.mark_from_roots();
    mutator.join().unwrap();
    safepoint.request_synchronizing_pause(PauseKind::Remark, &mut || cm.remark());
    assert!(!cm.restart_for_overflow());
    heap.detach_satb_queue();
    cm.cleanup();
    cm.note_cycle_end();

    assert_eq!(heap.field(head, 0), Some(cut));
    for &obj in &chain {
        assert!(prev_live(&cm, obj), "snapshot object {obj} lost");
    }
}

#[test]
fn test_rebuild_selects_sparse_old_regions() {
    let heap = Arc::new(SimHeap::new(6, REGION_WORDS));
    let dense = heap.new_region(RegionKind::Old).unwrap();
    let sparse = heap.new_region(RegionKind::Old).unwrap();
    let empty = heap.new_region(RegionKind::Old).unwrap();

    let mut prev = None;
    while let Some(obj) = heap.allocate(dense, 1, 6) {
        heap.set_field(obj, 0, prev);
        prev = Some(obj);
    }
    heap.add_root(prev.unwrap());
    let kept = heap.allocate(sparse, 0, 30).unwrap();
    heap.allocate(sparse, 0, 500).unwrap();
    heap.add_root(kept);
    heap.allocate(empty, 0, 100).unwrap();

    let cm = coordinator(test_config(1), &heap);
    cm.concurrent_start();
    cm.scan_root_regions();
    cm.mark_from_roots();
    cm.remark();
    assert_eq!(cm.region_live_words(sparse), 31);
    assert_eq!(cm.region_live_words(empty), 0);
    assert_eq!(cm.rebuild_remembered_sets(), 1);
    cm.cleanup();
    assert_eq!(cm.complete_cleanup(), 1);
    cm.note_cycle_end();
    assert_eq!(heap.region_kind(empty), RegionKind::Free);
    assert_eq!(cm.metrics().snapshot().rebuild_candidates, 1);
}

#[test]
fn test_clear_next_bitmap_in_chunks() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let region = heap.new_region(RegionKind::Old).unwrap();
    let objs = common::rooted_chain(&heap, region, 50);
    let mut config = test_config(1);
    config.set_clear_bitmap_chunk_words(64);
    let cm = coordinator(config, &heap);

    cm.concurrent_start();
    cm.scan_root_regions();
    cm.mark_from_roots();
    assert!(cm.next_bitmap().is_marked(objs[49]));
    cm.clear_next_bitmap();
    let covered = MemRegion::with_size(heap.region_bottom(0), heap.num_regions() * REGION_WORDS);
    assert!(cm.next_bitmap().is_clear_range(covered));
}

#[test]
fn test_summary_info_lists_tasks() {
    let heap = Arc::new(SimHeap::new(4, REGION_WORDS));
    let region = heap.new_region(RegionKind::Old).unwrap();
    common::rooted_chain(&heap, region, 10);
    let cm = coordinator(test_config(2), &heap);
    run_cycle(&cm);

    let mut out = String::new();
    cm.print_summary_info(&mut out).unwrap();
    assert!(out.contains("1 started, 1 completed"));
    assert!(out.contains("remark: 1 pauses"));
    assert!(out.contains("task 0:"));
    assert!(out.contains("task 1:"));

    let mut gangs = String::new();
    cm.print_worker_threads_on(&mut gangs).unwrap();
    assert!(gangs.contains("g1-conc"));
    assert!(gangs.contains("g1-par"));
}
