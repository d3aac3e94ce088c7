//! Concurrent claiming of root regions and waiting for the scan.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use g1_mark::{RegionKind, RootRegionRegistry, SimHeap};

use common::{coordinator, prev_live, test_config};

#[test]
fn test_each_region_claimed_exactly_once() {
    let registry = Arc::new(RootRegionRegistry::new());
    registry.prepare_for_scan((100..400).collect());
    let start = Arc::new(Barrier::new(6));

    let claimers: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut mine = Vec::new();
                while let Some(idx) = registry.claim_next() {
                    mine.push(idx);
                }
                mine
            })
        })
        .collect();
    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.join().unwrap());
    }
    registry.scan_finished();

    assert_eq!(all.len(), 300);
    let unique: HashSet<_> = all.into_iter().collect();
    assert_eq!(unique, (100..400).collect());
    assert_eq!(registry.num_claimed(), 300);
    assert!(!registry.scan_in_progress());
}

#[test]
fn test_waiter_blocks_until_scan_finished() {
    let registry = Arc::new(RootRegionRegistry::new());
    registry.prepare_for_scan(vec![3, 4]);
    let released = Arc::new(AtomicBool::new(false));

    let waiter = {
        let registry = Arc::clone(&registry);
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let waited = registry.wait_until_scan_finished();
            // The scan was still open when the waiter arrived, or it was
            // already closed; either way it is closed now.
            assert!(released.load(Ordering::Acquire) || !waited);
            waited
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(registry.claim_next(), Some(3));
    assert_eq!(registry.claim_next(), Some(4));
    released.store(true, Ordering::Release);
    registry.scan_finished();
    waiter.join().unwrap();

    assert!(!registry.wait_until_scan_finished());
}

#[test]
fn test_aborted_scan_may_finish_with_unclaimed_regions() {
    let registry = RootRegionRegistry::new();
    registry.prepare_for_scan(vec![1, 2, 3]);
    assert_eq!(registry.claim_next(), Some(1));
    registry.abort();
    assert_eq!(registry.claim_next(), None);
    registry.scan_finished();
    assert_eq!(registry.num_claimed(), 1);

    // A later scan starts from scratch.
    registry.prepare_for_scan(vec![7]);
    assert_eq!(registry.claim_next(), Some(7));
    registry.scan_finished();
}

#[test]
fn test_many_survivor_regions_scanned_in_parallel() {
    let heap = Arc::new(SimHeap::new(24, 512));
    let old = heap.new_region(RegionKind::Old).unwrap();
    let mut targets = Vec::new();
    let mut survivors = Vec::new();
    for _ in 0..16 {
        let region = heap.new_region(RegionKind::Survivor).unwrap();
        survivors.push(region);
        // Survivor objects point into an old region; they are not rooted.
        for _ in 0..8 {
            let target = heap.allocate(old, 0, 2).unwrap();
            let holder = heap.allocate(region, 1, 0).unwrap();
            heap.set_field(holder, 0, Some(target));
            targets.push(target);
        }
    }
    let dead = heap.allocate(old, 0, 2).unwrap();

    let cm = coordinator(test_config(4), &heap);
    cm.concurrent_start();
    assert_eq!(cm.root_regions().num_regions(), survivors.len());
    cm.scan_root_regions();
    assert_eq!(cm.root_regions().num_claimed(), survivors.len());
    assert!(!cm.root_regions().scan_in_progress());

    common::run_cycle_from_mark(&cm);
    assert!(targets.iter().all(|&obj| prev_live(&cm, obj)));
    assert!(!prev_live(&cm, dead));
}
