//! Integration tests for the marking events emitted with the `tracing`
//! feature.

#![cfg(feature = "tracing")]

mod common;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use g1_mark::tracing::internal::next_cycle_id;
use g1_mark::{RegionKind, SimHeap};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use common::{coordinator, rooted_chain, run_cycle, test_config};

#[derive(Debug, Default, Clone)]
struct Captured {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for Captured {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_owned(), format!("{value:?}"));
        }
    }
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        event.record(&mut captured);
        self.events.lock().unwrap().push(captured);
    }
}

/// Runs `f` with a subscriber capturing events of the current thread.
fn capture<F: FnOnce()>(f: F) -> Vec<Captured> {
    let layer = CaptureLayer::default();
    let events = Arc::clone(&layer.events);
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, f);
    let events = events.lock().unwrap();
    events.clone()
}

fn phases(events: &[Captured], message: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.message == message)
        .filter_map(|e| e.fields.get("phase").cloned())
        .collect()
}

#[test]
fn test_cycle_phases_logged_in_order() {
    let heap = Arc::new(SimHeap::new(4, 512));
    let region = heap.new_region(RegionKind::Old).unwrap();
    rooted_chain(&heap, region, 30);
    let cm = coordinator(test_config(2), &heap);

    let events = capture(|| {
        run_cycle(&cm);
    });

    let started = phases(&events, "phase_start");
    assert_eq!(
        started,
        [
            "concurrent-start",
            "root-region-scan",
            "mark-from-roots",
            "remark",
            "rebuild",
            "cleanup",
            "clear-bitmap",
        ]
    );
    assert_eq!(phases(&events, "phase_end"), started);
    assert!(events
        .iter()
        .filter(|e| e.message == "phase_end")
        .all(|e| e.fields.contains_key("elapsed_ms")));
}

#[test]
fn test_cleanup_and_rebuild_report_counts() {
    let heap = Arc::new(SimHeap::new(4, 512));
    let sparse = heap.new_region(RegionKind::Old).unwrap();
    rooted_chain(&heap, sparse, 10);
    let garbage = heap.new_region(RegionKind::Old).unwrap();
    heap.allocate(garbage, 0, 20).unwrap();
    let cm = coordinator(test_config(1), &heap);

    let events = capture(|| {
        run_cycle(&cm);
    });

    let rebuild = events
        .iter()
        .find(|e| e.message == "rebuild_selected")
        .expect("rebuild event");
    assert_eq!(rebuild.fields["candidates"], "1");
    let cleanup = events
        .iter()
        .find(|e| e.message == "cleanup")
        .expect("cleanup event");
    assert_eq!(cleanup.fields["regions_reclaimed"], "1");
    assert_eq!(cleanup.fields["live_words"], "40");
}

#[test]
fn test_abort_is_logged() {
    let heap = Arc::new(SimHeap::new(2, 512));
    let region = heap.new_region(RegionKind::Old).unwrap();
    rooted_chain(&heap, region, 4);
    let cm = coordinator(test_config(1), &heap);

    let events = capture(|| {
        cm.concurrent_start();
        cm.abort();
        // A second abort of the same cycle is a no-op.
        cm.abort();
    });
    cm.scan_root_regions();
    cm.note_cycle_end();

    let aborts = events
        .iter()
        .filter(|e| e.message == "concurrent-mark-abort")
        .count();
    assert_eq!(aborts, 1);
    assert!(cm.has_aborted());
}

#[test]
fn test_cycle_ids_increase() {
    let a = next_cycle_id();
    let b = next_cycle_id();
    assert!(b.0 > a.0);
    assert!(a.0 >= 1);
}
