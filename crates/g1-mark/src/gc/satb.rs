//! Consumer side of the snapshot-at-the-beginning log.
//!
//! While marking is active the write barrier logs the value a reference
//! field held before it was overwritten. Each producer fills a private
//! buffer; full buffers are published on a lock-free list from which marking
//! tasks take them one at a time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::addr::HeapAddr;

type Buffer = Vec<HeapAddr>;

/// The set of SATB queues of all producers plus the completed-buffer list.
#[derive(Debug)]
pub struct SatbQueueSet {
    active: AtomicBool,
    buffer_size: usize,
    process_threshold: usize,
    completed: SegQueue<Buffer>,
    completed_count: AtomicUsize,
    partials: Mutex<Vec<Arc<Mutex<Buffer>>>>,
}

impl SatbQueueSet {
    /// Creates an inactive queue set.
    ///
    /// `process_threshold` is the number of completed buffers above which
    /// marking tasks are asked to drain them.
    #[must_use]
    pub fn new(buffer_size: usize, process_threshold: usize) -> Self {
        Self {
            active: AtomicBool::new(false),
            buffer_size: buffer_size.max(1),
            process_threshold,
            completed: SegQueue::new(),
            completed_count: AtomicUsize::new(0),
            partials: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new producer.
    #[must_use]
    pub fn register_queue(self: &Arc<Self>) -> SatbQueue {
        let buf = Arc::new(Mutex::new(Vec::with_capacity(self.buffer_size)));
        self.partials.lock().push(Arc::clone(&buf));
        SatbQueue {
            set: Arc::clone(self),
            buf,
        }
    }

    /// Turns logging on or off for every producer.
    ///
    /// # Panics
    ///
    /// Panics if the current state is not `expected_active`.
    pub fn set_active_all_threads(&self, active: bool, expected_active: bool) {
        let prev = self.active.swap(active, Ordering::AcqRel);
        assert_eq!(
            prev, expected_active,
            "SATB queue set active state mismatch"
        );
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Publishes a full buffer.
    pub fn enqueue_completed_buffer(&self, buffer: Vec<HeapAddr>) {
        if buffer.is_empty() {
            return;
        }
        self.completed.push(buffer);
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Applies `f` to every entry of one completed buffer.
    ///
    /// Returns `false` if no completed buffer was available.
    pub fn apply_closure_to_completed_buffer<F>(&self, mut f: F) -> bool
    where
        F: FnMut(HeapAddr),
    {
        let Some(buffer) = self.completed.pop() else {
            return false;
        };
        self.completed_count.fetch_sub(1, Ordering::AcqRel);
        for addr in buffer {
            f(addr);
        }
        true
    }

    #[must_use]
    pub fn completed_buffers_num(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// True once enough completed buffers accumulated to be worth draining.
    #[must_use]
    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers_num() > self.process_threshold
    }

    /// Publishes every producer's partially filled buffer.
    ///
    /// Called in the remark pause so nothing logged is left behind.
    pub fn flush_partial_buffers(&self) {
        let partials = self.partials.lock();
        for buf in partials.iter() {
            let taken = std::mem::take(&mut *buf.lock());
            self.enqueue_completed_buffer(taken);
        }
    }

    /// Discards all logged entries, completed and partial.
    pub fn abandon_partial_marking(&self) {
        while self.completed.pop().is_some() {
            self.completed_count.fetch_sub(1, Ordering::AcqRel);
        }
        for buf in self.partials.lock().iter() {
            buf.lock().clear();
        }
    }
}

/// One producer's handle on a [`SatbQueueSet`].
#[derive(Debug)]
pub struct SatbQueue {
    set: Arc<SatbQueueSet>,
    buf: Arc<Mutex<Buffer>>,
}

impl SatbQueue {
    /// Logs `prev`, the value about to be overwritten, if marking is active.
    pub fn enqueue(&self, prev: HeapAddr) {
        if !self.set.is_active() {
            return;
        }
        let full = {
            let mut buf = self.buf.lock();
            buf.push(prev);
            if buf.len() < self.set.buffer_size {
                return;
            }
            std::mem::replace(&mut *buf, Vec::with_capacity(self.set.buffer_size))
        };
        self.set.enqueue_completed_buffer(full);
    }
}

impl Drop for SatbQueue {
    fn drop(&mut self) {
        let taken = std::mem::take(&mut *self.buf.lock());
        if self.set.is_active() {
            self.set.enqueue_completed_buffer(taken);
        }
        self.set
            .partials
            .lock()
            .retain(|b| !Arc::ptr_eq(b, &self.buf));
    }
}
