//! Work-stealing task queues for parallel marking.
//!
//! Each marking task owns one [`TaskQueue`]: the owner pushes and pops grey
//! object addresses at the bottom (LIFO) while idle tasks steal from the top
//! (FIFO). [`TaskQueueSet`] groups the queues so a task can look for work in
//! its peers.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::addr::HeapAddr;

/// Lock-free work stealing queue of heap addresses.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), with the fence placement of "Correct and Efficient
/// Work-Stealing for Weak Memory Models" (Lê et al., 2013).
///
/// Slots are atomic words, so a thief that loses the race on `top` only ever
/// observes a stale address, never a torn one.
///
/// # Invariants
///
/// - capacity is a power of 2 and `mask = capacity - 1`
/// - the queue is empty when `bottom == top`
/// - the queue is full when `bottom - top == capacity`
/// - only the owning task calls [`push`](Self::push) and [`pop`](Self::pop)
#[derive(Debug)]
pub struct TaskQueue {
    buffer: Box<[AtomicUsize]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
}

impl TaskQueue {
    /// Creates an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of 2.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "TaskQueue capacity must be a power of 2"
        );
        Self {
            buffer: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Push an entry at the local end.
    ///
    /// Returns `false` without pushing if the queue is full. Owner only.
    pub fn push(&self, addr: HeapAddr) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= self.capacity() {
            return false;
        }

        self.buffer[b & self.mask].store(addr.as_usize(), Ordering::Relaxed);
        // The slot write must be visible before a thief can see the new bottom.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop an entry from the local end. Owner only.
    pub fn pop(&self) -> Option<HeapAddr> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if (b.wrapping_sub(t) as isize) < 0 {
            // Empty: undo the reservation.
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let item = self.buffer[b & self.mask].load(Ordering::Relaxed);
        if b != t {
            return Some(HeapAddr::new(item));
        }

        // Last entry: race the thieves for it.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        won.then_some(HeapAddr::new(item))
    }

    /// Steal an entry from the remote end.
    ///
    /// May be called concurrently from any number of threads; the CAS on
    /// `top` gives at-most-once delivery.
    pub fn steal(&self) -> Option<HeapAddr> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if (b.wrapping_sub(t) as isize) <= 0 {
            return None;
        }

        // Read before claiming: once top moves the owner may reuse the slot.
        let item = self.buffer[t & self.mask].load(Ordering::Relaxed);
        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| HeapAddr::new(item))
    }

    /// Approximate number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        let n = b.wrapping_sub(t) as isize;
        usize::try_from(n).unwrap_or(0)
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every entry. Only valid while no thread is using the queue.
    pub fn set_empty(&self) {
        let t = self.top.load(Ordering::Acquire);
        self.bottom.store(t, Ordering::Release);
    }
}

/// The set of task queues taking part in a marking phase.
#[derive(Debug)]
pub struct TaskQueueSet {
    queues: Box<[TaskQueue]>,
}

impl TaskQueueSet {
    /// Creates `n` queues of `capacity` entries each.
    #[must_use]
    pub fn new(n: usize, capacity: usize) -> Self {
        Self {
            queues: (0..n).map(|_| TaskQueue::new(capacity)).collect(),
        }
    }

    /// Queue owned by task `id`.
    #[must_use]
    pub fn queue(&self, id: usize) -> &TaskQueue {
        &self.queues[id]
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// True if there are no queues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Try to steal one entry for task `id` from the first `active` queues.
    ///
    /// Victims are visited round-robin starting after `*seed`, which is
    /// advanced so consecutive attempts spread over different peers.
    pub fn steal(&self, id: usize, active: usize, seed: &mut usize) -> Option<HeapAddr> {
        let active = active.min(self.queues.len());
        if active < 2 {
            return None;
        }
        for _ in 0..active {
            *seed = (*seed + 1) % active;
            if *seed == id {
                continue;
            }
            if let Some(addr) = self.queues[*seed].steal() {
                return Some(addr);
            }
        }
        None
    }

    /// True if any of the first `active` queues holds an entry.
    #[must_use]
    pub fn peek(&self, active: usize) -> bool {
        self.queues.iter().take(active).any(|q| !q.is_empty())
    }

    /// Empties every queue.
    pub fn set_empty(&self) {
        for q in &*self.queues {
            q.set_empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_lifo() {
        let q = TaskQueue::new(8);
        for i in 1..=3 {
            assert!(q.push(HeapAddr::new(i)));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(HeapAddr::new(3)));
        assert_eq!(q.pop(), Some(HeapAddr::new(2)));
        assert_eq!(q.pop(), Some(HeapAddr::new(1)));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_steal_fifo() {
        let q = TaskQueue::new(8);
        q.push(HeapAddr::new(10));
        q.push(HeapAddr::new(20));
        assert_eq!(q.steal(), Some(HeapAddr::new(10)));
        assert_eq!(q.pop(), Some(HeapAddr::new(20)));
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn test_full_queue_rejects_push() {
        let q = TaskQueue::new(4);
        for i in 0..4 {
            assert!(q.push(HeapAddr::new(i)));
        }
        assert!(!q.push(HeapAddr::new(99)));
        q.steal();
        assert!(q.push(HeapAddr::new(99)));
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_capacity_must_be_power_of_two() {
        let _ = TaskQueue::new(6);
    }

    #[test]
    fn test_set_empty() {
        let q = TaskQueue::new(8);
        q.push(HeapAddr::new(1));
        q.push(HeapAddr::new(2));
        q.set_empty();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_concurrent_steal_conserves_entries() {
        const N: usize = 10_000;
        let q = Arc::new(TaskQueue::new(1 << 14));
        for i in 1..=N {
            assert!(q.push(HeapAddr::new(i)));
        }

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(a) = q.steal() {
                        got.push(a.as_usize());
                    }
                    got
                })
            })
            .collect();

        let mut all = Vec::new();
        while let Some(a) = q.pop() {
            all.push(a.as_usize());
        }
        for t in thieves {
            all.extend(t.join().unwrap());
        }

        assert_eq!(all.len(), N);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), N);
    }

    #[test]
    fn test_queue_set_steal_skips_self() {
        let set = TaskQueueSet::new(3, 8);
        set.queue(0).push(HeapAddr::new(5));
        let mut seed = 0;
        assert_eq!(set.steal(0, 3, &mut seed), None);
        assert!(set.peek(3));
        set.queue(2).push(HeapAddr::new(7));
        assert_eq!(set.steal(0, 3, &mut seed), Some(HeapAddr::new(7)));
        assert_eq!(set.steal(1, 3, &mut seed), Some(HeapAddr::new(5)));
        assert!(!set.peek(3));
    }
}
