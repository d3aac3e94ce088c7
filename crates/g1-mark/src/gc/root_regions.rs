//! Survivor regions scanned as marking roots.
//!
//! Objects in survivor regions sit above their region's TAMS and are never
//! marked themselves, but whatever they reference must be. They are scanned
//! once per cycle, before concurrent marking proper, and the next young
//! collection has to wait until that scan is complete.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

/// Registry of root regions with exclusive, concurrent claiming.
#[derive(Debug, Default)]
pub struct RootRegionRegistry {
    regions: RwLock<Vec<usize>>,
    claimed: AtomicUsize,
    should_abort: AtomicBool,
    scan_in_progress: Mutex<bool>,
    scan_done: Condvar,
}

impl RootRegionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scan over `survivors`.
    ///
    /// # Panics
    ///
    /// Panics if a scan is already in progress.
    pub fn prepare_for_scan(&self, survivors: Vec<usize>) {
        let mut in_progress = self.scan_in_progress.lock();
        assert!(!*in_progress, "root region scan already in progress");
        *self.regions.write() = survivors;
        self.claimed.store(0, Ordering::Release);
        self.should_abort.store(false, Ordering::Release);
        *in_progress = true;
    }

    /// Claims the next unscanned region index.
    ///
    /// Returns `None` once all regions are claimed or after [`abort`](Self::abort).
    pub fn claim_next(&self) -> Option<usize> {
        if self.should_abort.load(Ordering::Acquire) {
            return None;
        }
        let regions = self.regions.read();
        let len = regions.len();
        let mut idx = self.claimed.load(Ordering::Acquire);
        loop {
            if idx >= len {
                return None;
            }
            match self.claimed.compare_exchange_weak(
                idx,
                idx + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(regions[idx]),
                Err(actual) => idx = actual,
            }
        }
    }

    /// Makes every later [`claim_next`](Self::claim_next) return `None`.
    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn scan_in_progress(&self) -> bool {
        *self.scan_in_progress.lock()
    }

    /// Closes the scan and wakes waiters.
    ///
    /// # Panics
    ///
    /// Panics if no scan is in progress, or if the scan was not aborted and
    /// some region was never claimed.
    pub fn scan_finished(&self) {
        let mut in_progress = self.scan_in_progress.lock();
        assert!(*in_progress, "no root region scan in progress");
        if !self.should_abort.load(Ordering::Acquire) {
            let len = self.regions.read().len();
            let claimed = self.claimed.load(Ordering::Acquire);
            assert!(
                claimed == len,
                "root region scan finished with {claimed} of {len} regions claimed"
            );
        }
        *in_progress = false;
        self.scan_done.notify_all();
    }

    /// Closes the scan without checking that every region was claimed.
    pub fn cancel_scan(&self) {
        let mut in_progress = self.scan_in_progress.lock();
        *in_progress = false;
        self.scan_done.notify_all();
    }

    /// Blocks until no scan is in progress. Returns whether it had to wait.
    pub fn wait_until_scan_finished(&self) -> bool {
        let mut in_progress = self.scan_in_progress.lock();
        if !*in_progress {
            return false;
        }
        while *in_progress {
            self.scan_done.wait(&mut in_progress);
        }
        true
    }

    /// Number of regions handed out by the current or last scan.
    #[must_use]
    pub fn num_claimed(&self) -> usize {
        self.claimed.load(Ordering::Acquire)
    }

    /// Number of regions registered for the current or last scan.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.regions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_in_order_then_none() {
        let reg = RootRegionRegistry::new();
        reg.prepare_for_scan(vec![4, 7, 9]);
        assert_eq!(reg.claim_next(), Some(4));
        assert_eq!(reg.claim_next(), Some(7));
        assert_eq!(reg.claim_next(), Some(9));
        assert_eq!(reg.claim_next(), None);
        assert_eq!(reg.num_claimed(), 3);
        reg.scan_finished();
        assert!(!reg.wait_until_scan_finished());
    }

    #[test]
    fn test_abort_stops_claims() {
        let reg = RootRegionRegistry::new();
        reg.prepare_for_scan(vec![1, 2]);
        reg.abort();
        assert_eq!(reg.claim_next(), None);
        // Aborted scans skip the all-claimed check.
        reg.scan_finished();
    }

    #[test]
    #[should_panic(expected = "1 of 2 regions claimed")]
    fn test_unclaimed_region_detected() {
        let reg = RootRegionRegistry::new();
        reg.prepare_for_scan(vec![1, 2]);
        reg.claim_next();
        reg.scan_finished();
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn test_double_prepare_panics() {
        let reg = RootRegionRegistry::new();
        reg.prepare_for_scan(vec![]);
        reg.prepare_for_scan(vec![]);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let reg = std::sync::Arc::new(RootRegionRegistry::new());
        reg.prepare_for_scan(vec![3]);
        let waiter = {
            let reg = std::sync::Arc::clone(&reg);
            std::thread::spawn(move || reg.wait_until_scan_finished())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        reg.cancel_scan();
        waiter.join().unwrap();
        assert!(!reg.scan_in_progress());
    }
}
