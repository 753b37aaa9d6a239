//! Cache Statistics Module
//!
//! Counters live in the arena so every attached process updates and reads
//! the same numbers. [`CacheStats`] is a point-in-time copy.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Shared Counters ==
#[repr(C)]
pub(crate) struct SharedStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub deletes: AtomicU64,
    pub expunges: AtomicU64,
    pub slam_rejections: AtomicU64,
    pub alloc_failures: AtomicU64,
    pub num_entries: AtomicU64,
    pub mem_size: AtomicU64,
    pub start_time: AtomicU64,
}

impl SharedStats {
    pub fn new(start_time: u64) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            expunges: AtomicU64::new(0),
            slam_rejections: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            num_entries: AtomicU64::new(0),
            mem_size: AtomicU64::new(0),
            start_time: AtomicU64::new(start_time),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements without wrapping below zero.
    pub fn drop_by(counter: &AtomicU64, amount: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(amount))
        });
    }

    /// Restarts the hit/miss accounting.
    pub fn reset(&self, now: u64) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.start_time.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            expunges: self.expunges.load(Ordering::Relaxed),
            slam_rejections: self.slam_rejections.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            num_entries: self.num_entries.load(Ordering::Relaxed),
            mem_size: self.mem_size.load(Ordering::Relaxed),
            start_time: self.start_time.load(Ordering::Relaxed),
        }
    }
}

// == Cache Stats ==
/// Snapshot of the shared cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Finds that returned a live entry
    pub hits: u64,
    /// Finds that came back empty, including expired entries
    pub misses: u64,
    pub inserts: u64,
    pub deletes: u64,
    /// Full sweeps forced by allocation pressure
    pub expunges: u64,
    /// Inserts suppressed by slam defense
    pub slam_rejections: u64,
    /// Inserts that failed for lack of arena memory
    pub alloc_failures: u64,
    /// Entries currently reachable from the index
    pub num_entries: u64,
    /// Arena bytes held by entries, including ones awaiting free
    pub mem_size: u64,
    /// Unix milliseconds of creation or last clear
    pub start_time: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let stats = SharedStats::new(0);
        SharedStats::bump(&stats.hits);
        SharedStats::bump(&stats.misses);
        assert_eq!(stats.snapshot().hit_rate(), 0.5);
    }

    #[test]
    fn test_drop_by_saturates() {
        let stats = SharedStats::new(0);
        SharedStats::bump(&stats.num_entries);
        SharedStats::drop_by(&stats.num_entries, 5);
        assert_eq!(stats.snapshot().num_entries, 0);
    }

    #[test]
    fn test_reset_keeps_totals() {
        let stats = SharedStats::new(1);
        SharedStats::bump(&stats.hits);
        SharedStats::bump(&stats.inserts);
        stats.reset(99);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.inserts, 1);
        assert_eq!(snap.start_time, 99);
    }
}
