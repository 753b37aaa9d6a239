//! GC / Expiry Sweeper
//!
//! Two jobs: unlink expired entries from the index, and free deleted
//! entries once their readers are gone. The bucket sweep resumes from a
//! cursor kept in the arena, so any number of processes can share the work
//! and no pass holds a shard lock for more than one chain.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::stats::SharedStats;
use crate::cache::store::CacheStore;

/// Buckets visited by the sweep piggybacked on each insert.
const STEP_BUCKETS: u64 = 8;

/// What one collection pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Expired entries unlinked from the index
    pub expired: usize,
    /// Deleted entries freed after their last reader left
    pub reclaimed: usize,
    /// Deleted entries freed despite outstanding references
    pub forced: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.reclaimed == 0 && self.forced == 0
    }
}

impl CacheStore {
    /// Runs a full pass over every bucket and the deferred-free list.
    pub fn gc(&self) -> GcReport {
        let report = self.collect(self.now(), self.header().bucket_count, true);
        if !report.is_empty() {
            debug!(
                "GC: {} expired, {} reclaimed, {} forced",
                report.expired, report.reclaimed, report.forced
            );
        }
        report
    }

    /// A short pass that skips anything another caller is holding.
    pub(crate) fn gc_step(&self, now: u64) -> GcReport {
        self.collect(now, STEP_BUCKETS, false)
    }

    /// Full pass forced by allocation pressure.
    pub(crate) fn expunge(&self, now: u64) -> GcReport {
        let report = self.collect(now, self.header().bucket_count, true);
        SharedStats::bump(&self.header().stats.expunges);
        info!(
            "Expunged cache: {} expired, {} reclaimed, {} bytes available",
            report.expired,
            report.reclaimed + report.forced,
            self.arena().avail()
        );
        report
    }

    fn collect(&self, now: u64, buckets: u64, wait: bool) -> GcReport {
        let expired = self.sweep_buckets(now, buckets, wait);
        let (reclaimed, forced) = self.collect_deferred(now, wait);
        GcReport {
            expired,
            reclaimed,
            forced,
        }
    }

    fn sweep_buckets(&self, now: u64, budget: u64, wait: bool) -> usize {
        let header = self.header();
        let count = header.bucket_count;
        let budget = budget.min(count);
        let start = header.gc_cursor.fetch_add(budget, Ordering::Relaxed);

        let mut expired = 0;
        for i in 0..budget {
            let bucket = start.wrapping_add(i) % count;
            if self.bucket(bucket).load(Ordering::Acquire) == 0 {
                continue;
            }
            let lock = self.shard_lock(bucket);
            let _lock = if wait {
                lock.write()
            } else {
                match lock.try_write() {
                    Some(lock) => lock,
                    None => continue,
                }
            };
            let _writable = self.arena().unprotected();
            expired += self.unlink_where(bucket, now, |entry| entry.is_expired(now));
        }
        expired
    }

    /// Frees deleted entries nobody references. Entries still referenced
    /// after `gc_ttl` seconds are freed anyway; `gc_ttl == 0` disables
    /// that.
    fn collect_deferred(&self, now: u64, wait: bool) -> (usize, usize) {
        let header = self.header();
        if header.gc_head.load(Ordering::Acquire) == 0 {
            return (0, 0);
        }
        let gc_lock = &self.locks().gc;
        let _gc = if wait {
            gc_lock.write()
        } else {
            match gc_lock.try_write() {
                Some(lock) => lock,
                None => return (0, 0),
            }
        };
        let _writable = self.arena().unprotected();
        let grace_ms = u64::from(self.config().gc_ttl) * 1000;

        let (mut reclaimed, mut forced) = (0, 0);
        let mut link: &AtomicU64 = &header.gc_head;
        loop {
            let offset = link.load(Ordering::Acquire);
            if offset == 0 {
                break;
            }
            let entry = self.entry(offset);
            let refs = entry.ref_count.load(Ordering::SeqCst);
            let overdue = grace_ms != 0
                && now.saturating_sub(entry.deleted_at.load(Ordering::SeqCst)) > grace_ms;
            if refs == 0 || overdue {
                link.store(entry.gc_next.load(Ordering::Acquire), Ordering::Release);
                if refs == 0 {
                    reclaimed += 1;
                } else {
                    warn!(
                        "Freeing entry at {} with {} references left after {}s",
                        offset,
                        refs,
                        self.config().gc_ttl
                    );
                    forced += 1;
                }
                self.free_entry(offset);
            } else {
                link = &entry.gc_next;
            }
        }
        (reclaimed, forced)
    }

    /// Removes `offset` from the deferred-free list. Needs the GC lock.
    pub(super) fn unlink_deferred(&self, offset: u64) -> bool {
        let header = self.header();
        let _writable = self.arena().unprotected();
        let mut link: &AtomicU64 = &header.gc_head;
        loop {
            let current = link.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            let entry = self.entry(current);
            if current == offset {
                link.store(entry.gc_next.load(Ordering::Acquire), Ordering::Release);
                return true;
            }
            link = &entry.gc_next;
        }
    }
}
