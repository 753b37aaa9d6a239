//! Slam Defense Module
//!
//! When a hot key expires, every worker that misses on it starts rebuilding
//! the value. Each lock shard keeps a small table of "last missing key"
//! markers so that only the first rebuilder's insert is accepted within the
//! guard window; the others are told to skip.
//!
//! A table is guarded by its shard's slam lock, which callers pass in.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::shm::SharedLock;

/// Markers per lock shard.
pub(crate) const SLAM_SLOTS: usize = 16;

/// The caller-side view of a marker check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlamQuery {
    pub hash: u64,
    pub key_len: u64,
    pub owner: u64,
    pub now: u64,
    pub window_ms: u64,
}

#[repr(C)]
struct SlamMarker {
    hash: AtomicU64,
    key_len: AtomicU64,
    /// Time the owner claimed the key, 0 = unused
    stamp: AtomicU64,
    owner: AtomicU64,
}

impl SlamMarker {
    fn new() -> Self {
        Self {
            hash: AtomicU64::new(0),
            key_len: AtomicU64::new(0),
            stamp: AtomicU64::new(0),
            owner: AtomicU64::new(0),
        }
    }

    /// True when someone other than the asker claimed this key recently.
    fn guards(&self, query: &SlamQuery) -> bool {
        let stamp = self.stamp.load(Ordering::Acquire);
        stamp != 0
            && self.hash.load(Ordering::Relaxed) == query.hash
            && self.key_len.load(Ordering::Relaxed) == query.key_len
            && self.owner.load(Ordering::Relaxed) != query.owner
            && query.now.saturating_sub(stamp) < query.window_ms
    }

    fn claim(&self, query: &SlamQuery) {
        self.hash.store(query.hash, Ordering::Relaxed);
        self.key_len.store(query.key_len, Ordering::Relaxed);
        self.owner.store(query.owner, Ordering::Relaxed);
        self.stamp.store(query.now.max(1), Ordering::Release);
    }

    fn reset(&self) {
        self.stamp.store(0, Ordering::Release);
    }
}

// == Slam Table ==
#[repr(C)]
pub(crate) struct SlamTable {
    markers: [SlamMarker; SLAM_SLOTS],
}

impl SlamTable {
    pub fn new() -> Self {
        Self {
            markers: std::array::from_fn(|_| SlamMarker::new()),
        }
    }

    /// Non-claiming check, used before any memory is spent on an insert.
    pub fn is_guarded(&self, lock: &SharedLock, query: &SlamQuery) -> bool {
        let _lock = lock.read();
        self.slot(query.hash).guards(query)
    }

    /// Records a miss. The first caller to miss becomes the rebuilder.
    pub fn note_miss(&self, lock: &SharedLock, query: &SlamQuery) {
        let _lock = lock.write();
        let marker = self.slot(query.hash);
        if !marker.guards(query) {
            marker.claim(query);
        }
    }

    /// Insert-time decision: false if another caller owns the rebuild,
    /// otherwise the caller (re)claims the key and may insert.
    pub fn admit(&self, lock: &SharedLock, query: &SlamQuery) -> bool {
        let _lock = lock.write();
        let marker = self.slot(query.hash);
        if marker.guards(query) {
            return false;
        }
        marker.claim(query);
        true
    }

    pub fn reset(&self, lock: &SharedLock) {
        let _lock = lock.write();
        self.markers.iter().for_each(SlamMarker::reset);
    }

    fn slot(&self, hash: u64) -> &SlamMarker {
        &self.markers[((hash >> 32) as usize) % SLAM_SLOTS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRwLock;
    use std::time::Duration;

    fn table() -> (SlamTable, Box<ShmRwLock>) {
        (SlamTable::new(), Box::new(ShmRwLock::new()))
    }

    fn lock(cell: &ShmRwLock) -> SharedLock {
        SharedLock::create(cell, "slam", Duration::from_secs(1)).unwrap()
    }

    fn query(owner: u64, now: u64) -> SlamQuery {
        SlamQuery {
            hash: 0xDEAD_BEEF_0000_0001,
            key_len: 3,
            owner,
            now,
            window_ms: 1000,
        }
    }

    #[test]
    fn test_first_rebuilder_wins() {
        let (table, cell) = table();
        let lock = lock(&cell);
        table.note_miss(&lock, &query(1, 10_000));
        table.note_miss(&lock, &query(2, 10_050));

        assert!(table.admit(&lock, &query(1, 10_100)));
        assert!(table.is_guarded(&lock, &query(2, 10_200)));
        assert!(!table.admit(&lock, &query(2, 10_200)));
    }

    #[test]
    fn test_guard_expires_after_window() {
        let (table, cell) = table();
        let lock = lock(&cell);
        table.note_miss(&lock, &query(1, 10_000));
        assert!(!table.admit(&lock, &query(2, 10_999)));
        assert!(table.admit(&lock, &query(2, 11_000)));
        // ownership moved to the second caller
        assert!(!table.admit(&lock, &query(1, 11_001)));
    }

    #[test]
    fn test_other_keys_are_not_guarded() {
        let (table, cell) = table();
        let lock = lock(&cell);
        table.note_miss(&lock, &query(1, 10_000));
        let other = SlamQuery {
            key_len: 4,
            ..query(2, 10_010)
        };
        assert!(table.admit(&lock, &other));
    }

    #[test]
    fn test_reset_clears_markers() {
        let (table, cell) = table();
        let lock = lock(&cell);
        table.note_miss(&lock, &query(1, 10_000));
        table.reset(&lock);
        assert!(table.admit(&lock, &query(2, 10_001)));
    }
}
