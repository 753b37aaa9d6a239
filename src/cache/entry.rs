//! Cache Entry Module
//!
//! The header every cached entry carries in the arena, directly in front of
//! its key and value bytes (all three live in the entry's own pool).
//!
//! An entry moves through `Live -> LogicallyDeleted -> Freed` and never
//! back. Only the first transition happens under the shard lock; the second
//! is won by whoever observes a zero reference count first.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cache::value::ValueTag;

// == Entry State ==
/// Lifecycle of an entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Reachable from the index
    Live = 1,
    /// Unlinked, waiting for its readers to drain
    LogicallyDeleted = 2,
    /// Storage returned to the arena
    Freed = 3,
}

impl EntryState {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(EntryState::Live),
            2 => Some(EntryState::LogicallyDeleted),
            3 => Some(EntryState::Freed),
            _ => None,
        }
    }
}

// == Entry Handle ==
/// Cross-process reference to an entry: its arena offset plus the
/// generation it had when the reference was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    pub offset: u64,
    pub generation: u64,
}

// == Entry Header ==
#[repr(C)]
pub(crate) struct EntryHeader {
    /// Next entry in the bucket chain
    pub next: AtomicU64,
    /// Next entry on the deferred-free list
    pub gc_next: AtomicU64,
    pub state: AtomicU32,
    pub ref_count: AtomicU32,
    /// Zeroed when the storage is freed
    pub generation: AtomicU64,
    pub hash: u64,
    pub key_off: u64,
    pub value_off: u64,
    pub pool_head: u64,
    pub mem_size: u64,
    pub created_at: u64,
    /// Effective TTL in seconds, 0 = never expires
    pub ttl: u32,
    pub key_len: u32,
    pub value_len: u32,
    pub value_tag: u8,
    _pad: [u8; 3],
    pub modified_at: AtomicU64,
    pub accessed_at: AtomicU64,
    pub deleted_at: AtomicU64,
    pub hits: AtomicU64,
}

/// Where an entry's pieces were placed in its pool.
pub(crate) struct EntryLayout {
    pub hash: u64,
    pub generation: u64,
    pub key_off: u64,
    pub key_len: usize,
    pub value_off: u64,
    pub value_len: usize,
    pub value_tag: ValueTag,
    pub pool_head: u64,
    pub mem_size: u64,
    pub ttl: u32,
    pub now: u64,
}

impl EntryHeader {
    pub(crate) fn new(layout: EntryLayout) -> Self {
        Self {
            next: AtomicU64::new(0),
            gc_next: AtomicU64::new(0),
            state: AtomicU32::new(EntryState::Live as u32),
            ref_count: AtomicU32::new(0),
            generation: AtomicU64::new(layout.generation),
            hash: layout.hash,
            key_off: layout.key_off,
            value_off: layout.value_off,
            pool_head: layout.pool_head,
            mem_size: layout.mem_size,
            created_at: layout.now,
            ttl: layout.ttl,
            key_len: layout.key_len as u32,
            value_len: layout.value_len as u32,
            value_tag: layout.value_tag as u8,
            _pad: [0; 3],
            modified_at: AtomicU64::new(layout.now),
            accessed_at: AtomicU64::new(layout.now),
            deleted_at: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> Option<EntryState> {
        EntryState::from_u32(self.state.load(Ordering::SeqCst))
    }

    pub fn is_live(&self) -> bool {
        self.state() == Some(EntryState::Live)
    }

    /// `Live -> LogicallyDeleted`. False if the entry was already retired.
    pub fn retire(&self, now: u64) -> bool {
        let won = self
            .state
            .compare_exchange(
                EntryState::Live as u32,
                EntryState::LogicallyDeleted as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.deleted_at.store(now, Ordering::SeqCst);
        }
        won
    }

    /// `LogicallyDeleted -> Freed`. Exactly one caller wins.
    pub fn mark_freed(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                EntryState::LogicallyDeleted as u32,
                EntryState::Freed as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.generation.store(0, Ordering::SeqCst);
        }
        won
    }

    /// An entry with a non-zero TTL is expired once strictly more than
    /// `ttl` seconds have passed since it was created.
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(self.created_at, self.ttl, now)
    }

    pub fn value_tag(&self) -> Option<ValueTag> {
        ValueTag::from_u8(self.value_tag)
    }

    pub fn handle(&self, offset: u64) -> EntryHandle {
        EntryHandle {
            offset,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }
}

/// Expiry rule shared by entries and tests.
pub(crate) fn is_expired(created_at: u64, ttl: u32, now: u64) -> bool {
    ttl != 0 && now.saturating_sub(created_at) > u64::from(ttl) * 1000
}
