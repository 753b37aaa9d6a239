//! Segment Allocator Module
//!
//! Carves the arena's data segments into blocks. Each segment keeps its own
//! lock and an offset-ordered free list; allocation is first fit with
//! splitting, and frees coalesce with both neighbours.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use crate::error::{CacheError, Result};
use crate::shm::arena::Arena;
use crate::shm::lock::{SharedLock, ShmRwLock};

const BLOCK_CANARY: u32 = 0x5AFE_B10C;
const BLOCK_FREE: u32 = 1;
const BLOCK_USED: u32 = 2;

/// Payload alignment of every block.
pub const BLOCK_ALIGN: u64 = 8;
const HEADER_SIZE: u64 = size_of::<BlockHeader>() as u64;
/// Smallest remainder worth splitting off as its own free block.
const MIN_BLOCK: u64 = HEADER_SIZE + 16;
/// Segment sections are short list walks; a holder this late is gone.
const SEGMENT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

// == Segment Header ==
/// Per-segment bookkeeping, stored in the arena's control pages.
#[repr(C)]
pub(crate) struct SegmentHeader {
    lock: ShmRwLock,
    _pad: u32,
    start: AtomicU64,
    size: AtomicU64,
    avail: AtomicU64,
    free_head: AtomicU64,
}

#[repr(C)]
struct BlockHeader {
    size: u64,
    next_free: u64,
    canary: u32,
    flags: u32,
}

// == Info ==
/// One free block as reported by [`Arena::sma_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreeBlock {
    /// Offset from the start of the segment
    pub offset: u64,
    /// Size in bytes including the block header
    pub size: u64,
}

/// Aggregate arena statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SmaInfo {
    pub num_seg: usize,
    pub seg_size: usize,
    pub avail_mem: u64,
    /// Per-segment free lists; omitted for a limited report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_lists: Option<Vec<Vec<FreeBlock>>>,
}

impl Arena {
    // == Locks ==
    /// Initializes every segment lock in place. Creator only.
    pub(crate) fn create_segment_locks(&self) -> Result<Vec<SharedLock>> {
        (0..self.segment_count())
            .map(|i| {
                let cell = &self.segment_header(i).lock;
                SharedLock::create(cell, "segment", SEGMENT_LOCK_TIMEOUT)
            })
            .collect()
    }

    /// Handles on segment locks a creator already initialized.
    pub(crate) fn open_segment_locks(&self) -> Result<Vec<SharedLock>> {
        (0..self.segment_count())
            .map(|i| {
                let cell = &self.segment_header(i).lock;
                SharedLock::open(cell, "segment", SEGMENT_LOCK_TIMEOUT)
            })
            .collect()
    }

    // == Format ==
    /// Turns every segment into a single free block.
    pub(crate) fn format_segments(&self) {
        let size = self.segment_size() as u64;
        for index in 0..self.segment_count() {
            let start = self.data_offset() + index as u64 * size;
            let seg = self.segment_header(index);
            seg.start.store(start, Ordering::Relaxed);
            seg.size.store(size, Ordering::Relaxed);
            seg.avail.store(size, Ordering::Relaxed);
            seg.free_head.store(start, Ordering::Relaxed);
            // SAFETY: start is the first byte of a segment we own exclusively.
            unsafe {
                std::ptr::write(
                    self.ptr(start) as *mut BlockHeader,
                    BlockHeader {
                        size,
                        next_free: 0,
                        canary: BLOCK_CANARY,
                        flags: BLOCK_FREE,
                    },
                );
            }
        }
    }

    // == Allocate ==
    /// Allocates `size` bytes and returns the payload's arena offset.
    ///
    /// Segments are tried round robin starting from a shared cursor.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        let needed = align(size as u64 + HEADER_SIZE).max(MIN_BLOCK);
        let count = self.segment_count();
        let first = self.header().next_segment.fetch_add(1, Ordering::Relaxed) as usize;
        for i in 0..count {
            let index = (first + i) % count;
            if let Some(offset) = self.alloc_in(index, needed) {
                trace!("sma: {} bytes at {} in segment {}", size, offset, index);
                return Ok(offset);
            }
        }
        Err(CacheError::AllocationFailure { requested: size })
    }

    fn alloc_in(&self, index: usize, needed: u64) -> Option<u64> {
        let seg = self.segment_header(index);
        if seg.avail.load(Ordering::Relaxed) < needed {
            return None;
        }
        let _lock = self.segment_lock(index).write();
        let _writable = self.unprotected();

        let mut prev = 0u64;
        let mut cur = seg.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            // SAFETY: free list links point at block headers inside this segment,
            // and the segment lock is held.
            let block = unsafe { &mut *self.block(cur) };
            if block.size >= needed {
                let next = if block.size - needed >= MIN_BLOCK {
                    let rest = cur + needed;
                    // SAFETY: the remainder lies inside the block being split.
                    unsafe {
                        std::ptr::write(
                            self.block(rest),
                            BlockHeader {
                                size: block.size - needed,
                                next_free: block.next_free,
                                canary: BLOCK_CANARY,
                                flags: BLOCK_FREE,
                            },
                        );
                    }
                    block.size = needed;
                    rest
                } else {
                    block.next_free
                };
                self.set_next(seg, prev, next);
                block.next_free = 0;
                block.flags = BLOCK_USED;
                seg.avail.fetch_sub(block.size, Ordering::Relaxed);
                return Some(cur + HEADER_SIZE);
            }
            prev = cur;
            cur = block.next_free;
        }
        None
    }

    // == Free ==
    /// Returns a block obtained from [`Arena::alloc`].
    ///
    /// Panics on a corrupted or already freed block: continuing would hand
    /// the same bytes to two owners in every attached process.
    pub fn free(&self, offset: u64) {
        let block_off = offset - HEADER_SIZE;
        let index = self.segment_of(block_off);
        let seg = self.segment_header(index);

        let _lock = self.segment_lock(index).write();
        let _writable = self.unprotected();

        // SAFETY: offset came from alloc, so a header precedes it.
        let block = unsafe { &mut *self.block(block_off) };
        assert!(
            block.canary == BLOCK_CANARY && block.flags == BLOCK_USED,
            "sma: corrupted or double freed block at offset {}",
            offset
        );
        seg.avail.fetch_add(block.size, Ordering::Relaxed);
        block.flags = BLOCK_FREE;

        // locate neighbours in the offset-ordered free list
        let mut prev = 0u64;
        let mut next = seg.free_head.load(Ordering::Relaxed);
        while next != 0 && next < block_off {
            prev = next;
            // SAFETY: free list link under the segment lock.
            next = unsafe { (*self.block(next)).next_free };
        }

        if next != 0 && block_off + block.size == next {
            // SAFETY: next is a free block header.
            let following = unsafe { &mut *self.block(next) };
            block.size += following.size;
            block.next_free = following.next_free;
            following.canary = 0;
        } else {
            block.next_free = next;
        }

        if prev != 0 {
            // SAFETY: prev is a free block header.
            let preceding = unsafe { &mut *self.block(prev) };
            if prev + preceding.size == block_off {
                preceding.size += block.size;
                preceding.next_free = block.next_free;
                block.canary = 0;
                return;
            }
        }
        self.set_next(seg, prev, block_off);
    }

    // == Introspection ==
    /// Bytes free across all segments.
    pub fn avail(&self) -> u64 {
        (0..self.segment_count())
            .map(|i| self.segment_header(i).avail.load(Ordering::Relaxed))
            .sum()
    }

    /// Reports segment geometry, free memory and (unless `limited`) the
    /// free block list of every segment.
    pub fn sma_info(&self, limited: bool) -> SmaInfo {
        let block_lists = (!limited).then(|| {
            (0..self.segment_count())
                .map(|index| {
                    let seg = self.segment_header(index);
                    let _lock = self.segment_lock(index).read();
                    let start = seg.start.load(Ordering::Relaxed);
                    let mut blocks = Vec::new();
                    let mut cur = seg.free_head.load(Ordering::Relaxed);
                    while cur != 0 {
                        // SAFETY: free list link under the segment lock.
                        let block = unsafe { &*self.block(cur) };
                        blocks.push(FreeBlock {
                            offset: cur - start,
                            size: block.size,
                        });
                        cur = block.next_free;
                    }
                    blocks
                })
                .collect()
        });

        SmaInfo {
            num_seg: self.segment_count(),
            seg_size: self.segment_size(),
            avail_mem: self.avail(),
            block_lists,
        }
    }

    // == Helpers ==
    fn block(&self, offset: u64) -> *mut BlockHeader {
        self.ptr(offset) as *mut BlockHeader
    }

    fn set_next(&self, seg: &SegmentHeader, prev: u64, next: u64) {
        if prev == 0 {
            seg.free_head.store(next, Ordering::Relaxed);
        } else {
            // SAFETY: prev is a free block header and the segment lock is held.
            unsafe { (*self.block(prev)).next_free = next };
        }
    }

    fn segment_of(&self, block_off: u64) -> usize {
        let data = self.data_offset();
        let size = self.segment_size() as u64;
        assert!(
            block_off >= data && block_off < data + size * self.segment_count() as u64,
            "sma: offset {} is outside every segment",
            block_off
        );
        ((block_off - data) / size) as usize
    }
}

fn align(value: u64) -> u64 {
    (value + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::ArenaOptions;

    fn arena(segments: u32) -> Arena {
        Arena::anonymous(&ArenaOptions {
            size: 256 * 1024,
            segments,
            control_bytes: 0,
            protect: false,
        })
        .unwrap()
    }

    #[test]
    fn test_fresh_segment_is_one_block() {
        let arena = arena(1);
        let info = arena.sma_info(false);
        assert_eq!(info.num_seg, 1);
        assert_eq!(info.avail_mem, arena.segment_size() as u64);
        let lists = info.block_lists.unwrap();
        assert_eq!(lists[0], vec![FreeBlock { offset: 0, size: arena.segment_size() as u64 }]);
    }

    #[test]
    fn test_alloc_is_aligned_and_accounted() {
        let arena = arena(1);
        let before = arena.avail();
        let a = arena.alloc(13).unwrap();
        let b = arena.alloc(100).unwrap();
        assert_eq!(a % BLOCK_ALIGN, 0);
        assert_eq!(b % BLOCK_ALIGN, 0);
        assert_ne!(a, b);
        assert!(arena.avail() < before);
    }

    #[test]
    fn test_free_coalesces_back_to_one_block() {
        let arena = arena(1);
        let total = arena.avail();
        let blocks: Vec<u64> = (0..10).map(|i| arena.alloc(64 + i * 8).unwrap()).collect();

        // free out of order so both merge directions are exercised
        for off in blocks.iter().step_by(2) {
            arena.free(*off);
        }
        for off in blocks.iter().skip(1).step_by(2) {
            arena.free(*off);
        }

        assert_eq!(arena.avail(), total);
        let lists = arena.sma_info(false).block_lists.unwrap();
        assert_eq!(lists[0].len(), 1);
    }

    #[test]
    fn test_exhaustion_reports_allocation_failure() {
        let arena = arena(1);
        let too_big = arena.segment_size() + 1;
        assert!(matches!(
            arena.alloc(too_big),
            Err(CacheError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn test_allocations_spread_over_segments() {
        let arena = arena(2);
        let a = arena.alloc(32).unwrap();
        let b = arena.alloc(32).unwrap();
        assert_ne!(arena.segment_of(a), arena.segment_of(b));
    }

    #[test]
    fn test_limited_info_omits_block_lists() {
        let arena = arena(2);
        let info = arena.sma_info(true);
        assert!(info.block_lists.is_none());
        assert_eq!(info.num_seg, 2);
    }

    #[test]
    #[should_panic(expected = "double freed")]
    fn test_double_free_is_fatal() {
        let arena = arena(1);
        let a = arena.alloc(32).unwrap();
        let _b = arena.alloc(32).unwrap();
        arena.free(a);
        arena.free(a);
    }
}
