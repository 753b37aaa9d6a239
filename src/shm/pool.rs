//! Pool Allocator Module
//!
//! A pool is a scoped bump allocator that materializes one value graph.
//! Memory comes in chunks from a [`PoolMemory`] provider: the shared arena
//! for entries being written, or the process heap for copies handed back
//! to a caller. Chunks are chained through their headers using provider
//! links, so an arena pool can later be released by any process from the
//! link of its first chunk alone.

use std::alloc::{self, Layout};
use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::{CacheError, Result};
use crate::shm::arena::Arena;

const CHUNK_ALIGN: usize = 8;
const CHUNK_HEADER: usize = size_of::<ChunkHeader>();

// == Memory Providers ==
/// Raw memory behind a pool.
///
/// A link is whatever the provider uses to name a chunk: an arena offset
/// for shared memory, an address for the heap.
pub trait PoolMemory {
    /// Allocates `size` bytes aligned to 8 and returns their link.
    fn allocate(&self, size: usize) -> Result<u64>;
    /// Frees a chunk of `size` bytes previously returned by `allocate`.
    fn release(&self, link: u64, size: usize);
    /// Translates a link into a pointer in this process.
    fn resolve(&self, link: u64) -> *mut u8;
    /// Makes the memory read-only again.
    fn protect(&self) {}
    /// Makes the memory writable.
    fn unprotect(&self) {}
}

impl PoolMemory for &Arena {
    fn allocate(&self, size: usize) -> Result<u64> {
        self.alloc(size)
    }

    fn release(&self, link: u64, _size: usize) {
        self.free(link);
    }

    fn resolve(&self, link: u64) -> *mut u8 {
        self.ptr(link)
    }

    fn protect(&self) {
        Arena::protect(self);
    }

    fn unprotect(&self) {
        Arena::unprotect(self);
    }
}

/// The calling process's private heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapMemory;

impl PoolMemory for HeapMemory {
    fn allocate(&self, size: usize) -> Result<u64> {
        let layout = Layout::from_size_align(size.max(1), CHUNK_ALIGN)
            .map_err(|_| CacheError::AllocationFailure { requested: size })?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr)
            .map(|p| p.as_ptr() as u64)
            .ok_or(CacheError::AllocationFailure { requested: size })
    }

    fn release(&self, link: u64, size: usize) {
        // SAFETY: link and size come from a matching allocate call.
        unsafe {
            alloc::dealloc(
                link as *mut u8,
                Layout::from_size_align_unchecked(size.max(1), CHUNK_ALIGN),
            )
        }
    }

    fn resolve(&self, link: u64) -> *mut u8 {
        link as *mut u8
    }
}

// == Pool Kind ==
/// Chunk sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// 512 byte chunks
    Small,
    /// 4 KiB chunks
    Medium,
    /// 8 KiB chunks
    Large,
    /// One exact-size chunk per allocation
    Unpooled,
}

impl PoolKind {
    /// Smallest chunked kind that holds `size` bytes in one chunk.
    pub fn fitting(size: usize) -> Self {
        [PoolKind::Small, PoolKind::Medium, PoolKind::Large]
            .into_iter()
            .find(|kind| kind.chunk_size().is_some_and(|chunk| size + CHUNK_HEADER <= chunk))
            .unwrap_or(PoolKind::Unpooled)
    }

    fn chunk_size(self) -> Option<usize> {
        match self {
            PoolKind::Small => Some(512),
            PoolKind::Medium => Some(4096),
            PoolKind::Large => Some(8192),
            PoolKind::Unpooled => None,
        }
    }
}

#[repr(C)]
struct ChunkHeader {
    next: u64,
    size: u64,
    used: u64,
}

// == Pool Handle ==
/// A committed pool: the link of its first chunk plus its footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHandle {
    pub head: u64,
    pub size: u64,
}

impl PoolHandle {
    /// Releases every chunk of a committed pool.
    pub fn destroy<M: PoolMemory>(self, memory: &M) {
        memory.unprotect();
        release_chain(memory, self.head);
        memory.protect();
    }
}

// == Pool ==
/// Scoped allocation context for one value graph.
///
/// Dropping an uncommitted pool frees everything it allocated, which is how
/// a failed insert unwinds. [`Pool::commit`] hands ownership of the chunks
/// to whoever keeps the returned [`PoolHandle`].
pub struct Pool<M: PoolMemory> {
    memory: M,
    kind: PoolKind,
    head: u64,
    tail: u64,
    size: usize,
    committed: bool,
}

impl<M: PoolMemory> Pool<M> {
    // == Create ==
    /// Opens a pool. The provider stays writable until the pool is
    /// committed or dropped.
    pub fn create(memory: M, kind: PoolKind) -> Self {
        memory.unprotect();
        Self {
            memory,
            kind,
            head: 0,
            tail: 0,
            size: 0,
            committed: false,
        }
    }

    // == Allocate ==
    /// Bump-allocates `size` bytes aligned to 8 and returns their link.
    pub fn alloc(&mut self, size: usize) -> Result<u64> {
        let size = align(size.max(1));
        let tail = self.tail;
        if tail != 0 {
            let chunk = self.chunk(tail);
            if (chunk.size - chunk.used) as usize >= size {
                let link = tail + chunk.used;
                chunk.used += size as u64;
                return Ok(link);
            }
        }

        let chunk_size = match self.kind.chunk_size() {
            Some(min) => min.max(size + CHUNK_HEADER),
            None => size + CHUNK_HEADER,
        };
        let link = self.memory.allocate(chunk_size)?;
        // SAFETY: the provider returned chunk_size writable, 8-aligned bytes.
        unsafe {
            std::ptr::write(
                self.memory.resolve(link) as *mut ChunkHeader,
                ChunkHeader {
                    next: 0,
                    size: chunk_size as u64,
                    used: (CHUNK_HEADER + size) as u64,
                },
            );
        }
        if tail == 0 {
            self.head = link;
        } else {
            self.chunk(tail).next = link;
        }
        self.tail = link;
        self.size += chunk_size;
        Ok(link + CHUNK_HEADER as u64)
    }

    /// Allocates and fills a copy of `bytes`.
    pub fn copy_in(&mut self, bytes: &[u8]) -> Result<u64> {
        let link = self.alloc(bytes.len())?;
        // SAFETY: alloc reserved at least bytes.len() bytes at link.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(link), bytes.len());
        }
        Ok(link)
    }

    /// Pointer to memory previously allocated from this pool.
    pub fn ptr(&self, link: u64) -> *mut u8 {
        self.memory.resolve(link)
    }

    /// Borrow of `len` bytes at `link`.
    ///
    /// # Safety
    /// `link..link + len` must lie inside one allocation of this pool.
    pub unsafe fn slice(&self, link: u64, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr(link), len)
    }

    /// Link of the first chunk, 0 before the first allocation.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Total bytes taken from the provider.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    // == Commit / Destroy ==
    /// Keeps the chunks alive past the pool and returns their handle.
    pub fn commit(mut self) -> PoolHandle {
        self.committed = true;
        PoolHandle {
            head: self.head,
            size: self.size as u64,
        }
    }

    /// Frees everything allocated so far.
    pub fn destroy(self) {
        drop(self);
    }

    fn chunk(&mut self, link: u64) -> &mut ChunkHeader {
        // SAFETY: link names a chunk of this pool, which starts with a header.
        unsafe { &mut *(self.memory.resolve(link) as *mut ChunkHeader) }
    }
}

impl<M: PoolMemory> Drop for Pool<M> {
    fn drop(&mut self) {
        if !self.committed {
            release_chain(&self.memory, self.head);
        }
        self.memory.protect();
    }
}

fn release_chain<M: PoolMemory>(memory: &M, head: u64) {
    let mut link = head;
    while link != 0 {
        // SAFETY: every link in the chain names a chunk with a valid header.
        let (next, size) = unsafe {
            let chunk = &*(memory.resolve(link) as *const ChunkHeader);
            (chunk.next, chunk.size)
        };
        memory.release(link, size as usize);
        link = next;
    }
}

fn align(value: usize) -> usize {
    (value + CHUNK_ALIGN - 1) / CHUNK_ALIGN * CHUNK_ALIGN
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::arena::ArenaOptions;

    fn arena() -> Arena {
        Arena::anonymous(&ArenaOptions {
            size: 256 * 1024,
            segments: 1,
            control_bytes: 0,
            protect: false,
        })
        .unwrap()
    }

    #[test]
    fn test_heap_pool_copy_in() {
        let mut pool = Pool::create(HeapMemory, PoolKind::Unpooled);
        let link = pool.copy_in(b"hello").unwrap();
        assert_eq!(unsafe { pool.slice(link, 5) }, b"hello");
        assert_eq!(pool.size(), CHUNK_HEADER + 8);
    }

    #[test]
    fn test_small_pool_bumps_within_chunk() {
        let arena = arena();
        let mut pool = Pool::create(&arena, PoolKind::Small);
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(10).unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(pool.size(), 512);
    }

    #[test]
    fn test_pool_grows_new_chunks() {
        let arena = arena();
        let mut pool = Pool::create(&arena, PoolKind::Small);
        pool.alloc(400).unwrap();
        pool.alloc(400).unwrap();
        pool.alloc(2000).unwrap();
        assert_eq!(pool.size(), 512 + 512 + 2000 + CHUNK_HEADER);
    }

    #[test]
    fn test_dropped_pool_returns_arena_memory() {
        let arena = arena();
        let before = arena.avail();
        {
            let mut pool = Pool::create(&arena, PoolKind::Small);
            pool.alloc(100).unwrap();
            pool.alloc(1000).unwrap();
            assert!(arena.avail() < before);
        }
        assert_eq!(arena.avail(), before);
    }

    #[test]
    fn test_committed_pool_survives_until_destroyed() {
        let arena = arena();
        let before = arena.avail();
        let handle = {
            let mut pool = Pool::create(&arena, PoolKind::Small);
            pool.copy_in(b"persisted").unwrap();
            pool.commit()
        };
        assert!(arena.avail() < before);
        assert_eq!(handle.size, 512);

        handle.destroy(&&arena);
        assert_eq!(arena.avail(), before);
    }

    #[test]
    fn test_failed_allocation_keeps_earlier_chunks_releasable() {
        let arena = arena();
        let before = arena.avail();
        {
            let mut pool = Pool::create(&arena, PoolKind::Small);
            pool.alloc(64).unwrap();
            let huge = arena.segment_size() * 2;
            assert!(matches!(
                pool.alloc(huge),
                Err(CacheError::AllocationFailure { .. })
            ));
        }
        assert_eq!(arena.avail(), before);
    }

    #[test]
    fn test_fitting_kind() {
        assert_eq!(PoolKind::fitting(100), PoolKind::Small);
        assert_eq!(PoolKind::fitting(512), PoolKind::Medium);
        assert_eq!(PoolKind::fitting(8000), PoolKind::Large);
        assert_eq!(PoolKind::fitting(9000), PoolKind::Unpooled);
    }
}
