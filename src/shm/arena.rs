//! Shared Arena Module
//!
//! A fixed-size memory region mapped `MAP_SHARED` into every cooperating
//! process. Nothing inside the arena stores a virtual address: every
//! reference is a byte offset from the arena base, so processes may map the
//! region wherever their kernel puts it.
//!
//! ```text
//! ┌──────────────┬────────────────────┬───────────────┬─────────┬─────────┬───┐
//! │ ArenaHeader  │ SegmentHeader × n  │ control area  │ seg 0   │ seg 1   │ … │
//! └──────────────┴────────────────────┴───────────────┴─────────┴─────────┴───┘
//!  control pages (always writable)                     data pages (protectable)
//! ```

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use rustix::shm::{Mode, ShmOFlags};
use tracing::{debug, error, info};

use crate::error::{CacheError, Result};
use crate::shm::lock::SharedLock;
use crate::shm::sma::SegmentHeader;

/// "SHMCACHE" in ASCII.
const ARENA_MAGIC: u64 = 0x5348_4D43_4143_4845;
const ARENA_VERSION: u32 = 1;

const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

const HEADER_ALIGN: usize = 64;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const ATTACH_POLL: Duration = Duration::from_millis(2);

// == Arena Header ==
#[repr(C)]
pub(crate) struct ArenaHeader {
    magic: u64,
    version: u32,
    segment_count: u32,
    segment_size: u64,
    data_offset: u64,
    control_offset: u64,
    control_size: u64,
    total_size: u64,
    state: AtomicU32,
    attached: AtomicU32,
    next_token: AtomicU64,
    pub(crate) next_segment: AtomicU32,
    _reserved: u32,
}

enum HeaderCheck {
    /// The creator has not finished yet
    Pending(String),
    /// The region holds something other than an arena
    Foreign(String),
}

impl ArenaHeader {
    fn check(&self, mapped: usize) -> std::result::Result<(), HeaderCheck> {
        if self.state.load(Ordering::Acquire) != STATE_READY {
            return Err(HeaderCheck::Pending("arena was never marked ready".into()));
        }
        if self.magic != ARENA_MAGIC || self.version != ARENA_VERSION {
            return Err(HeaderCheck::Foreign("magic or version mismatch".into()));
        }
        if self.total_size as usize != mapped {
            return Err(HeaderCheck::Pending(format!(
                "size mismatch: header {} mapping {}",
                self.total_size, mapped
            )));
        }
        Ok(())
    }
}

// == Arena Options ==
/// Geometry of a new arena.
#[derive(Debug, Clone)]
pub struct ArenaOptions {
    /// Bytes available to the segment allocator
    pub size: u64,
    /// Number of equally sized segments
    pub segments: u32,
    /// Bytes reserved in the always-writable control area
    pub control_bytes: usize,
    /// Keep the data pages read-only outside mutations
    pub protect: bool,
}

struct Layout {
    segment_headers: usize,
    control_offset: usize,
    data_offset: usize,
    segment_size: usize,
    total: usize,
}

impl ArenaOptions {
    fn layout(&self) -> Result<Layout> {
        if self.segments == 0 {
            return Err(CacheError::Config("arena needs at least one segment".into()));
        }
        let page = rustix::param::page_size();
        let segments = self.segments as usize;
        let segment_headers = align_up(size_of::<ArenaHeader>(), HEADER_ALIGN);
        let control_offset = align_up(
            segment_headers + segments * size_of::<SegmentHeader>(),
            HEADER_ALIGN,
        );
        let data_offset = align_up(control_offset + self.control_bytes, page);
        let segment_size = (self.size as usize / segments) / page * page;
        if segment_size == 0 {
            return Err(CacheError::Config(format!(
                "arena size {} is too small for {} segments",
                self.size, self.segments
            )));
        }
        let total = segment_size
            .checked_mul(segments)
            .and_then(|data| data.checked_add(data_offset))
            .ok_or_else(|| CacheError::Config("arena size overflow".into()))?;
        Ok(Layout {
            segment_headers,
            control_offset,
            data_offset,
            segment_size,
            total,
        })
    }
}

// == Arena ==
/// One process's mapping of the shared arena.
///
/// Dropping the arena unmaps it. The last mapping to go away also unlinks
/// a named arena, so the next process to open the name starts a fresh one.
/// A process that dies without dropping its mapping keeps the name alive.
pub struct Arena {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    control_offset: usize,
    data_offset: usize,
    segment_headers: usize,
    segment_count: usize,
    segment_size: usize,
    /// This process's handles on the segment locks.
    segment_locks: Vec<SharedLock>,
    name: Option<String>,
    owner: bool,
    protect: bool,
    /// Nesting depth of writable scopes in this process.
    writers: Mutex<usize>,
}

impl Arena {
    // == Constructors ==
    /// Creates an arena backed by an anonymous memfd.
    ///
    /// Other processes can attach through [`Arena::attach_fd`] after
    /// receiving the descriptor.
    pub fn anonymous(options: &ArenaOptions) -> Result<Self> {
        let layout = options.layout()?;
        let fd = rustix::fs::memfd_create("shmcache-arena", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, layout.total as u64)?;
        let arena = Self::map_new(fd, None, options, layout)?;
        debug!("Created anonymous arena of {} bytes", arena.len);
        Ok(arena)
    }

    /// Creates a named POSIX shared memory arena. Fails with `EEXIST` if the
    /// name is taken.
    pub fn create(name: &str, options: &ArenaOptions) -> Result<Self> {
        let layout = options.layout()?;
        let fd = rustix::shm::shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;
        if let Err(e) = rustix::fs::ftruncate(&fd, layout.total as u64) {
            let _ = rustix::shm::shm_unlink(name);
            return Err(e.into());
        }
        let arena = Self::map_new(fd, Some(name.to_string()), options, layout)?;
        info!(
            "Created shared arena {} ({} segments x {} bytes)",
            name, arena.segment_count, arena.segment_size
        );
        Ok(arena)
    }

    /// Attaches to a named arena created by another process.
    pub fn attach(name: &str, protect: bool) -> Result<Self> {
        let fd = rustix::shm::shm_open(name, ShmOFlags::RDWR, Mode::empty())?;
        let arena = Self::map_existing(fd, Some(name.to_string()), protect)?;
        info!("Attached to shared arena {}", name);
        Ok(arena)
    }

    /// Attaches to an arena through a descriptor passed from another process.
    pub fn attach_fd(fd: OwnedFd, protect: bool) -> Result<Self> {
        Self::map_existing(fd, None, protect)
    }

    /// Creates the named arena, or attaches if another process got there first.
    pub fn open_or_create(name: &str, options: &ArenaOptions) -> Result<Self> {
        match Self::create(name, options) {
            Ok(arena) => Ok(arena),
            Err(CacheError::System(Errno::EXIST)) => Self::attach(name, options.protect),
            Err(e) => Err(e),
        }
    }

    fn map_new(
        fd: OwnedFd,
        name: Option<String>,
        options: &ArenaOptions,
        layout: Layout,
    ) -> Result<Self> {
        let base = map(&fd, layout.total)?;
        let mut arena = Self {
            fd,
            base,
            len: layout.total,
            control_offset: layout.control_offset,
            data_offset: layout.data_offset,
            segment_headers: layout.segment_headers,
            segment_count: options.segments as usize,
            segment_size: layout.segment_size,
            segment_locks: Vec::new(),
            owner: name.is_some(),
            name,
            protect: options.protect,
            writers: Mutex::new(0),
        };

        // SAFETY: the mapping is fresh and zero-filled, nobody else sees it
        // until the state below becomes READY.
        unsafe {
            std::ptr::write(
                arena.base.as_ptr() as *mut ArenaHeader,
                ArenaHeader {
                    magic: ARENA_MAGIC,
                    version: ARENA_VERSION,
                    segment_count: options.segments,
                    segment_size: layout.segment_size as u64,
                    data_offset: layout.data_offset as u64,
                    control_offset: layout.control_offset as u64,
                    control_size: options.control_bytes as u64,
                    total_size: layout.total as u64,
                    state: AtomicU32::new(STATE_INITIALIZING),
                    attached: AtomicU32::new(1),
                    next_token: AtomicU64::new(1),
                    next_segment: AtomicU32::new(0),
                    _reserved: 0,
                },
            );
        }
        arena.segment_locks = arena.create_segment_locks()?;
        arena.format_segments();
        arena.apply_protection(false);
        Ok(arena)
    }

    fn map_existing(fd: OwnedFd, name: Option<String>, protect: bool) -> Result<Self> {
        Self::map_when_ready(fd, name, protect, ATTACH_TIMEOUT)
    }

    /// Maps the region once its creator has sized it and marked it ready.
    ///
    /// A creator may still be between `shm_open` and `ftruncate`, or still
    /// formatting the header, so both are polled until `timeout`. The
    /// region is remapped on every poll in case its size changed.
    fn map_when_ready(
        fd: OwnedFd,
        name: Option<String>,
        protect: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            let len = rustix::fs::fstat(&fd)?.st_size as usize;
            let pending = if len < size_of::<ArenaHeader>() {
                format!("region of {} bytes is too small", len)
            } else {
                let base = map(&fd, len)?;
                // SAFETY: the mapping is at least one header long.
                let header = unsafe { &*(base.as_ptr() as *const ArenaHeader) };
                match header.check(len) {
                    Ok(()) => return Self::adopt(fd, base, len, name, protect),
                    Err(HeaderCheck::Foreign(reason)) => {
                        unmap(base, len);
                        return Err(CacheError::InvalidArena(reason));
                    }
                    Err(HeaderCheck::Pending(reason)) => {
                        unmap(base, len);
                        reason
                    }
                }
            };
            if Instant::now() >= deadline {
                return Err(CacheError::InvalidArena(pending));
            }
            std::thread::sleep(ATTACH_POLL);
        }
    }

    fn adopt(
        fd: OwnedFd,
        base: NonNull<u8>,
        len: usize,
        name: Option<String>,
        protect: bool,
    ) -> Result<Self> {
        // SAFETY: checked by map_when_ready.
        let header = unsafe { &*(base.as_ptr() as *const ArenaHeader) };
        header.attached.fetch_add(1, Ordering::AcqRel);

        let mut arena = Self {
            fd,
            base,
            len,
            control_offset: header.control_offset as usize,
            data_offset: header.data_offset as usize,
            segment_headers: align_up(size_of::<ArenaHeader>(), HEADER_ALIGN),
            segment_count: header.segment_count as usize,
            segment_size: header.segment_size as usize,
            segment_locks: Vec::new(),
            name,
            owner: false,
            protect,
            writers: Mutex::new(0),
        };
        arena.segment_locks = arena.open_segment_locks()?;
        arena.apply_protection(false);
        Ok(arena)
    }

    // == Lifecycle ==
    /// Publishes the arena to attaching processes.
    pub fn mark_ready(&self) {
        self.header().state.store(STATE_READY, Ordering::Release);
    }

    /// Returns true once the creator finished initialization.
    pub fn is_ready(&self) -> bool {
        self.header().state.load(Ordering::Acquire) == STATE_READY
    }

    /// Hands out a token unique among all processes attached to this arena.
    pub fn next_token(&self) -> u64 {
        self.header().next_token.fetch_add(1, Ordering::AcqRel)
    }

    // == Accessors ==
    /// Total mapped bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; arenas have at least one segment.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True for the process that created a named arena.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Number of live mappings across all processes.
    pub fn attached(&self) -> u32 {
        self.header().attached.load(Ordering::Acquire)
    }

    /// Descriptor for passing the arena to another process.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Bytes reserved for the control area when the arena was created.
    pub fn control_size(&self) -> usize {
        self.header().control_size as usize
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        // SAFETY: offset 0 always holds the header.
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    pub(crate) fn control_ptr(&self) -> *mut u8 {
        self.ptr(self.control_offset as u64)
    }

    pub(crate) fn segment_header(&self, index: usize) -> &SegmentHeader {
        assert!(index < self.segment_count, "segment {} out of range", index);
        let offset = self.segment_headers + index * size_of::<SegmentHeader>();
        // SAFETY: segment headers are laid out contiguously after the arena header.
        unsafe { &*(self.ptr(offset as u64) as *const SegmentHeader) }
    }

    pub(crate) fn segment_lock(&self, index: usize) -> &SharedLock {
        &self.segment_locks[index]
    }

    pub(crate) fn data_offset(&self) -> u64 {
        self.data_offset as u64
    }

    /// Translates an arena offset into a pointer in this process.
    pub(crate) fn ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.len, "offset {} out of range", offset);
        // SAFETY: callers pass offsets inside the mapping.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// Reinterprets the bytes at `offset` as a `T`.
    ///
    /// # Safety
    /// The offset must point at a properly aligned, initialized `T` that
    /// lives entirely inside the mapping.
    pub(crate) unsafe fn at<T>(&self, offset: u64) -> &T {
        &*(self.ptr(offset) as *const T)
    }

    // == Protection ==
    /// Opens a scope during which the data pages are writable.
    ///
    /// Scopes nest and are counted per process; the pages go back to
    /// read-only when the outermost scope closes. Without protection this
    /// is free.
    pub fn unprotected(&self) -> Unprotected<'_> {
        self.unprotect();
        Unprotected { arena: self }
    }

    pub(crate) fn unprotect(&self) {
        if !self.protect {
            return;
        }
        let mut depth = self.writers.lock();
        if *depth == 0 {
            self.apply_protection(true);
        }
        *depth += 1;
    }

    pub(crate) fn protect(&self) {
        if !self.protect {
            return;
        }
        let mut depth = self.writers.lock();
        assert!(*depth > 0, "arena protect without matching unprotect");
        *depth -= 1;
        if *depth == 0 {
            self.apply_protection(false);
        }
    }

    fn apply_protection(&self, writable: bool) {
        if !self.protect {
            return;
        }
        let flags = if writable {
            MprotectFlags::READ | MprotectFlags::WRITE
        } else {
            MprotectFlags::READ
        };
        // SAFETY: the data pages are page aligned and inside our mapping.
        let result = unsafe {
            rustix::mm::mprotect(
                self.ptr(self.data_offset as u64).cast(),
                self.len - self.data_offset,
                flags,
            )
        };
        if let Err(e) = result {
            error!("mprotect on arena data pages failed: {}", e);
            panic!("unable to change arena page protection: {}", e);
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let last = self.header().attached.fetch_sub(1, Ordering::AcqRel) == 1;
        self.segment_locks.clear();
        unmap(self.base, self.len);
        if let (true, Some(name)) = (last, self.name.as_deref()) {
            match rustix::shm::shm_unlink(name) {
                Ok(()) => info!("Unlinked shared arena {}", name),
                Err(e) => debug!("shm_unlink {} failed: {}", name, e),
            }
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("segments", &self.segment_count)
            .field("segment_size", &self.segment_size)
            .field("owner", &self.owner)
            .finish()
    }
}

// SAFETY: Arena is Send + Sync because:
// - everything shared lives behind atomics or process-shared locks
// - the protection depth is guarded by a process-local mutex
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

// == Scoped Writability ==
/// Keeps the arena data pages writable while alive.
#[must_use]
pub struct Unprotected<'a> {
    arena: &'a Arena,
}

impl Drop for Unprotected<'_> {
    fn drop(&mut self) {
        self.arena.protect();
    }
}

// == Helpers ==
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of a descriptor we own.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| CacheError::InvalidArena("mmap returned null".into()))
}

fn unmap(base: NonNull<u8>, len: usize) {
    // SAFETY: callers pass a mapping created by `map` and drop every
    // reference into it first.
    unsafe {
        let _ = rustix::mm::munmap(base.as_ptr().cast(), len);
    }
}
