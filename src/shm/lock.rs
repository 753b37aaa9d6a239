//! Cross-Process Lock Module
//!
//! Reader/writer locks shared by every process attached to an arena. The
//! lock word itself is a process-shared pthread rwlock placed in a
//! [`ShmRwLock`] cell inside the mapping; each process reaches it through
//! its own [`SharedLock`] handle, initialized in place by the creator and
//! reopened by attachers.
//!
//! Every acquisition is bounded. A lock still held after the timeout means
//! its holder died inside a critical section, and the shared state it
//! guarded can no longer be trusted, so the waiter panics instead of hanging.

use std::cell::UnsafeCell;
use std::fmt::Display;
use std::time::Duration;

use raw_sync::locks::{LockGuard, LockImpl, LockInit, ReadLockGuard, RwLock};
use raw_sync::Timeout;
use tracing::error;

use crate::error::{CacheError, Result};

/// Bytes reserved for one lock inside the arena.
const LOCK_BYTES: usize = 64;

// == Shared Cell ==
/// Storage for one process-shared lock. Zeroed until a creator initializes
/// it through [`SharedLock::create`].
#[repr(C, align(64))]
pub struct ShmRwLock {
    raw: UnsafeCell<[u8; LOCK_BYTES]>,
}

impl ShmRwLock {
    pub const fn new() -> Self {
        Self {
            raw: UnsafeCell::new([0; LOCK_BYTES]),
        }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.raw.get().cast()
    }
}

impl Default for ShmRwLock {
    fn default() -> Self {
        Self::new()
    }
}

// == Process Handle ==
/// This process's handle on a [`ShmRwLock`].
///
/// The handle must not outlive the mapping that holds the cell.
pub struct SharedLock {
    raw: Box<dyn LockImpl>,
    name: &'static str,
    timeout: Duration,
}

impl SharedLock {
    /// Initializes the cell in place. Only valid while no other process can
    /// reach it.
    pub fn create(cell: &ShmRwLock, name: &'static str, timeout: Duration) -> Result<Self> {
        check_fits(cell)?;
        // SAFETY: the cell is LOCK_BYTES of 64-aligned memory that outlives
        // the handle, and nobody else is using it yet.
        let (raw, _) = unsafe { RwLock::new(cell.as_mut_ptr(), std::ptr::null_mut()) }
            .map_err(|e| lock_error(name, "initialize", e))?;
        Ok(Self { raw, name, timeout })
    }

    /// Reopens a cell another process already initialized.
    pub fn open(cell: &ShmRwLock, name: &'static str, timeout: Duration) -> Result<Self> {
        check_fits(cell)?;
        // SAFETY: the creator initialized this cell before publishing the arena.
        let (raw, _) =
            unsafe { RwLock::from_existing(cell.as_mut_ptr(), std::ptr::null_mut()) }
                .map_err(|e| lock_error(name, "reopen", e))?;
        Ok(Self { raw, name, timeout })
    }

    /// Acquires the lock in shared mode.
    ///
    /// # Panics
    /// If the lock is not granted within the timeout.
    pub fn read(&self) -> ShmReadGuard<'_> {
        match self.raw.try_rlock(Timeout::Val(self.timeout)) {
            Ok(guard) => ShmReadGuard { _guard: guard },
            Err(e) => self.abandoned("read", e),
        }
    }

    /// Acquires the lock in exclusive mode.
    ///
    /// # Panics
    /// If the lock is not granted within the timeout.
    pub fn write(&self) -> ShmWriteGuard<'_> {
        match self.raw.try_lock(Timeout::Val(self.timeout)) {
            Ok(guard) => ShmWriteGuard { _guard: guard },
            Err(e) => self.abandoned("write", e),
        }
    }

    /// Takes the exclusive lock only if it is free right now.
    pub fn try_write(&self) -> Option<ShmWriteGuard<'_>> {
        self.raw
            .try_lock(Timeout::Val(Duration::ZERO))
            .ok()
            .map(|guard| ShmWriteGuard { _guard: guard })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn abandoned(&self, mode: &str, e: impl Display) -> ! {
        error!(
            "{} lock not granted for {} within {:?}: {}",
            self.name, mode, self.timeout, e
        );
        panic!(
            "{} lock held for more than {:?}, its holder is presumed dead",
            self.name, self.timeout
        );
    }
}

impl std::fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLock")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// SAFETY: the pthread rwlock behind the handle is built for concurrent use
// from any thread, and the handle's data pointer is never touched.
unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

// == Guards ==
/// Shared access, released on drop.
#[must_use]
pub struct ShmReadGuard<'a> {
    _guard: ReadLockGuard<'a>,
}

/// Exclusive access, released on drop.
#[must_use]
pub struct ShmWriteGuard<'a> {
    _guard: LockGuard<'a>,
}

fn check_fits(cell: &ShmRwLock) -> Result<()> {
    let needed = RwLock::size_of(Some(cell.as_mut_ptr()));
    if needed > LOCK_BYTES {
        return Err(CacheError::InvalidArena(format!(
            "platform rwlock needs {} bytes, cells hold {}",
            needed, LOCK_BYTES
        )));
    }
    Ok(())
}

fn lock_error(name: &str, action: &str, e: impl Display) -> CacheError {
    CacheError::InvalidArena(format!("unable to {} {} lock: {}", action, name, e))
}
