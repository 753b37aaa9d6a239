//! Shared Memory Module
//!
//! The arena mapping, its cross-process lock, the segment allocator and the
//! pools that carve values out of it.

mod arena;
mod lock;
mod pool;
mod sma;

pub use arena::{Arena, ArenaOptions, Unprotected};
pub use lock::{SharedLock, ShmReadGuard, ShmRwLock, ShmWriteGuard};
pub use pool::{HeapMemory, Pool, PoolHandle, PoolKind, PoolMemory};
pub use sma::{FreeBlock, SmaInfo, BLOCK_ALIGN};

pub(crate) use arena::align_up;
