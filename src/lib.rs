//! shmcache - A process-shared TTL cache
//!
//! Key/value entries live in a fixed-size shared memory arena that every
//! worker process maps. Entries expire by TTL, deleted entries are freed
//! once their last reader is gone, and a slam guard keeps workers from
//! rebuilding the same missing key at once.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod shm;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheStore, Value};
pub use config::Config;
pub use error::{CacheError, Result};
pub use tasks::spawn_gc_task;
