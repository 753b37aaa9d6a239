//! Background Tasks Module
//!
//! Contains background tasks that run periodically during worker operation.
//!
//! # Tasks
//! - GC: sweeps expired entries and frees deleted ones at configured intervals

mod gc;

pub use gc::spawn_gc_task;
