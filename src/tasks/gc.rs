//! GC Task
//!
//! Background task that periodically runs a collection pass over the shared
//! cache. Every worker may run one; the sweep cursor lives in the arena, so
//! concurrent passes split the work instead of repeating it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStore;

/// Spawns a background task that runs [`CacheStore::gc`] every
/// `interval_secs` seconds.
///
/// The pass itself is synchronous and bounded per bucket, so it runs on the
/// blocking pool to keep shard lock waits off the async workers.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache = CacheStore::from_config(&config)?;
/// let gc_handle = spawn_gc_task(cache.clone(), 1);
/// // Later, during shutdown:
/// gc_handle.abort();
/// ```
pub fn spawn_gc_task(cache: CacheStore, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!("Starting GC task with interval of {} seconds", interval_secs);

        loop {
            tokio::time::sleep(interval).await;

            let cache = cache.clone();
            let report = match tokio::task::spawn_blocking(move || cache.gc()).await {
                Ok(report) => report,
                Err(e) => {
                    debug!("GC pass did not complete: {}", e);
                    continue;
                }
            };

            if report.is_empty() {
                debug!("GC: nothing to collect");
            } else {
                info!(
                    "GC: removed {} expired entries, freed {} deleted ({} forced)",
                    report.expired,
                    report.reclaimed + report.forced,
                    report.forced
                );
            }
        }
    })
}
