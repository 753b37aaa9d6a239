//! Cache Module
//!
//! The shared-memory cache engine: entries, TTL expiry, slam defense,
//! in-place updaters and the collector that frees what is left behind.

mod clock;
mod entry;
mod gc;
mod serializer;
mod slam;
mod stats;
mod store;
mod updater;
mod value;


// Re-export public types
pub use clock::{current_timestamp_ms, Clock, ManualClock, SystemClock};
pub use entry::{EntryHandle, EntryState};
pub use gc::GcReport;
pub use serializer::{JsonSerializer, Serializer, SerializerRegistry, DEFAULT_SERIALIZER};
pub use stats::CacheStats;
pub use store::{CacheStore, EntryGuard};
pub use updater::UpdateOp;
pub use value::Value;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
