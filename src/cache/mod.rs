//! Cache Module
//!
//! A single node's bounded in-memory store: versioned entries, lazy expiry and
//! O(1) LRU eviction.

mod entry;
mod lru;
mod stats;
mod store;


use std::sync::Arc;

use tokio::sync::RwLock;

// Re-export public types
pub use entry::{current_timestamp_ms, expiry_from_exptime, CacheEntry};
pub use lru::LruTracker;
pub use stats::CacheStats;
pub use store::{CacheStore, DeleteOutcome, Precondition, StoreCapacity, VersionedWrite};

/// Store shared between request handlers. Reads take the write side too,
/// since promotion mutates the access order.
pub type SharedStore = Arc<RwLock<CacheStore>>;

// == Public Constants ==
/// Maximum allowed key length in bytes (memcached limit)
pub const MAX_KEY_LENGTH: usize = 250;

/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB
