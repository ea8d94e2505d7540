//! Cache Entry Module
//!
//! Defines a versioned cache entry and memcached-style expiry conversion.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Relative expiry times above this many seconds are absolute unix times.
pub const RELATIVE_EXPIRY_LIMIT_SECS: i64 = 60 * 60 * 24 * 30;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The stored value
    pub value: Bytes,
    /// Version token of the write that produced this entry
    pub version: u64,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry expiring at the absolute instant `expires_at`.
    pub fn new(value: Bytes, version: u64, expires_at: Option<u64>) -> Self {
        Self {
            value,
            version,
            created_at: current_timestamp_ms(),
            expires_at,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now_ms`.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    /// Bytes charged against the store's byte budget.
    pub fn charge(&self, key: &[u8]) -> usize {
        key.len() + self.value.len()
    }
}

// == Expiry Conversion ==
/// Converts a memcached `exptime` into an absolute expiry in unix milliseconds.
///
/// - `0` never expires
/// - up to thirty days is a number of seconds from `now_ms`
/// - anything larger is an absolute unix time in seconds
/// - negative values are already expired
///
/// Instants past the end of `u64` milliseconds saturate, which in practice
/// never expires.
pub fn expiry_from_exptime(exptime: i64, now_ms: u64) -> Option<u64> {
    match exptime {
        0 => None,
        t if t < 0 => Some(now_ms.saturating_sub(1)),
        t if t <= RELATIVE_EXPIRY_LIMIT_SECS => {
            Some(now_ms.saturating_add((t as u64).saturating_mul(1000)))
        }
        t => Some((t as u64).saturating_mul(1000)),
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
