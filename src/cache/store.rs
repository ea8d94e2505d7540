//! Cache Store Module
//!
//! Main store engine combining HashMap storage with O(1) LRU tracking,
//! per-key versions, delete tombstones and lazy expiry.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::entry::current_timestamp_ms;
use crate::cache::{CacheEntry, CacheStats, LruTracker};
use crate::error::{ConfigError, StoreError};

// == Capacity ==
/// Size budget of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapacity {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum key + value bytes, None = unbounded
    pub max_bytes: Option<usize>,
}

impl StoreCapacity {
    pub fn new(max_entries: usize, max_bytes: Option<usize>) -> Result<Self, ConfigError> {
        if max_entries == 0 {
            return Err(ConfigError("store capacity must allow at least one entry".into()));
        }
        if max_bytes == Some(0) {
            return Err(ConfigError("store byte budget must be positive".into()));
        }
        Ok(Self {
            max_entries,
            max_bytes,
        })
    }

    /// Entry-count bound only.
    pub fn entries(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes: None,
        }
    }
}

// == Replication Primitives ==
/// Guard evaluated against the live entry before a versioned write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum Precondition {
    /// Unconditional
    None,
    /// Key must be absent or expired (`add`)
    Absent,
    /// Live entry must carry exactly this version (`cas`)
    Version(u64),
    /// Replica must still hold what it reported earlier (read repair)
    Observed(Option<u64>),
}

impl Precondition {
    fn check(self, live: Option<u64>) -> Result<(), StoreError> {
        match self {
            Precondition::None => Ok(()),
            Precondition::Absent => match live {
                Some(_) => Err(StoreError::AlreadyExists),
                None => Ok(()),
            },
            Precondition::Version(expected) => match live {
                None => Err(StoreError::NotFound),
                Some(v) if v != expected => Err(StoreError::VersionMismatch { current: Some(v) }),
                Some(_) => Ok(()),
            },
            Precondition::Observed(expected) if live != expected => {
                Err(StoreError::VersionMismatch { current: live })
            }
            Precondition::Observed(_) => Ok(()),
        }
    }
}

/// A write carrying a version minted by the coordinating node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedWrite {
    pub key: Bytes,
    pub value: Bytes,
    pub expires_at: Option<u64>,
    pub version: u64,
    pub precondition: Precondition,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

// == Cache Store ==
/// Bounded key/value store with LRU eviction, versions and expiry.
///
/// Deletes leave a tombstone carrying the delete's version so that older
/// copies still circulating between replicas cannot bring the key back.
/// Tombstones are invisible to reads and to `add`, do not count against the
/// size budget, and are themselves bounded by `max_entries` (oldest dropped
/// first).
#[derive(Debug)]
pub struct CacheStore {
    /// Key-value storage
    entries: HashMap<Bytes, CacheEntry>,
    /// LRU access tracker
    lru: LruTracker,
    /// Entries with an expiry, ordered by expiry instant
    expiries: BTreeSet<(u64, Bytes)>,
    /// Delete versions by key
    tombstones: HashMap<Bytes, u64>,
    /// Tombstoned keys in the order they were first recorded
    tombstone_order: VecDeque<Bytes>,
    /// Performance statistics
    stats: CacheStats,
    capacity: StoreCapacity,
    /// Key + value bytes currently held
    bytes: usize,
    /// Highest version this store has assigned or accepted
    clock: u64,
}

impl CacheStore {
    // == Constructor ==
    /// Creates an empty store bounded by `capacity`.
    pub fn new(capacity: StoreCapacity) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            expiries: BTreeSet::new(),
            tombstones: HashMap::new(),
            tombstone_order: VecDeque::new(),
            stats: CacheStats::new(),
            capacity,
            bytes: 0,
            clock: 0,
        }
    }

    // == Get ==
    /// Retrieves a live entry and promotes it to most recently used.
    ///
    /// Expired entries are reclaimed and reported as absent; they are never
    /// promoted.
    pub fn get(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let now = current_timestamp_ms();
        if self.live_version(key, now).is_none() {
            self.stats.record_miss();
            return None;
        }

        let entry = self.entries.get_key_value(key).map(|(k, e)| (k.clone(), e.clone()));
        match entry {
            Some((stored_key, entry)) => {
                self.stats.record_hit();
                self.lru.touch(&stored_key);
                Some(entry)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    // == Get With Version ==
    /// Like [`get`](Self::get), also returning the version token (`gets`).
    pub fn get_with_version(&mut self, key: &[u8]) -> Option<(CacheEntry, u64)> {
        self.get(key).map(|entry| {
            let version = entry.version;
            (entry, version)
        })
    }

    // == Set ==
    /// Inserts or overwrites a key under a fresh version. Never fails.
    pub fn set(&mut self, key: Bytes, value: Bytes, expires_at: Option<u64>) -> u64 {
        let current = self.live_version(&key, current_timestamp_ms());
        let version = self.next_version(current);
        self.install(key, CacheEntry::new(value, version, expires_at));
        version
    }

    // == Add ==
    /// Stores only if the key is absent or expired.
    pub fn add(
        &mut self,
        key: Bytes,
        value: Bytes,
        expires_at: Option<u64>,
    ) -> Result<u64, StoreError> {
        if self.live_version(&key, current_timestamp_ms()).is_some() {
            return Err(StoreError::AlreadyExists);
        }
        let version = self.next_version(None);
        self.install(key, CacheEntry::new(value, version, expires_at));
        Ok(version)
    }

    // == Compare And Set ==
    /// Overwrites only if the live entry carries `expected` as its version.
    pub fn compare_and_set(
        &mut self,
        key: Bytes,
        expected: u64,
        value: Bytes,
        expires_at: Option<u64>,
    ) -> Result<u64, StoreError> {
        match self.live_version(&key, current_timestamp_ms()) {
            None => Err(StoreError::NotFound),
            Some(current) if current != expected => Err(StoreError::VersionMismatch {
                current: Some(current),
            }),
            Some(current) => {
                let version = self.next_version(Some(current));
                self.install(key, CacheEntry::new(value, version, expires_at));
                Ok(version)
            }
        }
    }

    // == Delete ==
    /// Removes an entry under a fresh version. Absent and expired keys report
    /// `NotFound`.
    pub fn delete(&mut self, key: &[u8]) -> DeleteOutcome {
        let Some(current) = self.live_version(key, current_timestamp_ms()) else {
            return DeleteOutcome::NotFound;
        };
        let version = self.next_version(Some(current));
        self.remove_entry(key);
        self.record_tombstone(Bytes::copy_from_slice(key), version);
        DeleteOutcome::Deleted
    }

    // == Apply ==
    /// Installs a write at the version chosen by its coordinator.
    ///
    /// The precondition is checked first; then the write must be strictly
    /// newer than both the live entry and any tombstone, otherwise it is
    /// `Superseded` and nothing changes.
    pub fn apply(&mut self, write: VersionedWrite) -> Result<u64, StoreError> {
        let live = self.live_version(&write.key, current_timestamp_ms());
        write.precondition.check(live)?;

        if let Some(current) = self.newest_version(&write.key, live) {
            if write.version <= current {
                return Err(StoreError::Superseded { current });
            }
        }

        self.clock = self.clock.max(write.version);
        let entry = CacheEntry::new(write.value, write.version, write.expires_at);
        self.install(write.key, entry);
        Ok(write.version)
    }

    /// Deletes at the version chosen by the coordinator, leaving a tombstone
    /// even when nothing was stored. A live entry at least as new as
    /// `version` wins and the delete is `Superseded`.
    pub fn apply_delete(
        &mut self,
        key: Bytes,
        version: u64,
        precondition: Precondition,
    ) -> Result<DeleteOutcome, StoreError> {
        let live = self.live_version(&key, current_timestamp_ms());
        precondition.check(live)?;

        if let Some(current) = live {
            if version <= current {
                return Err(StoreError::Superseded { current });
            }
        }

        self.clock = self.clock.max(version);
        let outcome = match live {
            Some(_) => {
                self.remove_entry(&key);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NotFound,
        };
        self.record_tombstone(key, version);
        Ok(outcome)
    }

    /// Undoes a write that carried `version`, provided it is still the live
    /// entry. No tombstone is left, so older copies elsewhere stay valid.
    pub fn retract(&mut self, key: &[u8], version: u64) -> bool {
        if self.live_version(key, current_timestamp_ms()) != Some(version) {
            return false;
        }
        self.remove_entry(key);
        true
    }

    /// Version of the delete recorded for `key`, if any.
    pub fn tombstone(&self, key: &[u8]) -> Option<u64> {
        self.tombstones.get(key).copied()
    }

    // == Stats ==
    /// Returns current store statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_occupancy(self.entries.len(), self.bytes);
        stats
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub fn keys_by_recency(&self) -> Vec<Bytes> {
        self.lru.iter().cloned().collect()
    }

    // == Length ==
    /// Returns the current number of entries, including expired entries not
    /// yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Version of the live entry under `key`, reclaiming it if expired.
    fn live_version(&mut self, key: &[u8], now: u64) -> Option<u64> {
        let expired = self.entries.get(key)?.is_expired_at(now);
        if expired {
            self.remove_entry(key);
            self.stats.record_expired();
            return None;
        }
        self.entries.get(key).map(|entry| entry.version)
    }

    fn newest_version(&self, key: &[u8], live: Option<u64>) -> Option<u64> {
        live.max(self.tombstone(key))
    }

    fn next_version(&mut self, current: Option<u64>) -> u64 {
        let version = self.clock.max(current.unwrap_or(0)) + 1;
        self.clock = version;
        version
    }

    fn record_tombstone(&mut self, key: Bytes, version: u64) {
        match self.tombstones.get_mut(&key) {
            Some(existing) => *existing = (*existing).max(version),
            None => {
                self.tombstones.insert(key.clone(), version);
                self.tombstone_order.push_back(key);
            }
        }
        while self.tombstones.len() > self.capacity.max_entries {
            let Some(oldest) = self.tombstone_order.pop_front() else {
                break;
            };
            self.tombstones.remove(&oldest);
        }
    }

    fn install(&mut self, key: Bytes, entry: CacheEntry) {
        self.bytes += entry.charge(&key);
        let expires_at = entry.expires_at;
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.bytes -= old.charge(&key);
            if let Some(at) = old.expires_at {
                self.expiries.remove(&(at, key.clone()));
            }
        }
        if let Some(at) = expires_at {
            self.expiries.insert((at, key.clone()));
        }
        self.lru.touch(&key);
        self.evict_over_budget(&key);
        self.stats.set_occupancy(self.entries.len(), self.bytes);
    }

    /// Drops an entry from the map, the byte count and the expiry index. The
    /// caller owns the LRU side.
    fn detach(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let old = self.entries.remove(key)?;
        self.bytes -= old.charge(key);
        if let Some(at) = old.expires_at {
            self.expiries.remove(&(at, Bytes::copy_from_slice(key)));
        }
        Some(old)
    }

    fn remove_entry(&mut self, key: &[u8]) {
        self.detach(key);
        self.lru.remove(key);
        self.stats.set_occupancy(self.entries.len(), self.bytes);
    }

    fn over_budget(&self) -> bool {
        self.entries.len() > self.capacity.max_entries
            || self.capacity.max_bytes.is_some_and(|max| self.bytes > max)
    }

    /// Reclaims every entry whose expiry has passed, wherever it sits in the
    /// access order.
    fn reclaim_expired(&mut self, now: u64) {
        while let Some((at, _)) = self.expiries.first() {
            if *at > now {
                break;
            }
            let Some((_, key)) = self.expiries.pop_first() else {
                break;
            };
            if self.detach(&key).is_some() {
                self.lru.remove(&key);
                self.stats.record_expired();
            }
        }
    }

    /// Evicts from the LRU end until within budget, after expired entries
    /// have been reclaimed. The entry just written is never evicted, even
    /// when it alone exceeds the byte budget.
    fn evict_over_budget(&mut self, protect: &Bytes) {
        if !self.over_budget() {
            return;
        }
        self.reclaim_expired(current_timestamp_ms());

        while self.over_budget() {
            if self.lru.peek_oldest() == Some(protect) {
                break;
            }
            let Some(victim) = self.lru.evict_oldest() else {
                break;
            };
            if self.detach(&victim).is_some() {
                self.stats.record_eviction();
            }
        }
    }
}
