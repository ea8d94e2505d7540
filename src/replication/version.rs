//! Version minting for replicated writes.
//!
//! Versions are hybrid logical clock readings: milliseconds since
//! 2024-01-01 in the high bits, a logical counter below, and an 8-bit node
//! tag at the bottom so two coordinators never mint the same token.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::cache::current_timestamp_ms;
use crate::ring::{position, NodeId};

const CLOCK_EPOCH_MS: u64 = 1_704_067_200_000;
const LOGICAL_BITS: u32 = 15;
const TAG_BITS: u32 = 8;
/// Largest timestamp that still fits above the node tag.
const MAX_TIMESTAMP: u64 = u64::MAX >> TAG_BITS;
/// Versions further ahead of the local wall clock than this are not observed.
const MAX_FORWARD_DRIFT_MS: u64 = 60 * 60 * 1000;

#[derive(Debug)]
pub struct VersionClock {
    tag: u64,
    /// Last timestamp (physical << LOGICAL_BITS | logical) handed out or seen
    last: AtomicU64,
}

impl VersionClock {
    pub fn new(node: &NodeId) -> Self {
        Self {
            tag: position(node.as_str().as_bytes()) & ((1 << TAG_BITS) - 1),
            last: AtomicU64::new(0),
        }
    }

    /// Returns a version larger than every version minted or observed by
    /// this clock. Saturates rather than wrapping once the timestamp field
    /// is exhausted.
    pub fn mint(&self) -> u64 {
        let physical = physical_now();
        let advance = |last: u64| physical.max(last.saturating_add(1)).min(MAX_TIMESTAMP);
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(advance(last)))
            .unwrap_or_else(|last| last);
        (advance(previous) << TAG_BITS) | self.tag
    }

    /// Moves the clock past a version held by a replica, such as a read
    /// winner. Versions implausibly far in the future are ignored so one bad
    /// token cannot exhaust the clock.
    pub fn observe(&self, version: u64) -> bool {
        let timestamp = version >> TAG_BITS;
        let horizon = physical_now()
            .saturating_add(MAX_FORWARD_DRIFT_MS << LOGICAL_BITS)
            .min(MAX_TIMESTAMP);
        if timestamp > horizon {
            warn!(version, "Ignoring version far ahead of the local clock");
            return false;
        }
        self.last.fetch_max(timestamp, Ordering::SeqCst);
        true
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

fn physical_now() -> u64 {
    (current_timestamp_ms().saturating_sub(CLOCK_EPOCH_MS) << LOGICAL_BITS).min(MAX_TIMESTAMP)
}
