//! Replication factor and quorum sizes.

use serde::Serialize;
use tracing::warn;

use crate::error::ConfigError;

/// `N`, `W` and `R` for every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumPolicy {
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
}

impl QuorumPolicy {
    /// Validates `1 <= W, R <= N`. `W + R <= N` is allowed but logged, since
    /// it gives up read-your-writes.
    pub fn new(
        replication_factor: usize,
        write_quorum: usize,
        read_quorum: usize,
    ) -> Result<Self, ConfigError> {
        if replication_factor == 0 {
            return Err(ConfigError("replication factor must be at least 1".into()));
        }
        if write_quorum == 0 || write_quorum > replication_factor {
            return Err(ConfigError(format!(
                "write quorum {write_quorum} must be within 1..={replication_factor}"
            )));
        }
        if read_quorum == 0 || read_quorum > replication_factor {
            return Err(ConfigError(format!(
                "read quorum {read_quorum} must be within 1..={replication_factor}"
            )));
        }

        let policy = Self {
            replication_factor,
            write_quorum,
            read_quorum,
        };
        if !policy.overlaps() {
            warn!(
                replication_factor,
                write_quorum, read_quorum, "W + R <= N: reads may miss acknowledged writes"
            );
        }
        Ok(policy)
    }

    /// True when every read quorum intersects every write quorum.
    pub fn overlaps(&self) -> bool {
        self.write_quorum + self.read_quorum > self.replication_factor
    }
}
