//! Configuration Module
//!
//! Handles loading node and cluster configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cache::StoreCapacity;
use crate::cluster::ClusterSettings;
use crate::error::ConfigError;
use crate::replication::QuorumPolicy;
use crate::ring::NodeId;
use crate::tasks::ProbeSettings;

/// Node configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address peers use to reach this node; also its identity on the ring
    pub node_addr: String,
    /// HTTP server port
    pub server_port: u16,
    /// Other cluster members and their weights
    pub peers: Vec<(NodeId, u32)>,
    pub node_weight: u32,
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    /// Maximum number of entries the local store can hold
    pub max_entries: usize,
    /// Optional byte budget for keys plus values
    pub max_bytes: Option<usize>,
    pub virtual_nodes: u32,
    pub replica_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_failure_threshold: u32,
    pub recovery_probe_every: u32,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 11311)
    /// - `NODE_ADDR` - Advertised `host:port` (default: `127.0.0.1:<SERVER_PORT>`)
    /// - `PEERS` - Comma separated `host:port[@weight]` list (default: none)
    /// - `NODE_WEIGHT` - Virtual node multiplier of this node (default: 1)
    /// - `REPLICATION_FACTOR`, `WRITE_QUORUM`, `READ_QUORUM` - N/W/R
    ///   (default: 3/2/2, or 1/1/1 when no peers are configured)
    /// - `MAX_ENTRIES` - Maximum store entries (default: 100000)
    /// - `MAX_BYTES` - Store byte budget (default: unbounded)
    /// - `VIRTUAL_NODES` - Ring points per unit of weight (default: 128)
    /// - `REPLICA_TIMEOUT_MS` - Per replica call deadline (default: 200)
    /// - `PROBE_INTERVAL_MS` - Failure detector cadence (default: 1000)
    /// - `PROBE_TIMEOUT_MS` - Per probe deadline (default: 500)
    /// - `PROBE_FAILURE_THRESHOLD` - Failures before a peer is dead (default: 3)
    /// - `RECOVERY_PROBE_EVERY` - Rounds between probes of dead peers (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`Config::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let server_port = parse_var(&lookup, "SERVER_PORT", defaults.server_port);
        let node_addr = lookup("NODE_ADDR").unwrap_or_else(|| format!("127.0.0.1:{server_port}"));
        let peers = match lookup("PEERS") {
            Some(list) => parse_peers(&list)?,
            None => Vec::new(),
        };

        let (n, w, r) = if peers.is_empty() { (1, 1, 1) } else { (3, 2, 2) };

        Ok(Self {
            node_addr,
            server_port,
            peers,
            node_weight: parse_var(&lookup, "NODE_WEIGHT", defaults.node_weight),
            replication_factor: parse_var(&lookup, "REPLICATION_FACTOR", n),
            write_quorum: parse_var(&lookup, "WRITE_QUORUM", w),
            read_quorum: parse_var(&lookup, "READ_QUORUM", r),
            max_entries: parse_var(&lookup, "MAX_ENTRIES", defaults.max_entries),
            max_bytes: lookup("MAX_BYTES").and_then(|v| v.parse().ok()),
            virtual_nodes: parse_var(&lookup, "VIRTUAL_NODES", defaults.virtual_nodes),
            replica_timeout_ms: parse_var(
                &lookup,
                "REPLICA_TIMEOUT_MS",
                defaults.replica_timeout_ms,
            ),
            probe_interval_ms: parse_var(&lookup, "PROBE_INTERVAL_MS", defaults.probe_interval_ms),
            probe_timeout_ms: parse_var(&lookup, "PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            probe_failure_threshold: parse_var(
                &lookup,
                "PROBE_FAILURE_THRESHOLD",
                defaults.probe_failure_threshold,
            ),
            recovery_probe_every: parse_var(
                &lookup,
                "RECOVERY_PROBE_EVERY",
                defaults.recovery_probe_every,
            ),
        })
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_addr.clone())
    }

    /// Validated settings for [`crate::cluster::CacheNode::configure`].
    pub fn cluster_settings(&self) -> Result<ClusterSettings, ConfigError> {
        let settings = ClusterSettings {
            quorum: QuorumPolicy::new(
                self.replication_factor,
                self.write_quorum,
                self.read_quorum,
            )?,
            capacity: StoreCapacity::new(self.max_entries, self.max_bytes)?,
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
            probe: ProbeSettings {
                interval: Duration::from_millis(self.probe_interval_ms),
                timeout: Duration::from_millis(self.probe_timeout_ms),
                failure_threshold: self.probe_failure_threshold,
                recovery_probe_every: self.recovery_probe_every,
            },
            virtual_nodes: self.virtual_nodes,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_addr: "127.0.0.1:11311".to_string(),
            server_port: 11311,
            peers: Vec::new(),
            node_weight: 1,
            replication_factor: 1,
            write_quorum: 1,
            read_quorum: 1,
            max_entries: 100_000,
            max_bytes: None,
            virtual_nodes: 128,
            replica_timeout_ms: 200,
            probe_interval_ms: 1000,
            probe_timeout_ms: 500,
            probe_failure_threshold: 3,
            recovery_probe_every: 5,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Unparsable value, using default");
            default
        }),
        None => default,
    }
}

/// Parses `host:port[@weight],...`. Blank items are skipped.
pub fn parse_peers(list: &str) -> Result<Vec<(NodeId, u32)>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (addr, weight) = match item.split_once('@') {
                Some((addr, weight)) => {
                    let weight: u32 = weight
                        .parse()
                        .map_err(|_| ConfigError(format!("invalid weight in peer {item:?}")))?;
                    if weight == 0 {
                        return Err(ConfigError(format!("peer {item:?} has zero weight")));
                    }
                    (addr, weight)
                }
                None => (item, 1),
            };
            if addr.rsplit_once(':').map_or(true, |(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(ConfigError(format!("peer {item:?} is not host:port")));
            }
            Ok((NodeId::from(addr), weight))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 11311);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.replica_timeout_ms, 200);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_config_without_peers_is_single_node() {
        let config = Config::from_lookup(lookup(&[("SERVER_PORT", "4000")])).unwrap();
        assert_eq!(config.node_addr, "127.0.0.1:4000");
        assert_eq!(
            (config.replication_factor, config.write_quorum, config.read_quorum),
            (1, 1, 1)
        );
        assert!(config.cluster_settings().is_ok());
    }

    #[test]
    fn test_config_with_peers() {
        let config = Config::from_lookup(lookup(&[
            ("NODE_ADDR", "10.0.0.1:11311"),
            ("PEERS", "10.0.0.2:11311, 10.0.0.3:11311@2"),
            ("MAX_BYTES", "1048576"),
            ("PROBE_FAILURE_THRESHOLD", "not-a-number"),
        ]))
        .unwrap();

        assert_eq!(config.node_id(), NodeId::from("10.0.0.1:11311"));
        assert_eq!(
            config.peers,
            vec![
                (NodeId::from("10.0.0.2:11311"), 1),
                (NodeId::from("10.0.0.3:11311"), 2)
            ]
        );
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.max_bytes, Some(1_048_576));
        assert_eq!(config.probe_failure_threshold, 3);
    }

    #[test]
    fn test_parse_peers_rejects_garbage() {
        assert!(assert_ok!(parse_peers(" , ")).is_empty());
        assert_err!(parse_peers("localhost"));
        assert_err!(parse_peers("host:notaport"));
        assert_err!(parse_peers("host:1@0"));
        assert_err!(parse_peers("host:1@x"));
    }

    #[test]
    fn test_cluster_settings_rejects_bad_quorum() {
        let config = Config {
            write_quorum: 4,
            replication_factor: 3,
            ..Config::default()
        };
        assert!(config.cluster_settings().is_err());

        let config = Config {
            max_entries: 0,
            ..Config::default()
        };
        assert!(config.cluster_settings().is_err());
    }
}
