//! Replication Module
//!
//! Quorum replication of client commands across a key's replica set.

mod command;
mod coordinator;
mod http;
mod quorum;
mod transport;
mod version;

pub use command::{validate_key, Command, NotStoredReason, Response};
pub use coordinator::{Coordinator, ReplicationStats, ReplicationStatsSnapshot};
pub use http::{HttpPeerClient, MEMBERSHIP_PATH, PING_PATH, REPLICA_PATH};
pub use quorum::QuorumPolicy;
pub use transport::{ClusterClient, LocalReplica, ReplicaClient, ReplicaReply, ReplicaRequest};
pub use version::VersionClock;
