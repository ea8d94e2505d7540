//! Node assembly.
//!
//! `CacheNode` ties the local store, the membership view, the coordinator
//! and the failure detector together. It is configured exactly once, before
//! the node serves traffic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheStats, CacheStore, SharedStore, StoreCapacity};
use crate::error::{CacheError, ConfigError};
use crate::replication::{
    ClusterClient, Command, Coordinator, LocalReplica, QuorumPolicy, ReplicaClient,
    ReplicationStatsSnapshot, Response,
};
use crate::ring::{Membership, MembershipEvent, NodeId};
use crate::tasks::{self, FailureDetector, ProbeSettings, Prober};

/// Everything `configure` needs besides the node's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSettings {
    pub quorum: QuorumPolicy,
    pub capacity: StoreCapacity,
    pub replica_timeout: Duration,
    pub probe: ProbeSettings,
    pub virtual_nodes: u32,
}

impl ClusterSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_nodes == 0 {
            return Err(ConfigError("virtual nodes must be at least 1".into()));
        }
        if self.replica_timeout.is_zero() {
            return Err(ConfigError("replica timeout must be positive".into()));
        }
        if self.probe.interval.is_zero() || self.probe.timeout.is_zero() {
            return Err(ConfigError("probe interval and timeout must be positive".into()));
        }
        if self.probe.failure_threshold == 0 {
            return Err(ConfigError("probe failure threshold must be at least 1".into()));
        }
        if self.probe.recovery_probe_every == 0 {
            return Err(ConfigError("recovery probe cadence must be at least 1".into()));
        }
        Ok(())
    }
}

pub struct CacheNode {
    settings: ClusterSettings,
    store: SharedStore,
    membership: Arc<Membership>,
    coordinator: Coordinator,
    /// Taken by the failure detector when it starts
    hints: Mutex<Option<mpsc::UnboundedReceiver<NodeId>>>,
}

impl CacheNode {
    /// Builds a node from validated settings. `remote` carries sub-operations
    /// to peers; requests for `local_id` never leave the process.
    pub fn configure(
        settings: ClusterSettings,
        local_id: NodeId,
        local_weight: u32,
        peers: impl IntoIterator<Item = (NodeId, u32)>,
        remote: Arc<dyn ReplicaClient>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let store: SharedStore = Arc::new(RwLock::new(CacheStore::new(settings.capacity)));
        let membership = Arc::new(Membership::new(
            local_id.clone(),
            local_weight,
            peers,
            settings.virtual_nodes,
        ));
        let client = ClusterClient::new(local_id.clone(), LocalReplica::new(store.clone()), remote);
        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            membership.clone(),
            Arc::new(client),
            settings.quorum,
            settings.replica_timeout,
            Some(hint_tx),
        );

        info!(
            node = %local_id,
            members = membership.snapshot().members().count(),
            replication_factor = settings.quorum.replication_factor,
            write_quorum = settings.quorum.write_quorum,
            read_quorum = settings.quorum.read_quorum,
            "Cache node configured"
        );

        Ok(Self {
            settings,
            store,
            membership,
            coordinator,
            hints: Mutex::new(Some(hint_rx)),
        })
    }

    /// Validates and runs a client command.
    pub async fn execute(&self, command: Command) -> Result<Response, CacheError> {
        command.validate()?;
        Ok(self.coordinator.execute(command).await)
    }

    /// Applies a membership change and returns the new ring version.
    pub fn on_membership_change(&self, event: MembershipEvent) -> u64 {
        self.membership.apply(event)
    }

    /// Starts the failure detector. Only the first call gets the fault
    /// hints; later calls return `None`.
    pub fn spawn_failure_detector(&self, prober: Arc<dyn Prober>) -> Option<JoinHandle<()>> {
        let hints = self.hints.lock().ok()?.take()?;
        let detector = FailureDetector::new(self.membership.clone(), prober, self.settings.probe);
        Some(tasks::spawn_failure_detector(detector, hints))
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Executes replica sub-operations sent by peers.
    pub fn local_replica(&self) -> LocalReplica {
        LocalReplica::new(self.store.clone())
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub async fn store_stats(&self) -> CacheStats {
        self.store.read().await.stats()
    }

    pub fn replication_stats(&self) -> ReplicationStatsSnapshot {
        self.coordinator.stats()
    }
}
