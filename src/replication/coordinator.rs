//! Replication coordinator.
//!
//! Runs every client command against the key's replica set: writes need `W`
//! acknowledgements, reads wait for `R` replies and repair stale copies in
//! the background, and compare-and-set consults the primary first. Deletes
//! are versioned like writes, so a newer delete beats an older copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{Precondition, VersionedWrite};
use crate::error::{PeerError, StoreError};
use crate::replication::{
    Command, NotStoredReason, QuorumPolicy, ReplicaClient, ReplicaReply, ReplicaRequest, Response,
    VersionClock,
};
use crate::ring::{Membership, NodeId};

type Reply = (NodeId, Result<ReplicaReply, PeerError>);
type Pending = FuturesUnordered<BoxFuture<'static, Reply>>;

// == Replication Stats ==
/// Counters shared by the coordinator and its background tasks.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    commands: AtomicU64,
    quorum_failures: AtomicU64,
    stale_replicas: AtomicU64,
    repairs_issued: AtomicU64,
    peer_faults: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicationStatsSnapshot {
    pub commands: u64,
    pub quorum_failures: u64,
    pub stale_replicas: u64,
    pub repairs_issued: u64,
    pub peer_faults: u64,
}

impl ReplicationStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReplicationStatsSnapshot {
        ReplicationStatsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            stale_replicas: self.stale_replicas.load(Ordering::Relaxed),
            repairs_issued: self.repairs_issued.load(Ordering::Relaxed),
            peer_faults: self.peer_faults.load(Ordering::Relaxed),
        }
    }
}

// == Fault Reporting ==
/// Logs peer faults and forwards the node to the failure detector, which
/// probes it out of cadence.
#[derive(Clone)]
struct FaultReporter {
    hints: Option<mpsc::UnboundedSender<NodeId>>,
    stats: Arc<ReplicationStats>,
}

impl FaultReporter {
    fn report(&self, error: &PeerError) {
        warn!(node = %error.node(), %error, "Replica call failed");
        ReplicationStats::bump(&self.stats.peer_faults);
        if let Some(hints) = &self.hints {
            // Detector gone means we are shutting down
            let _ = hints.send(error.node().clone());
        }
    }
}

// == Dispatcher ==
/// Sends sub-operations with a per-replica deadline.
#[derive(Clone)]
struct Dispatcher {
    client: Arc<dyn ReplicaClient>,
    timeout: Duration,
    faults: FaultReporter,
}

impl Dispatcher {
    fn send(&self, node: NodeId, request: ReplicaRequest) -> BoxFuture<'static, Reply> {
        let this = self.clone();
        async move {
            let result = match tokio::time::timeout(this.timeout, this.client.send(&node, request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout(node.clone())),
            };
            if let Err(error) = &result {
                this.faults.report(error);
            }
            (node, result)
        }
        .boxed()
    }

    fn fan_out(&self, nodes: &[NodeId], request: &ReplicaRequest) -> Pending {
        nodes
            .iter()
            .map(|node| self.send(node.clone(), request.clone()))
            .collect()
    }
}

/// Lets sub-requests still in flight after a quorum decision run to
/// completion without holding up the client.
fn finish_in_background(mut pending: Pending) {
    if pending.is_empty() {
        return;
    }
    tokio::spawn(async move { while pending.next().await.is_some() {} });
}

#[derive(Debug, Default)]
struct WriteTally {
    acks: usize,
    already_exists: bool,
    deleted: bool,
    /// Replicas that installed the write
    stored: Vec<NodeId>,
}

/// The newest copy seen by a read.
#[derive(Debug, Clone)]
struct Winner {
    value: Bytes,
    version: u64,
    expires_at: Option<u64>,
}

/// What one replica reported holding for a key.
#[derive(Debug, Clone)]
enum ReplicaCopy {
    Live(Winner),
    /// Removed by the delete carrying this version
    Deleted(u64),
    Absent,
}

impl ReplicaCopy {
    fn from_reply(reply: ReplicaReply) -> Result<Self, ReplicaReply> {
        match reply {
            ReplicaReply::Found {
                value,
                version,
                expires_at,
            } => Ok(Self::Live(Winner {
                value,
                version,
                expires_at,
            })),
            ReplicaReply::Missing {
                deleted: Some(version),
            } => Ok(Self::Deleted(version)),
            ReplicaReply::Missing { deleted: None } => Ok(Self::Absent),
            other => Err(other),
        }
    }

    fn version(&self) -> u64 {
        match self {
            Self::Live(winner) => winner.version,
            Self::Deleted(version) => *version,
            Self::Absent => 0,
        }
    }

    fn live_version(&self) -> Option<u64> {
        match self {
            Self::Live(winner) => Some(winner.version),
            _ => None,
        }
    }
}

/// Sub-operation that brings a replica holding `copy` up to `newest`, or
/// `None` when it is not behind. Guarded so it only lands if the replica
/// still holds what it reported.
fn repair_request(key: &Bytes, newest: &ReplicaCopy, copy: &ReplicaCopy) -> Option<ReplicaRequest> {
    if copy.version() >= newest.version() {
        return None;
    }
    let precondition = Precondition::Observed(copy.live_version());
    match (newest, copy) {
        (ReplicaCopy::Live(winner), _) => Some(ReplicaRequest::Write(VersionedWrite {
            key: key.clone(),
            value: winner.value.clone(),
            expires_at: winner.expires_at,
            version: winner.version,
            precondition,
        })),
        (ReplicaCopy::Deleted(version), ReplicaCopy::Live(_)) => Some(ReplicaRequest::Delete {
            key: key.clone(),
            version: *version,
            precondition,
        }),
        _ => None,
    }
}

fn write_acked(reply: &ReplicaReply) -> bool {
    matches!(
        reply,
        ReplicaReply::Stored { .. }
            | ReplicaReply::Rejected {
                error: StoreError::Superseded { .. }
            }
    )
}

fn add_acked(reply: &ReplicaReply) -> bool {
    matches!(reply, ReplicaReply::Stored { .. })
}

fn delete_acked(reply: &ReplicaReply) -> bool {
    matches!(
        reply,
        ReplicaReply::Deleted
            | ReplicaReply::NotFound
            | ReplicaReply::Rejected {
                error: StoreError::Superseded { .. }
            }
    )
}

// == Coordinator ==
pub struct Coordinator {
    membership: Arc<Membership>,
    dispatcher: Dispatcher,
    policy: QuorumPolicy,
    clock: VersionClock,
    stats: Arc<ReplicationStats>,
}

impl Coordinator {
    /// `hints` receives every node a replica call failed against.
    pub fn new(
        membership: Arc<Membership>,
        client: Arc<dyn ReplicaClient>,
        policy: QuorumPolicy,
        replica_timeout: Duration,
        hints: Option<mpsc::UnboundedSender<NodeId>>,
    ) -> Self {
        let stats = Arc::new(ReplicationStats::default());
        let clock = VersionClock::new(membership.local_id());
        Self {
            membership,
            dispatcher: Dispatcher {
                client,
                timeout: replica_timeout,
                faults: FaultReporter {
                    hints,
                    stats: stats.clone(),
                },
            },
            policy,
            clock,
            stats,
        }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    pub fn stats(&self) -> ReplicationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs an already validated command.
    pub async fn execute(&self, command: Command) -> Response {
        ReplicationStats::bump(&self.stats.commands);
        let replicas = self
            .membership
            .replicas_for(command.key(), self.policy.replication_factor);
        debug!(
            command = command.name(),
            ring_version = replicas.ring_version,
            replicas = replicas.len(),
            "Executing command"
        );
        let nodes = replicas.nodes;

        match command {
            Command::Set { key, value, expiry } => {
                let write = self.versioned(key, value, expiry, Precondition::None);
                self.store(nodes, write, write_acked).await
            }
            Command::Add { key, value, expiry } => {
                let write = self.versioned(key, value, expiry, Precondition::Absent);
                self.store(nodes, write, add_acked).await
            }
            Command::Delete { key } => self.delete(nodes, key).await,
            Command::Get { key } => match self.retrieve(nodes, key).await {
                Ok(Some(winner)) => Response::Value(winner.value),
                Ok(None) => Response::NotFound,
                Err(unavailable) => unavailable,
            },
            Command::Gets { key } => match self.retrieve(nodes, key).await {
                Ok(Some(winner)) => Response::ValueWithVersion(winner.value, winner.version),
                Ok(None) => Response::NotFound,
                Err(unavailable) => unavailable,
            },
            Command::CompareAndSet {
                key,
                value,
                expiry,
                expected_version,
            } => {
                let write = self.versioned(
                    key,
                    value,
                    expiry,
                    Precondition::Version(expected_version),
                );
                self.compare_and_set(nodes, write).await
            }
        }
    }

    fn versioned(
        &self,
        key: Bytes,
        value: Bytes,
        expires_at: Option<u64>,
        precondition: Precondition,
    ) -> VersionedWrite {
        VersionedWrite {
            key,
            value,
            expires_at,
            version: self.clock.mint(),
            precondition,
        }
    }

    fn unavailable(&self, command: &'static str, reachable: usize, needed: usize) -> Response {
        ReplicationStats::bump(&self.stats.quorum_failures);
        warn!(command, reachable, needed, "Quorum not reached");
        Response::Unavailable
    }

    // == Writes ==
    async fn store(
        &self,
        nodes: Vec<NodeId>,
        write: VersionedWrite,
        is_ack: fn(&ReplicaReply) -> bool,
    ) -> Response {
        let needed = self.policy.write_quorum;
        let command = match write.precondition {
            Precondition::Absent => "add",
            _ => "set",
        };
        if nodes.len() < needed {
            return self.unavailable(command, nodes.len(), needed);
        }

        let key = write.key.clone();
        let version = write.version;
        let pending = self.dispatcher.fan_out(&nodes, &ReplicaRequest::Write(write));
        let (tally, pending) = self.gather_writes(pending, nodes.len(), needed, is_ack).await;

        if tally.acks >= needed {
            finish_in_background(pending);
            Response::Stored
        } else if tally.already_exists {
            self.withdraw(tally.stored, pending, key, version).await;
            Response::NotStored(NotStoredReason::AlreadyExists)
        } else {
            finish_in_background(pending);
            self.unavailable(command, tally.acks, needed)
        }
    }

    /// Takes a rejected `add` back off the replicas that installed it, so the
    /// value that made it fail stays the newest copy. Replicas that already
    /// answered are retracted before returning; late answers in the background.
    async fn withdraw(&self, stored: Vec<NodeId>, mut pending: Pending, key: Bytes, version: u64) {
        let retract = ReplicaRequest::Retract { key, version };
        let retracted = self.dispatcher.fan_out(&stored, &retract);
        for (node, result) in retracted.collect::<Vec<_>>().await {
            if let Ok(reply) = result {
                debug!(%node, ?reply, "Rejected add withdrawn");
            }
        }

        if pending.is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            while let Some((node, result)) = pending.next().await {
                if let Ok(ReplicaReply::Stored { .. }) = result {
                    let (node, result) = dispatcher.send(node, retract.clone()).await;
                    if let Ok(reply) = result {
                        debug!(%node, ?reply, "Rejected add withdrawn");
                    }
                }
            }
        });
    }

    async fn delete(&self, nodes: Vec<NodeId>, key: Bytes) -> Response {
        let needed = self.policy.write_quorum;
        if nodes.len() < needed {
            return self.unavailable("delete", nodes.len(), needed);
        }

        let request = ReplicaRequest::Delete {
            key,
            version: self.clock.mint(),
            precondition: Precondition::None,
        };
        let pending = self.dispatcher.fan_out(&nodes, &request);
        let (tally, pending) = self
            .gather_writes(pending, nodes.len(), needed, delete_acked)
            .await;
        finish_in_background(pending);

        match (tally.acks >= needed, tally.deleted) {
            (true, true) => Response::Deleted,
            (true, false) => Response::NotFound,
            (false, _) => self.unavailable("delete", tally.acks, needed),
        }
    }

    /// Collects replies until `needed` acknowledgements arrive or the quorum
    /// can no longer be reached. Returns the sub-requests still in flight.
    async fn gather_writes(
        &self,
        mut pending: Pending,
        total: usize,
        needed: usize,
        is_ack: fn(&ReplicaReply) -> bool,
    ) -> (WriteTally, Pending) {
        let mut tally = WriteTally::default();
        let mut answered = 0;

        while let Some((node, result)) = pending.next().await {
            answered += 1;
            match result {
                Ok(reply) if is_ack(&reply) => {
                    tally.acks += 1;
                    tally.deleted |= reply == ReplicaReply::Deleted;
                    if matches!(reply, ReplicaReply::Stored { .. }) {
                        tally.stored.push(node);
                    }
                }
                Ok(ReplicaReply::Rejected {
                    error: StoreError::AlreadyExists,
                }) => tally.already_exists = true,
                Ok(reply) => debug!(%node, ?reply, "Replica declined write"),
                Err(_) => ReplicationStats::bump(&self.stats.stale_replicas),
            }

            if tally.acks >= needed || tally.acks + (total - answered) < needed {
                break;
            }
        }

        (tally, pending)
    }

    // == Reads ==
    /// Returns the newest live copy among the first `R` replies, or
    /// `Err(Unavailable)` when fewer than `R` replicas answer. A delete newer
    /// than every live copy makes the key absent.
    async fn retrieve(&self, nodes: Vec<NodeId>, key: Bytes) -> Result<Option<Winner>, Response> {
        let needed = self.policy.read_quorum;
        if nodes.len() < needed {
            return Err(self.unavailable("get", nodes.len(), needed));
        }

        let total = nodes.len();
        let mut pending = self
            .dispatcher
            .fan_out(&nodes, &ReplicaRequest::Read { key: key.clone() });
        let mut answered = 0;
        let mut replies: Vec<(NodeId, ReplicaCopy)> = Vec::with_capacity(total);

        while let Some((node, result)) = pending.next().await {
            answered += 1;
            match result.map(ReplicaCopy::from_reply) {
                Ok(Ok(copy)) => replies.push((node, copy)),
                Ok(Err(reply)) => warn!(%node, ?reply, "Unexpected reply to read"),
                Err(_) => ReplicationStats::bump(&self.stats.stale_replicas),
            }

            if replies.len() >= needed || replies.len() + (total - answered) < needed {
                break;
            }
        }

        if replies.len() < needed {
            finish_in_background(pending);
            return Err(self.unavailable("get", replies.len(), needed));
        }

        let newest = replies
            .iter()
            .map(|(_, copy)| copy)
            .max_by_key(|copy| copy.version())
            .cloned()
            .unwrap_or(ReplicaCopy::Absent);

        if matches!(newest, ReplicaCopy::Absent) {
            finish_in_background(pending);
            return Ok(None);
        }

        self.clock.observe(newest.version());
        for (node, copy) in &replies {
            if let Some(request) = repair_request(&key, &newest, copy) {
                spawn_repair(&self.dispatcher, &self.stats, node.clone(), request);
            }
        }
        self.repair_late_replies(pending, key, newest.clone());

        Ok(match newest {
            ReplicaCopy::Live(winner) => Some(winner),
            _ => None,
        })
    }

    fn repair_late_replies(&self, mut pending: Pending, key: Bytes, newest: ReplicaCopy) {
        if pending.is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            while let Some((node, result)) = pending.next().await {
                let Ok(Ok(copy)) = result.map(ReplicaCopy::from_reply) else {
                    continue;
                };
                if let Some(request) = repair_request(&key, &newest, &copy) {
                    spawn_repair(&dispatcher, &stats, node, request);
                }
            }
        });
    }

    // == Compare And Set ==
    async fn compare_and_set(&self, nodes: Vec<NodeId>, mut write: VersionedWrite) -> Response {
        let needed = self.policy.write_quorum;
        if nodes.len() < needed {
            return self.unavailable("cas", nodes.len(), needed);
        }
        let Some((primary, secondaries)) = nodes.split_first() else {
            return self.unavailable("cas", 0, needed);
        };

        let mut retried = false;
        loop {
            let (_, result) = self
                .dispatcher
                .send(primary.clone(), ReplicaRequest::Write(write.clone()))
                .await;
            match result {
                Ok(ReplicaReply::Stored { .. }) => break,
                // Token matched, but the entry was written by a clock ahead of ours
                Ok(ReplicaReply::Rejected {
                    error: StoreError::Superseded { current },
                }) if !retried && self.clock.observe(current) => {
                    retried = true;
                    write.version = self.clock.mint();
                }
                Ok(ReplicaReply::Rejected {
                    error: StoreError::NotFound,
                }) => return Response::NotFound,
                Ok(ReplicaReply::Rejected { error }) => {
                    debug!(node = %primary, %error, "cas rejected by primary");
                    return Response::Conflict;
                }
                Ok(reply) => {
                    warn!(node = %primary, ?reply, "Unexpected reply to cas");
                    return self.unavailable("cas", 0, needed);
                }
                Err(_) => return self.unavailable("cas", 0, needed),
            }
        }

        let mut pending: Pending = secondaries
            .iter()
            .map(|node| self.secondary_cas(node.clone(), write.clone()))
            .collect();
        let total = secondaries.len();
        let mut acks = 1;
        let mut answered = 0;

        while acks < needed {
            let Some((node, result)) = pending.next().await else {
                break;
            };
            answered += 1;
            match result {
                Ok(reply) if write_acked(&reply) => acks += 1,
                Ok(reply) => debug!(%node, ?reply, "Secondary declined cas"),
                Err(_) => ReplicationStats::bump(&self.stats.stale_replicas),
            }
            if acks + (total - answered) < needed {
                break;
            }
        }
        finish_in_background(pending);

        if acks >= needed {
            Response::Stored
        } else {
            self.unavailable("cas", acks, needed)
        }
    }

    /// Conditional write to a secondary. A secondary that disagrees with the
    /// primary is brought up to date with the new value instead.
    fn secondary_cas(&self, node: NodeId, write: VersionedWrite) -> BoxFuture<'static, Reply> {
        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        async move {
            let (node, result) = dispatcher
                .send(node, ReplicaRequest::Write(write.clone()))
                .await;
            let observed = match &result {
                Ok(ReplicaReply::Rejected {
                    error: StoreError::VersionMismatch { current },
                }) => *current,
                Ok(ReplicaReply::Rejected {
                    error: StoreError::NotFound,
                }) => None,
                _ => return (node, result),
            };

            ReplicationStats::bump(&stats.stale_replicas);
            ReplicationStats::bump(&stats.repairs_issued);
            let repair = VersionedWrite {
                precondition: Precondition::Observed(observed),
                ..write
            };
            dispatcher.send(node, ReplicaRequest::Write(repair)).await
        }
        .boxed()
    }
}

fn spawn_repair(
    dispatcher: &Dispatcher,
    stats: &ReplicationStats,
    node: NodeId,
    request: ReplicaRequest,
) {
    ReplicationStats::bump(&stats.stale_replicas);
    ReplicationStats::bump(&stats.repairs_issued);
    let send = dispatcher.send(node, request);
    tokio::spawn(async move {
        match send.await {
            (node, Ok(ReplicaReply::Stored { version })) => {
                debug!(%node, version, "Read repair applied")
            }
            (node, Ok(ReplicaReply::Deleted)) => debug!(%node, "Read repair removed a deleted key"),
            (node, Ok(reply)) => debug!(%node, ?reply, "Read repair skipped"),
            (_, Err(_)) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, SharedStore, StoreCapacity};
    use crate::replication::LocalReplica;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Clone)]
    enum Behavior {
        Healthy(LocalReplica),
        Down,
        Hung,
    }

    /// In-memory cluster: every node is a local store, or broken on purpose.
    struct MockCluster {
        nodes: HashMap<NodeId, Behavior>,
    }

    #[async_trait]
    impl ReplicaClient for MockCluster {
        async fn send(
            &self,
            node: &NodeId,
            request: ReplicaRequest,
        ) -> Result<ReplicaReply, PeerError> {
            match self.nodes.get(node) {
                Some(Behavior::Healthy(replica)) => Ok(replica.handle(request).await),
                Some(Behavior::Hung) => std::future::pending().await,
                Some(Behavior::Down) | None => {
                    Err(PeerError::Unreachable(node.clone(), "connection refused".into()))
                }
            }
        }
    }

    struct Harness {
        coordinator: Coordinator,
        membership: Arc<Membership>,
        stores: HashMap<NodeId, SharedStore>,
        hints: mpsc::UnboundedReceiver<NodeId>,
    }

    fn ids() -> Vec<NodeId> {
        vec![
            NodeId::from("a:1"),
            NodeId::from("b:1"),
            NodeId::from("c:1"),
        ]
    }

    /// Three nodes, N = 3. `broken` maps node index to a failure mode.
    fn harness(w: usize, r: usize, broken: &[(usize, Behavior)]) -> Harness {
        let ids = ids();
        let mut nodes = HashMap::new();
        let mut stores = HashMap::new();
        for id in &ids {
            let store: SharedStore =
                Arc::new(RwLock::new(CacheStore::new(StoreCapacity::entries(100))));
            stores.insert(id.clone(), store.clone());
            nodes.insert(id.clone(), Behavior::Healthy(LocalReplica::new(store)));
        }
        for (index, behavior) in broken {
            nodes.insert(ids[*index].clone(), behavior.clone());
        }

        let membership = Arc::new(Membership::new(
            ids[0].clone(),
            1,
            ids[1..].iter().map(|id| (id.clone(), 1)),
            16,
        ));
        let (tx, hints) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            membership.clone(),
            Arc::new(MockCluster { nodes }),
            QuorumPolicy::new(3, w, r).unwrap(),
            Duration::from_millis(50),
            Some(tx),
        );
        Harness {
            coordinator,
            membership,
            stores,
            hints,
        }
    }

    fn key() -> Bytes {
        Bytes::from_static(b"user:1")
    }

    fn set(value: &'static [u8]) -> Command {
        Command::Set {
            key: key(),
            value: Bytes::from_static(value),
            expiry: None,
        }
    }

    async fn version_on(store: &SharedStore) -> Option<u64> {
        store.write().await.get(&key()).map(|entry| entry.version)
    }

    async fn seed(store: &SharedStore, value: &'static [u8], version: u64) {
        store
            .write()
            .await
            .apply(VersionedWrite {
                key: key(),
                value: Bytes::from_static(value),
                expires_at: None,
                version,
                precondition: Precondition::None,
            })
            .unwrap();
    }

    /// Polls until every store holds `version` for the test key.
    async fn converged(stores: &HashMap<NodeId, SharedStore>, version: u64) -> bool {
        for _ in 0..100 {
            let mut all = true;
            for store in stores.values() {
                all &= version_on(store).await == Some(version);
            }
            if all {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_set_then_get_on_healthy_cluster() {
        let h = harness(2, 2, &[]);

        assert_eq!(h.coordinator.execute(set(b"v1")).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"v1"))
        );
    }

    #[tokio::test]
    async fn test_write_succeeds_with_exactly_w_replicas() {
        let h = harness(2, 2, &[(2, Behavior::Down)]);
        assert_eq!(h.coordinator.execute(set(b"v")).await, Response::Stored);

        let h = harness(2, 2, &[(1, Behavior::Down), (2, Behavior::Down)]);
        assert_eq!(h.coordinator.execute(set(b"v")).await, Response::Unavailable);
        assert_eq!(h.coordinator.stats().quorum_failures, 1);
    }

    #[tokio::test]
    async fn test_hung_replica_does_not_block_quorum() {
        let h = harness(2, 2, &[(1, Behavior::Hung)]);

        let started = std::time::Instant::now();
        assert_eq!(h.coordinator.execute(set(b"v")).await, Response::Stored);
        assert!(started.elapsed() < Duration::from_secs(1));

        // With W = 3 the hung replica times out and the write fails
        let h = harness(3, 1, &[(1, Behavior::Hung)]);
        assert_eq!(h.coordinator.execute(set(b"v")).await, Response::Unavailable);
    }

    #[tokio::test]
    async fn test_peer_faults_become_hints() {
        let mut h = harness(2, 2, &[(2, Behavior::Down)]);
        h.coordinator.execute(set(b"v")).await;

        let hinted = tokio::time::timeout(Duration::from_secs(1), h.hints.recv())
            .await
            .unwrap();
        assert_eq!(hinted, Some(ids()[2].clone()));
        assert!(h.coordinator.stats().peer_faults >= 1);
    }

    #[tokio::test]
    async fn test_read_returns_highest_version_and_repairs() {
        let h = harness(2, 3, &[]);
        let ids = ids();
        seed(&h.stores[&ids[0]], b"new", 10).await;
        seed(&h.stores[&ids[1]], b"old", 5).await;

        assert_eq!(
            h.coordinator.execute(Command::Gets { key: key() }).await,
            Response::ValueWithVersion(Bytes::from_static(b"new"), 10)
        );
        assert!(converged(&h.stores, 10).await, "stale replicas were not repaired");
        assert_eq!(h.coordinator.stats().repairs_issued, 2);
    }

    #[tokio::test]
    async fn test_read_of_missing_key() {
        let h = harness(2, 2, &[]);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::NotFound
        );
    }

    #[tokio::test]
    async fn test_read_without_quorum_is_unavailable() {
        let h = harness(1, 2, &[(1, Behavior::Down), (2, Behavior::Down)]);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Unavailable
        );
    }

    #[tokio::test]
    async fn test_add_rejects_existing_key() {
        let h = harness(2, 2, &[]);

        let add = Command::Add {
            key: key(),
            value: Bytes::from_static(b"first"),
            expiry: None,
        };
        assert_eq!(h.coordinator.execute(add.clone()).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(add).await,
            Response::NotStored(NotStoredReason::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let h = harness(2, 2, &[]);
        h.coordinator.execute(set(b"v")).await;

        assert_eq!(
            h.coordinator.execute(Command::Delete { key: key() }).await,
            Response::Deleted
        );
        assert_eq!(
            h.coordinator.execute(Command::Delete { key: key() }).await,
            Response::NotFound
        );
    }

    #[tokio::test]
    async fn test_cas_with_stale_token_conflicts() {
        let h = harness(2, 2, &[]);
        h.coordinator.execute(set(b"v1")).await;
        let Response::ValueWithVersion(_, token) =
            h.coordinator.execute(Command::Gets { key: key() }).await
        else {
            panic!("expected a version");
        };
        h.coordinator.execute(set(b"v2")).await;
        let Response::ValueWithVersion(_, current) =
            h.coordinator.execute(Command::Gets { key: key() }).await
        else {
            panic!("expected a version");
        };
        assert!(current > token);
        assert!(converged(&h.stores, current).await);

        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"v3"),
            expiry: None,
            expected_version: token,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::Conflict);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_cas_with_current_token_stores() {
        let h = harness(3, 2, &[]);
        h.coordinator.execute(set(b"v1")).await;
        let Response::ValueWithVersion(_, token) =
            h.coordinator.execute(Command::Gets { key: key() }).await
        else {
            panic!("expected a version");
        };

        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"v2"),
            expiry: None,
            expected_version: token,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_cas_repairs_diverged_secondary() {
        let h = harness(3, 1, &[]);
        let replicas = h.membership.replicas_for(&key(), 3);
        let primary = replicas.primary().unwrap().clone();
        for (node, store) in &h.stores {
            let version = if *node == primary { 7 } else { 3 };
            seed(store, b"old", version).await;
        }

        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"new"),
            expiry: None,
            expected_version: 7,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::Stored);

        let version = version_on(&h.stores[&primary]).await.unwrap();
        assert!(version > 7);
        assert!(converged(&h.stores, version).await);
    }

    #[tokio::test]
    async fn test_cas_fails_fast_when_primary_unreachable() {
        let layout = harness(2, 2, &[]);
        let primary = layout.membership.replicas_for(&key(), 3).primary().unwrap().clone();
        let index = ids().iter().position(|id| *id == primary).unwrap();

        let h = harness(2, 2, &[(index, Behavior::Down)]);
        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"v"),
            expiry: None,
            expected_version: 1,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::Unavailable);
    }

    #[tokio::test]
    async fn test_cas_on_missing_key() {
        let h = harness(2, 2, &[]);
        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"v"),
            expiry: None,
            expected_version: 42,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::NotFound);
    }

    #[tokio::test]
    async fn test_rejected_add_leaves_existing_value() {
        let h = harness(2, 3, &[]);
        let ids = ids();
        seed(&h.stores[&ids[1]], b"orig", 5).await;
        seed(&h.stores[&ids[2]], b"orig", 5).await;

        let add = Command::Add {
            key: key(),
            value: Bytes::from_static(b"new"),
            expiry: None,
        };
        assert_eq!(
            h.coordinator.execute(add).await,
            Response::NotStored(NotStoredReason::AlreadyExists)
        );

        // The cold replica gives the add back, even if it answered late
        let cold = &h.stores[&ids[0]];
        let mut withdrawn = false;
        for _ in 0..100 {
            if version_on(cold).await.is_none() {
                withdrawn = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(withdrawn, "rejected add stayed on the cold replica");

        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"orig"))
        );
        assert!(converged(&h.stores, 5).await);
    }

    #[tokio::test]
    async fn test_forged_cas_token_does_not_disturb_later_writes() {
        let h = harness(2, 2, &[]);
        assert_eq!(h.coordinator.execute(set(b"v1")).await, Response::Stored);

        let forged = |key: Bytes| Command::CompareAndSet {
            key,
            value: Bytes::from_static(b"x"),
            expiry: None,
            expected_version: u64::MAX,
        };
        assert_eq!(
            h.coordinator.execute(forged(Bytes::from_static(b"other"))).await,
            Response::NotFound
        );
        assert_eq!(h.coordinator.execute(forged(key())).await, Response::Conflict);

        assert_eq!(h.coordinator.execute(set(b"v2")).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_cas_on_entry_written_by_a_faster_clock() {
        let h = harness(3, 2, &[]);
        let ahead = h.coordinator.clock.mint() + (1 << 30);
        for store in h.stores.values() {
            seed(store, b"old", ahead).await;
        }

        let cas = Command::CompareAndSet {
            key: key(),
            value: Bytes::from_static(b"new"),
            expiry: None,
            expected_version: ahead,
        };
        assert_eq!(h.coordinator.execute(cas).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"new"))
        );
    }

    #[tokio::test]
    async fn test_delete_wins_over_replica_that_missed_it() {
        let h = harness(2, 3, &[]);
        let ids = ids();
        for store in h.stores.values() {
            seed(store, b"v", 5).await;
        }
        // A W = 2 delete that reached a and b only
        for id in &ids[..2] {
            h.stores[id]
                .write()
                .await
                .apply_delete(key(), 10, Precondition::None)
                .unwrap();
        }

        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::NotFound
        );

        let lagging = &h.stores[&ids[2]];
        let mut removed = false;
        for _ in 0..100 {
            if version_on(lagging).await.is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed, "read repair did not carry the delete");
        assert_eq!(lagging.read().await.tombstone(&key()), Some(10));
        for id in &ids[..2] {
            assert_eq!(version_on(&h.stores[id]).await, None);
        }
    }

    #[tokio::test]
    async fn test_delete_then_set_through_coordinator() {
        let h = harness(2, 2, &[]);
        h.coordinator.execute(set(b"v1")).await;
        h.coordinator.execute(Command::Delete { key: key() }).await;

        assert_eq!(h.coordinator.execute(set(b"v2")).await, Response::Stored);
        assert_eq!(
            h.coordinator.execute(Command::Get { key: key() }).await,
            Response::Value(Bytes::from_static(b"v2"))
        );
    }
}
