//! Versioned ring snapshots and the membership view that publishes them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{HashRing, Member, MembershipEvent, NodeId, NodeState};

/// Ordered replicas responsible for a key, bound to the ring version they
/// were computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaSet {
    pub ring_version: u64,
    pub nodes: Vec<NodeId>,
}

impl ReplicaSet {
    /// First replica, the authoritative copy for conditional writes.
    pub fn primary(&self) -> Option<&NodeId> {
        self.nodes.first()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Immutable view of the cluster. A new snapshot replaces the old one on
/// every membership change.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    version: u64,
    members: BTreeMap<NodeId, Member>,
    ring: HashRing,
    virtual_nodes: u32,
}

impl RingSnapshot {
    pub fn new(members: impl IntoIterator<Item = Member>, virtual_nodes: u32) -> Self {
        let members: BTreeMap<NodeId, Member> =
            members.into_iter().map(|m| (m.id.clone(), m)).collect();
        let ring = Self::build_ring(&members, virtual_nodes);
        Self {
            version: 1,
            members,
            ring,
            virtual_nodes,
        }
    }

    fn build_ring(members: &BTreeMap<NodeId, Member>, virtual_nodes: u32) -> HashRing {
        HashRing::build(members.values().map(|m| (&m.id, m.weight)), virtual_nodes)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, node: &NodeId) -> Option<&Member> {
        self.members.get(node)
    }

    /// The first `n` distinct eligible nodes clockwise from `key`.
    ///
    /// A pure function of the member set and their states: two nodes holding
    /// equal snapshots always compute the same list.
    pub fn replicas_for(&self, key: &[u8], n: usize) -> ReplicaSet {
        let eligible = |node: &NodeId| {
            self.members
                .get(node)
                .is_some_and(|member| member.state.is_eligible())
        };
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(n);
        for node in self.ring.walk(key) {
            if nodes.len() == n || seen.len() == self.members.len() {
                break;
            }
            if seen.insert(node) && eligible(node) {
                nodes.push(node.clone());
            }
        }
        ReplicaSet {
            ring_version: self.version,
            nodes,
        }
    }

    /// Snapshot after `event`, or None when the event changes nothing.
    fn apply(&self, event: &MembershipEvent) -> Option<RingSnapshot> {
        let mut next = self.clone();
        let current = self.members.get(event.node()).map(|m| (m.state, m.weight));

        let rebuild = match (event, current) {
            (MembershipEvent::Joined { node, weight }, None) => {
                next.members
                    .insert(node.clone(), Member::alive(node.clone(), *weight));
                true
            }
            (MembershipEvent::Joined { node, weight }, Some((state, old_weight))) => {
                let weight = (*weight).max(1);
                if state == NodeState::Alive && weight == old_weight {
                    return None;
                }
                if let Some(member) = next.members.get_mut(node) {
                    member.state = NodeState::Alive;
                    member.weight = weight;
                }
                weight != old_weight
            }
            (MembershipEvent::Left { node }, Some(_)) => {
                next.members.remove(node);
                true
            }
            (MembershipEvent::Suspected { node }, Some((NodeState::Alive, _))) => {
                next.set_state(node, NodeState::Suspected);
                false
            }
            (MembershipEvent::DeclaredDead { node }, Some((state, _))) if state != NodeState::Dead => {
                next.set_state(node, NodeState::Dead);
                false
            }
            (MembershipEvent::Recovered { node }, Some((state, _))) if state != NodeState::Alive => {
                next.set_state(node, NodeState::Alive);
                false
            }
            _ => return None,
        };

        if rebuild {
            next.ring = Self::build_ring(&next.members, next.virtual_nodes);
        }
        next.version = self.version + 1;
        Some(next)
    }

    fn set_state(&mut self, node: &NodeId, state: NodeState) {
        if let Some(member) = self.members.get_mut(node) {
            member.state = state;
        }
    }
}

/// The local node's view of the cluster.
///
/// Readers grab the latest `Arc<RingSnapshot>` and keep using it for the whole
/// operation; writers publish a fresh snapshot through a `watch` channel.
#[derive(Debug)]
pub struct Membership {
    local: NodeId,
    tx: watch::Sender<Arc<RingSnapshot>>,
}

impl Membership {
    /// Creates a view containing the local node and its configured peers,
    /// all presumed alive.
    pub fn new(
        local: NodeId,
        local_weight: u32,
        peers: impl IntoIterator<Item = (NodeId, u32)>,
        virtual_nodes: u32,
    ) -> Self {
        let members = std::iter::once(Member::alive(local.clone(), local_weight))
            .chain(
                peers
                    .into_iter()
                    .filter(|(id, _)| *id != local)
                    .map(|(id, weight)| Member::alive(id, weight)),
            );
        let (tx, _rx) = watch::channel(Arc::new(RingSnapshot::new(members, virtual_nodes)));
        Self { local, tx }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn current_version(&self) -> u64 {
        self.tx.borrow().version()
    }

    pub fn replicas_for(&self, key: &[u8], n: usize) -> ReplicaSet {
        self.snapshot().replicas_for(key, n)
    }

    /// Receives every snapshot published after subscribing.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RingSnapshot>> {
        self.tx.subscribe()
    }

    /// Applies a membership change and returns the resulting ring version.
    ///
    /// Liveness events about the local node are ignored: a node never
    /// suspects itself. Stored data is not migrated.
    pub fn apply(&self, event: MembershipEvent) -> u64 {
        if *event.node() == self.local && !matches!(event, MembershipEvent::Joined { .. }) {
            debug!(?event, "Ignoring membership event about the local node");
            return self.current_version();
        }

        let mut version = 0;
        self.tx.send_if_modified(|snapshot| {
            version = snapshot.version();
            match snapshot.apply(&event) {
                Some(next) => {
                    version = next.version();
                    *snapshot = Arc::new(next);
                    true
                }
                None => false,
            }
        });
        info!(?event, ring_version = version, "Membership change applied");
        version
    }

    /// Refreshes the last-successful-probe time of a member. Placement and
    /// version are unchanged, so subscribers are not woken.
    pub fn record_probe_success(&self, node: &NodeId, at_ms: u64) {
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.members.contains_key(node) {
                return false;
            }
            let mut next = RingSnapshot::clone(snapshot);
            if let Some(member) = next.members.get_mut(node) {
                member.last_probe_ok = Some(at_ms);
            }
            *snapshot = Arc::new(next);
            false
        });
    }
}
