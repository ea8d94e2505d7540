//! Failure Detector Task
//!
//! Probes every peer on a fixed cadence and turns probe outcomes into
//! membership events. Runs on its own task; it only reads ring snapshots and
//! publishes events, so a slow probe never holds up client commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::current_timestamp_ms;
use crate::error::PeerError;
use crate::ring::{Membership, MembershipEvent, NodeId, NodeState};

/// Liveness check against one peer.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &NodeId) -> Result<(), PeerError>;
}

/// Probe cadence and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures before a member is declared dead
    pub failure_threshold: u32,
    /// Dead members are probed once every this many rounds
    pub recovery_probe_every: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(500),
            failure_threshold: 3,
            recovery_probe_every: 5,
        }
    }
}

pub struct FailureDetector {
    membership: Arc<Membership>,
    prober: Arc<dyn Prober>,
    settings: ProbeSettings,
    failures: HashMap<NodeId, u32>,
    last_hinted: HashMap<NodeId, Instant>,
    round: u64,
}

impl FailureDetector {
    pub fn new(membership: Arc<Membership>, prober: Arc<dyn Prober>, settings: ProbeSettings) -> Self {
        Self {
            membership,
            prober,
            settings,
            failures: HashMap::new(),
            last_hinted: HashMap::new(),
            round: 0,
        }
    }

    /// Feeds one probe outcome through the member's state machine and
    /// publishes the resulting event, if any.
    ///
    /// Alive -> Suspected on the first failure, -> Dead once the threshold of
    /// consecutive failures is reached; any success resets the count and
    /// recovers a suspected or dead member.
    pub fn record(&mut self, node: &NodeId, ok: bool) -> Option<MembershipEvent> {
        if node == self.membership.local_id() {
            return None;
        }
        let state = self.membership.snapshot().member(node)?.state;

        let event = if ok {
            self.failures.remove(node);
            self.membership
                .record_probe_success(node, current_timestamp_ms());
            match state {
                NodeState::Alive => None,
                NodeState::Suspected | NodeState::Dead => {
                    info!(%node, "Peer answered probe again");
                    Some(MembershipEvent::Recovered { node: node.clone() })
                }
            }
        } else {
            let count = self.failures.entry(node.clone()).or_insert(0);
            *count += 1;
            match state {
                NodeState::Dead => None,
                _ if *count >= self.settings.failure_threshold => {
                    warn!(%node, failures = *count, "Declaring peer dead");
                    Some(MembershipEvent::DeclaredDead { node: node.clone() })
                }
                NodeState::Alive => {
                    warn!(%node, "Peer missed a probe, suspecting it");
                    Some(MembershipEvent::Suspected { node: node.clone() })
                }
                NodeState::Suspected => None,
            }
        };

        if let Some(event) = &event {
            self.membership.apply(event.clone());
        }
        event
    }

    /// Probes every peer once, concurrently. Dead peers are only included
    /// every `recovery_probe_every` rounds.
    pub async fn probe_round(&mut self) -> Vec<MembershipEvent> {
        self.round += 1;
        let every = u64::from(self.settings.recovery_probe_every.max(1));
        let include_dead = self.round % every == 0;

        let snapshot = self.membership.snapshot();
        let targets: Vec<NodeId> = snapshot
            .members()
            .filter(|member| member.id != *self.membership.local_id())
            .filter(|member| member.state != NodeState::Dead || include_dead)
            .map(|member| member.id.clone())
            .collect();
        debug!(round = self.round, targets = targets.len(), "Probe round");

        let outcomes = join_all(
            targets
                .into_iter()
                .map(|node| probe_once(self.prober.clone(), node, self.settings.timeout)),
        )
        .await;

        outcomes
            .into_iter()
            .filter_map(|(node, ok)| self.record(&node, ok))
            .collect()
    }

    /// Out-of-cadence probe after a replica call failed. At most one per
    /// node per probe interval; dead nodes wait for their recovery round.
    pub async fn probe_hinted(&mut self, node: NodeId) -> Option<MembershipEvent> {
        let state = self.membership.snapshot().member(&node)?.state;
        if state == NodeState::Dead || node == *self.membership.local_id() {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = self.last_hinted.get(&node) {
            if now.duration_since(*last) < self.settings.interval {
                return None;
            }
        }
        self.last_hinted.insert(node.clone(), now);

        let (node, ok) = probe_once(self.prober.clone(), node, self.settings.timeout).await;
        self.record(&node, ok)
    }

    /// Probes on every tick and whenever a fault hint arrives.
    pub async fn run(mut self, mut hints: mpsc::UnboundedReceiver<NodeId>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut hints_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_round().await;
                }
                hint = hints.recv(), if hints_open => match hint {
                    Some(node) => {
                        self.probe_hinted(node).await;
                    }
                    None => {
                        debug!("Fault hint channel closed");
                        hints_open = false;
                    }
                },
            }
        }
    }
}

async fn probe_once(prober: Arc<dyn Prober>, node: NodeId, timeout: Duration) -> (NodeId, bool) {
    let ok = match tokio::time::timeout(timeout, prober.probe(&node)).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            debug!(%node, %error, "Probe failed");
            false
        }
        Err(_) => {
            debug!(%node, "Probe timed out");
            false
        }
    };
    (node, ok)
}

/// Spawns the detector loop. Abort the handle on shutdown.
pub fn spawn_failure_detector(
    detector: FailureDetector,
    hints: mpsc::UnboundedReceiver<NodeId>,
) -> JoinHandle<()> {
    info!(
        interval_ms = detector.settings.interval.as_millis() as u64,
        threshold = detector.settings.failure_threshold,
        "Starting failure detector"
    );
    tokio::spawn(detector.run(hints))
}

/// Logs every ring snapshot published after the call.
pub fn spawn_ring_logger(membership: &Membership) -> JoinHandle<()> {
    let mut updates = membership.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            let eligible = snapshot
                .members()
                .filter(|member| member.state.is_eligible())
                .count();
            info!(
                ring_version = snapshot.version(),
                members = snapshot.members().count(),
                eligible,
                "Ring updated"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Reachability {
        Up,
        Down,
        Hung,
    }

    #[derive(Default)]
    struct ScriptedProber {
        down: Mutex<HashMap<NodeId, Reachability>>,
        probes: Mutex<HashMap<NodeId, usize>>,
        total: AtomicUsize,
    }

    impl ScriptedProber {
        fn set(&self, node: &NodeId, reachability: Reachability) {
            self.down.lock().unwrap().insert(node.clone(), reachability);
        }

        fn probes_of(&self, node: &NodeId) -> usize {
            self.probes.lock().unwrap().get(node).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, node: &NodeId) -> Result<(), PeerError> {
            *self.probes.lock().unwrap().entry(node.clone()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            let reachability = self
                .down
                .lock()
                .unwrap()
                .get(node)
                .copied()
                .unwrap_or(Reachability::Up);
            match reachability {
                Reachability::Up => Ok(()),
                Reachability::Down => Err(PeerError::Unreachable(node.clone(), "refused".into())),
                Reachability::Hung => std::future::pending().await,
            }
        }
    }

    fn node(name: &str) -> NodeId {
        NodeId::from(name)
    }

    fn cluster() -> Arc<Membership> {
        Arc::new(Membership::new(
            node("a:1"),
            1,
            [(node("b:1"), 1), (node("c:1"), 1)],
            16,
        ))
    }

    fn settings(recovery_probe_every: u32) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(20),
            failure_threshold: 3,
            recovery_probe_every,
        }
    }

    fn state_of(membership: &Membership, id: &NodeId) -> NodeState {
        membership.snapshot().member(id).unwrap().state
    }

    fn placed(membership: &Membership, id: &NodeId) -> bool {
        let mut seen = HashSet::new();
        for i in 0..200 {
            let key = format!("key-{i}");
            seen.extend(membership.replicas_for(key.as_bytes(), 3).nodes);
        }
        seen.contains(id)
    }

    #[tokio::test]
    async fn test_three_failures_kill_and_one_success_revives() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let mut detector = FailureDetector::new(membership.clone(), prober.clone(), settings(1));
        let b = node("b:1");
        prober.set(&b, Reachability::Down);

        assert_eq!(
            detector.probe_round().await,
            vec![MembershipEvent::Suspected { node: b.clone() }]
        );
        assert_eq!(state_of(&membership, &b), NodeState::Suspected);
        assert!(placed(&membership, &b), "suspected nodes stay in placement");

        assert!(detector.probe_round().await.is_empty());
        assert_eq!(
            detector.probe_round().await,
            vec![MembershipEvent::DeclaredDead { node: b.clone() }]
        );
        assert_eq!(state_of(&membership, &b), NodeState::Dead);
        assert!(!placed(&membership, &b));

        prober.set(&b, Reachability::Up);
        assert_eq!(
            detector.probe_round().await,
            vec![MembershipEvent::Recovered { node: b.clone() }]
        );
        assert_eq!(state_of(&membership, &b), NodeState::Alive);
        assert!(placed(&membership, &b));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let mut detector = FailureDetector::new(membership.clone(), prober, settings(1));
        let c = node("c:1");

        detector.record(&c, false);
        detector.record(&c, false);
        assert_eq!(
            detector.record(&c, true),
            Some(MembershipEvent::Recovered { node: c.clone() })
        );

        // Counting starts over
        detector.record(&c, false);
        detector.record(&c, false);
        assert_eq!(state_of(&membership, &c), NodeState::Suspected);
    }

    #[tokio::test]
    async fn test_dead_nodes_probed_only_on_recovery_rounds() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let mut detector = FailureDetector::new(membership.clone(), prober.clone(), settings(4));
        let b = node("b:1");
        prober.set(&b, Reachability::Down);

        for _ in 0..3 {
            detector.probe_round().await;
        }
        assert_eq!(state_of(&membership, &b), NodeState::Dead);
        assert_eq!(prober.probes_of(&b), 3);

        // Round 4 is a recovery round, 5..7 skip the dead node
        for _ in 0..4 {
            detector.probe_round().await;
        }
        assert_eq!(prober.probes_of(&b), 4);
    }

    #[tokio::test]
    async fn test_local_node_never_probed() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let mut detector = FailureDetector::new(membership.clone(), prober.clone(), settings(1));

        detector.probe_round().await;
        assert_eq!(prober.probes_of(&node("a:1")), 0);
        assert_eq!(prober.total.load(Ordering::SeqCst), 2);
        assert!(detector.record(&node("a:1"), false).is_none());
    }

    #[tokio::test]
    async fn test_hung_probe_counts_as_failure() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let mut detector = FailureDetector::new(membership.clone(), prober.clone(), settings(1));
        let c = node("c:1");
        prober.set(&c, Reachability::Hung);

        let events = tokio::time::timeout(Duration::from_secs(1), detector.probe_round())
            .await
            .unwrap();
        assert_eq!(events, vec![MembershipEvent::Suspected { node: c }]);
    }

    #[tokio::test]
    async fn test_unknown_node_is_ignored() {
        let membership = cluster();
        let mut detector =
            FailureDetector::new(membership, Arc::new(ScriptedProber::default()), settings(1));
        assert!(detector.record(&node("z:9"), false).is_none());
    }

    #[tokio::test]
    async fn test_hint_triggers_out_of_cadence_probe() {
        let membership = cluster();
        let prober = Arc::new(ScriptedProber::default());
        let b = node("b:1");
        prober.set(&b, Reachability::Down);

        let slow = ProbeSettings {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(20),
            failure_threshold: 2,
            recovery_probe_every: 1,
        };
        let detector = FailureDetector::new(membership.clone(), prober.clone(), slow);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_failure_detector(detector, rx);

        // The first tick fires immediately and suspects b; the hint is the
        // second strike
        tx.send(b.clone()).unwrap();
        let mut dead = false;
        for _ in 0..100 {
            if state_of(&membership, &b) == NodeState::Dead {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(dead, "hinted probe should have declared b dead");
        assert_eq!(prober.probes_of(&b), 2);
    }
}
