//! Node identity and liveness state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cache node: the `host:port` its peers reach it on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for NodeId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Liveness as seen by the local failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Alive,
    Suspected,
    Dead,
}

impl NodeState {
    /// Suspected nodes keep their ranges until they are declared dead.
    pub fn is_eligible(self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// A member of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub state: NodeState,
    /// Virtual node multiplier
    pub weight: u32,
    /// Unix milliseconds of the last successful probe
    pub last_probe_ok: Option<u64>,
}

impl Member {
    pub fn alive(id: NodeId, weight: u32) -> Self {
        Self {
            id,
            state: NodeState::Alive,
            weight: weight.max(1),
            last_probe_ok: None,
        }
    }
}

/// Changes fed into the ring by the failure detector, peers announcing
/// themselves, or an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MembershipEvent {
    Joined {
        node: NodeId,
        #[serde(default = "default_weight")]
        weight: u32,
    },
    Left {
        node: NodeId,
    },
    Suspected {
        node: NodeId,
    },
    DeclaredDead {
        node: NodeId,
    },
    Recovered {
        node: NodeId,
    },
}

fn default_weight() -> u32 {
    1
}

impl MembershipEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            MembershipEvent::Joined { node, .. }
            | MembershipEvent::Left { node }
            | MembershipEvent::Suspected { node }
            | MembershipEvent::DeclaredDead { node }
            | MembershipEvent::Recovered { node } => node,
        }
    }
}
