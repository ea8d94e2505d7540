//! Membership Ring Module
//!
//! Tracks cluster members and maps keys to ordered replica lists with a
//! consistent-hash ring. Snapshots are copy-on-write and versioned.

mod hash_ring;
mod membership;
mod node;

pub use hash_ring::{position, HashRing};
pub use membership::{Membership, ReplicaSet, RingSnapshot};
pub use node::{Member, MembershipEvent, NodeId, NodeState};
