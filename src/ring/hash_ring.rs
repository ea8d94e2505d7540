//! Consistent-hash ring.
//!
//! Every node owns `virtual_nodes * weight` points on a 64-bit circle. A key
//! belongs to the first points found walking clockwise from its own hash, so
//! adding or removing a node only moves the keys adjacent to its points.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::NodeId;

/// Position of an arbitrary label on the ring.
pub fn position(label: &[u8]) -> u64 {
    let digest = Sha256::digest(label);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, NodeId>,
}

impl HashRing {
    /// Builds a ring from `(node, weight)` pairs.
    ///
    /// Nodes are placed in ascending id order, whatever order they are given
    /// in, so colliding points always resolve the same way.
    pub fn build<'a>(nodes: impl IntoIterator<Item = (&'a NodeId, u32)>, virtual_nodes: u32) -> Self {
        let mut nodes: Vec<(&NodeId, u32)> = nodes.into_iter().collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));

        let mut ring = Self::default();
        for (node, weight) in nodes {
            ring.place(node, virtual_nodes.max(1) * weight.max(1));
        }
        ring
    }

    fn place(&mut self, node: &NodeId, points: u32) {
        for i in 0..points {
            let mut label = format!("{node}#{i}");
            let mut pos = position(label.as_bytes());
            while self.points.contains_key(&pos) {
                label.push_str(&format!("#{i}"));
                pos = position(label.as_bytes());
            }
            self.points.insert(pos, node.clone());
        }
    }

    /// Nodes in clockwise order starting at the key's position, wrapping once
    /// around the circle. A node appears once per point it owns.
    pub fn walk<'a>(&'a self, key: &[u8]) -> impl Iterator<Item = &'a NodeId> + 'a {
        let start = position(key);
        self.points
            .range(start..)
            .chain(self.points.range(..start))
            .map(|(_, node)| node)
    }

    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
