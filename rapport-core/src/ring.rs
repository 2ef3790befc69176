//! Consistent hash ring.
//!
//! Auxiliary to the engine: sharded deployments use the ring for a stable
//! partition-to-node assignment. Each node is placed on the ring at a
//! configurable number of virtual points; a key is owned by the first node
//! clockwise from the key's hash. Removing a node only remaps the keys it
//! owned.

use crate::NodeId;
use std::collections::BTreeMap;

pub const DEFAULT_VIRTUAL_NODES: usize = 64;

#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u32, NodeId>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
        }
    }

    fn point(node: &NodeId, replica: usize) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(node.as_str().as_bytes());
        hasher.update(b"#");
        hasher.update(&(replica as u64).to_be_bytes());
        hasher.finalize()
    }

    pub fn add_node(&mut self, node: NodeId) {
        for replica in 0..self.virtual_nodes {
            self.ring.insert(Self::point(&node, replica), node.clone());
        }
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.ring.retain(|_, owner| owner != node);
    }

    /// The node owning `key`, or `None` on an empty ring.
    pub fn node_for(&self, key: &[u8]) -> Option<&NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.ring.values().cloned().collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}
