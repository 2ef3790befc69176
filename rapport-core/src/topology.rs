//! Fixed cluster view and quorum arithmetic.

use crate::{NodeId, RapportError, Result};
use serde::{Deserialize, Serialize};

/// The fixed-size cluster view, constant for the engine's lifetime.
///
/// For a cluster of N nodes tolerating f crash faults:
/// quorum = ⌊N/2⌋ + 1, f = N − quorum, and the round-1 fast path engages at
/// the super-majority N − f.
///
/// # Examples
///
/// ```rust
/// use rapport_core::{NodeId, TopologyInfo};
///
/// let topo = TopologyInfo::new(
///     NodeId::from("n1"),
///     ["n1", "n2", "n3", "n4", "n5"].map(NodeId::from),
/// )
/// .unwrap();
/// assert_eq!(topo.quorum(), 3);
/// assert_eq!(topo.f_plus_one(), 3);
/// assert_eq!(topo.super_majority(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyInfo {
    self_id: NodeId,
    nodes: Vec<NodeId>,
    quorum: usize,
    f: usize,
    cluster_seed: u32,
}

impl TopologyInfo {
    pub fn new(self_id: NodeId, members: impl IntoIterator<Item = NodeId>) -> Result<Self> {
        let mut nodes: Vec<NodeId> = members.into_iter().collect();
        nodes.sort();
        nodes.dedup();

        if nodes.is_empty() {
            return Err(RapportError::configuration("cluster has no members"));
        }
        if !nodes.contains(&self_id) {
            return Err(RapportError::configuration(format!(
                "self id {} is not a cluster member",
                self_id
            )));
        }

        let n = nodes.len();
        let quorum = n / 2 + 1;
        let f = n - quorum;

        let mut hasher = crc32fast::Hasher::new();
        for node in &nodes {
            hasher.update(node.as_str().as_bytes());
            hasher.update(b"\0");
        }
        let cluster_seed = hasher.finalize();

        Ok(Self {
            self_id,
            nodes,
            quorum,
            f,
            cluster_seed,
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// All members, sorted lexicographically.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn f_plus_one(&self) -> usize {
        self.f + 1
    }

    pub fn super_majority(&self) -> usize {
        self.nodes.len() - self.f
    }

    /// Cluster-level constant feeding the shared coin.
    pub fn cluster_seed(&self) -> u32 {
        self.cluster_seed
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.binary_search(node).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(n: usize) -> TopologyInfo {
        let members: Vec<NodeId> = (1..=n).map(|i| NodeId::from(format!("n{i}"))).collect();
        TopologyInfo::new(members[0].clone(), members).unwrap()
    }

    #[test]
    fn quorum_arithmetic_per_cluster_size() {
        // (n, quorum, f+1, super-majority)
        let expected = [
            (1, 1, 1, 1),
            (2, 2, 1, 2),
            (3, 2, 2, 2),
            (4, 3, 2, 3),
            (5, 3, 3, 3),
            (6, 4, 3, 4),
            (7, 4, 4, 4),
            (9, 5, 5, 5),
        ];
        for (n, quorum, f_plus_one, super_majority) in expected {
            let info = topo(n);
            assert_eq!(info.quorum(), quorum, "quorum for n={n}");
            assert_eq!(info.f_plus_one(), f_plus_one, "f+1 for n={n}");
            assert_eq!(
                info.super_majority(),
                super_majority,
                "super-majority for n={n}"
            );
        }
    }

    #[test]
    fn members_are_sorted_and_deduplicated() {
        let info = TopologyInfo::new(
            NodeId::from("b"),
            ["c", "a", "b", "a"].map(NodeId::from),
        )
        .unwrap();
        assert_eq!(info.nodes().to_vec(), ["a", "b", "c"].map(NodeId::from).to_vec());
        assert!(info.contains(&NodeId::from("c")));
        assert!(!info.contains(&NodeId::from("d")));
    }

    #[test]
    fn seed_is_stable_across_member_orderings() {
        let a = TopologyInfo::new(NodeId::from("n1"), ["n1", "n2", "n3"].map(NodeId::from))
            .unwrap();
        let b = TopologyInfo::new(NodeId::from("n2"), ["n3", "n1", "n2"].map(NodeId::from))
            .unwrap();
        assert_eq!(a.cluster_seed(), b.cluster_seed());
    }

    #[test]
    fn self_must_be_a_member() {
        let err = TopologyInfo::new(NodeId::from("x"), ["n1", "n2"].map(NodeId::from));
        assert!(err.is_err());
    }
}
