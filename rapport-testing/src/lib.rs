//! # Rapport Testing
//!
//! In-memory transport and multi-node cluster harness used by the
//! integration suite. Not published.

pub mod cluster;
pub mod net;

pub use cluster::{build_node, test_engine_config, ClusterNode, TestCluster};
pub use net::{NetworkHub, NodeTransport, TrafficRecord};
