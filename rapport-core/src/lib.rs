//! # Rapport Core
//!
//! Core building blocks for the Rapport replication engine:
//!
//! - **Types**: node, phase, batch, and vote identifiers
//! - **Messages**: the wired and local message families
//! - **Router**: typed in-process publish/subscribe
//! - **Topology**: fixed cluster view and quorum arithmetic
//! - **Batch store**: content-addressed cache of pending batches
//! - **State machine**: the contract user state machines satisfy
//! - **Persistence**: the `SavedState` anchor and its store contract
//! - **Ring**: consistent hashing for sharded deployments
//!
//! ## Example
//!
//! ```rust
//! use rapport_core::{NodeId, Phase, TopologyInfo};
//!
//! let topo = TopologyInfo::new(
//!     NodeId::from("n1"),
//!     ["n1", "n2", "n3"].map(NodeId::from),
//! )
//! .unwrap();
//! assert_eq!(topo.quorum(), 2);
//! assert_eq!(Phase::ZERO.next(), Phase::new(1));
//! ```

pub mod batch_store;
pub mod error;
pub mod messages;
pub mod network;
pub mod persistence;
pub mod ring;
pub mod router;
pub mod state_machine;
pub mod topology;
pub mod types;

pub use batch_store::BatchStore;
pub use error::{RapportError, Result};
pub use ring::HashRing;
pub use router::{RouteHandler, Router, RouterBuilder};
pub use topology::TopologyInfo;
pub use types::*;
