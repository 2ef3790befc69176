//! # Rapport Engine
//!
//! The consensus core: a leaderless, crash-fault-tolerant replication
//! engine running the Rabia two-round randomized voting protocol with a
//! super-majority fast path and a deterministic shared coin.
//!
//! ## Key Components
//!
//! - **RabiaEngine**: the phase/round state machine, run as a single
//!   owning task fed by the message router
//! - **TopologyManager**: connected-set tracking and edge-triggered
//!   quorum notifications
//! - **LeaderWitness**: deterministic singleton-leader selection from the
//!   connected topology
//! - **EngineConfig / TopologyConfig**: tuning knobs with production
//!   defaults
//!
//! ## Wiring order
//!
//! Routes are registered against a `RouterBuilder` before the router is
//! frozen; components that consume messages do so through channels created
//! ahead of time:
//!
//! ```rust,no_run
//! use rapport_core::{NodeId, RouterBuilder};
//! use rapport_engine::{engine_channel, register_witness_routes, LeaderWitness};
//! use tokio::sync::mpsc;
//!
//! let self_id = NodeId::from("n1");
//! let (handle, _events) = engine_channel(self_id.clone());
//! let (witness_tx, _witness_rx) = mpsc::unbounded_channel();
//!
//! let mut builder = RouterBuilder::new();
//! handle.register_routes(&mut builder);
//! register_witness_routes(&mut builder, witness_tx);
//! let router = builder.build();
//!
//! let _witness = LeaderWitness::new(self_id, router.clone());
//! // The engine and topology manager are constructed with the same router
//! // and started as tasks; see rapport-testing for a full cluster harness.
//! ```

pub mod config;
pub mod engine;
pub mod phase;
pub mod topology_manager;
pub mod witness;

pub use config::{EngineConfig, TopologyConfig};
pub use engine::{
    engine_channel, EngineEvent, EngineHandle, EngineMode, EngineStatus, RabiaEngine,
};
pub use phase::{shared_coin, DecisionRecord, PhaseState, Round1Outcome, Round2Outcome};
pub use topology_manager::{probe_route, register_probe_routes, TopologyManager};
pub use witness::{register_witness_routes, topology_route, LeaderWitness};
