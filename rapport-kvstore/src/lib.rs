//! # Rapport KV Store
//!
//! The bundled deterministic key-value state machine. Hosts plug it into
//! the engine as-is or use it as the reference implementation of the
//! `StateMachine` contract.

mod store;

pub use store::KvStateMachine;
