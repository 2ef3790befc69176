//! # Error Types
//!
//! Error handling for the Rapport replication engine.

use crate::{BatchId, NodeId, Phase};
use thiserror::Error;

/// Error conditions that can arise while running the replication engine.
///
/// Errors fall into a transient class (network hiccups, timeouts, missing
/// quorum) that callers may retry, and a permanent class (protocol
/// inconsistencies, corruption) that must stop the engine.
///
/// # Examples
///
/// ```rust
/// use rapport_core::RapportError;
///
/// let error = RapportError::network("connection refused");
/// assert!(error.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum RapportError {
    /// Network communication failure between nodes
    #[error("Network error: {message}")]
    Network { message: String },

    /// Persistent storage operation failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// State machine execution failure
    #[error("State machine error: {message}")]
    StateMachine { message: String },

    /// Consensus protocol violation or failure
    #[error("Consensus error: {message}")]
    Consensus { message: String },

    /// Invalid engine or topology configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Referenced command batch was not found in the local store
    #[error("Batch {batch_id} not found")]
    BatchNotFound { batch_id: BatchId },

    /// A batch was dropped before any phase decided it
    #[error("Batch {batch_id} evicted before a decision was reached")]
    BatchEvicted { batch_id: BatchId },

    /// Insufficient connected nodes to form a quorum
    #[error("Quorum not available: {current}/{required} nodes")]
    QuorumNotAvailable { current: usize, required: usize },

    /// The engine is dormant and cannot accept submissions
    #[error("Engine is dormant for node {node_id}")]
    EngineDormant { node_id: NodeId },

    /// The engine is shutting down
    #[error("Engine stopped")]
    EngineStopped,

    /// Two different decisions were observed for the same phase
    #[error("Conflicting decision for phase {phase}")]
    ConflictingDecision { phase: Phase },

    /// Data integrity check failed due to checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Operation exceeded its timeout limit
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding/decoding failure
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// File system or network I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results across the Rapport crates.
pub type Result<T> = std::result::Result<T, RapportError>;

impl RapportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn state_machine(message: impl Into<String>) -> Self {
        Self::StateMachine {
            message: message.into(),
        }
    }

    pub fn consensus(message: impl Into<String>) -> Self {
        Self::Consensus {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the operation that produced this error may be retried.
    ///
    /// Retryable errors are transient conditions that tend to resolve on
    /// their own; everything else indicates a permanent failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::QuorumNotAvailable { .. }
                | Self::EngineDormant { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RapportError::network("timed out").is_retryable());
        assert!(RapportError::QuorumNotAvailable {
            current: 1,
            required: 2
        }
        .is_retryable());
        assert!(!RapportError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!RapportError::EngineStopped.is_retryable());
    }
}
