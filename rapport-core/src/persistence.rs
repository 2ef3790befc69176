//! Persisted engine state.
//!
//! The engine persists no command log; the only durable record is the
//! latest `SavedState` anchor: the applied phase and the state machine
//! snapshot taken at that phase. Replacement is latest-wins and atomic.

use crate::state_machine::Snapshot;
use crate::{Phase, RapportError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The persistent anchor used on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    pub applied_phase: Phase,
    pub snapshot: Snapshot,
    checksum: u32,
}

impl SavedState {
    pub fn new(applied_phase: Phase, snapshot: Snapshot) -> Self {
        let checksum = Self::compute_checksum(applied_phase, &snapshot);
        Self {
            applied_phase,
            snapshot,
            checksum,
        }
    }

    fn compute_checksum(applied_phase: Phase, snapshot: &Snapshot) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&applied_phase.value().to_be_bytes());
        hasher.update(&snapshot.version.to_be_bytes());
        hasher.update(&snapshot.data);
        hasher.finalize()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes and verifies a persisted blob. A checksum mismatch means the
    /// record is corrupt and must be treated as absent.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let state: SavedState = bincode::deserialize(bytes)?;
        let expected = Self::compute_checksum(state.applied_phase, &state.snapshot);
        if state.checksum != expected {
            return Err(RapportError::ChecksumMismatch {
                expected,
                actual: state.checksum,
            });
        }
        Ok(state)
    }
}

/// Stores the single latest `SavedState` blob.
#[async_trait]
pub trait SavedStateStore: Send + Sync {
    async fn save(&self, state: &[u8]) -> Result<()>;

    async fn load(&self) -> Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_state_round_trips() {
        let state = SavedState::new(Phase::new(37), Snapshot::new(4, "kv-bytes"));
        let encoded = state.encode().unwrap();
        let decoded = SavedState::decode(&encoded).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.applied_phase, Phase::new(37));
    }

    #[test]
    fn corrupted_blobs_are_rejected() {
        let state = SavedState::new(Phase::new(1), Snapshot::new(1, "data"));
        let mut encoded = state.encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(SavedState::decode(&encoded).is_err());
    }
}
