use crate::{Command, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque capture of a state machine's complete state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub data: Bytes,
    pub checksum: u32,
}

impl Snapshot {
    pub fn new(version: u64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = crc32fast::hash(&data);
        Self {
            version,
            data,
            checksum,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

/// Contract the user's replicated state machine must satisfy.
///
/// `apply` must be deterministic and pure with respect to the machine's own
/// state: every node applies the same decided batches in the same order and
/// must end up externally indistinguishable.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies one command, returning its result.
    async fn apply(&mut self, command: &Command) -> Result<Bytes>;

    /// Applies a decided batch in order. The default runs commands one by
    /// one; implementations may override for bulk application.
    async fn apply_batch(&mut self, commands: &[Command]) -> Result<Vec<Bytes>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.apply(command).await?);
        }
        Ok(results)
    }

    /// Captures the complete state.
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Replaces the state with the given snapshot.
    async fn restore(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Returns to the known initial state.
    async fn reset(&mut self) -> Result<()>;
}
