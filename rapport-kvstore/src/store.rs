use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rapport_core::state_machine::{Snapshot, StateMachine};
use rapport_core::{Command, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    entries: HashMap<String, String>,
    version: u64,
}

/// Deterministic key-value state machine.
///
/// Understands three commands, whitespace-separated:
///
/// - `SET <key> <value>` → `OK`
/// - `GET <key>` → the value, or `NOT_FOUND`
/// - `DEL <key>` → `OK`, or `NOT_FOUND`
///
/// The inner state is shared behind a lock so a host can keep a clone of
/// the machine for reads while the engine owns the applying side.
#[derive(Debug, Clone, Default)]
pub struct KvStateMachine {
    state: Arc<RwLock<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a key directly, outside consensus. Reflects whatever the
    /// engine has applied so far on this node.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.read().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// The full contents, for state comparison in tests and tooling.
    pub fn dump(&self) -> HashMap<String, String> {
        self.state.read().entries.clone()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&mut self, command: &Command) -> Result<Bytes> {
        let text = String::from_utf8_lossy(&command.data);
        let parts: Vec<&str> = text.split_whitespace().collect();

        let mut state = self.state.write();
        let reply = match parts.as_slice() {
            ["SET", key, value] => {
                state.entries.insert(key.to_string(), value.to_string());
                state.version += 1;
                Bytes::from("OK")
            }
            ["GET", key] => match state.entries.get(*key) {
                Some(value) => Bytes::from(value.clone()),
                None => Bytes::from("NOT_FOUND"),
            },
            ["DEL", key] => match state.entries.remove(*key) {
                Some(_) => {
                    state.version += 1;
                    Bytes::from("OK")
                }
                None => Bytes::from("NOT_FOUND"),
            },
            _ => Bytes::from("ERROR: invalid command"),
        };
        Ok(reply)
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let state = self.state.read();
        let data = serde_json::to_vec(&*state)?;
        Ok(Snapshot::new(state.version, data))
    }

    async fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.verify_checksum() {
            return Err(rapport_core::RapportError::ChecksumMismatch {
                expected: snapshot.checksum,
                actual: crc32fast::hash(&snapshot.data),
            });
        }
        let restored: KvState = serde_json::from_slice(&snapshot.data)?;
        debug!(
            "restored kv state at version {} ({} keys)",
            restored.version,
            restored.entries.len()
        );
        *self.state.write() = restored;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        *self.state.write() = KvState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_operations() {
        let mut kv = KvStateMachine::new();

        let result = kv.apply(&Command::new("SET name rapport")).await.unwrap();
        assert_eq!(result, Bytes::from("OK"));

        let result = kv.apply(&Command::new("GET name")).await.unwrap();
        assert_eq!(result, Bytes::from("rapport"));

        let result = kv.apply(&Command::new("GET missing")).await.unwrap();
        assert_eq!(result, Bytes::from("NOT_FOUND"));

        let result = kv.apply(&Command::new("DEL name")).await.unwrap();
        assert_eq!(result, Bytes::from("OK"));
        assert!(kv.is_empty());

        let result = kv.apply(&Command::new("DEL name")).await.unwrap();
        assert_eq!(result, Bytes::from("NOT_FOUND"));
    }

    #[tokio::test]
    async fn malformed_commands_do_not_mutate() {
        let mut kv = KvStateMachine::new();
        let before = kv.version();
        let result = kv.apply(&Command::new("FROB a b c")).await.unwrap();
        assert!(result.starts_with(b"ERROR"));
        assert_eq!(kv.version(), before);
    }

    #[tokio::test]
    async fn snapshot_restore_is_externally_indistinguishable() {
        let mut kv = KvStateMachine::new();
        kv.apply(&Command::new("SET a 1")).await.unwrap();
        kv.apply(&Command::new("SET b 2")).await.unwrap();
        kv.apply(&Command::new("DEL a")).await.unwrap();

        let snapshot = kv.snapshot().await.unwrap();

        let mut restored = KvStateMachine::new();
        restored.restore(&snapshot).await.unwrap();

        assert_eq!(restored.dump(), kv.dump());
        assert_eq!(restored.version(), kv.version());
        let result = restored.apply(&Command::new("GET b")).await.unwrap();
        assert_eq!(result, Bytes::from("2"));
    }

    #[tokio::test]
    async fn corrupt_snapshots_are_rejected() {
        let kv = KvStateMachine::new();
        let mut snapshot = kv.snapshot().await.unwrap();
        snapshot.checksum ^= 0xDEAD;

        let mut other = KvStateMachine::new();
        assert!(other.restore(&snapshot).await.is_err());
    }

    #[tokio::test]
    async fn reset_returns_to_the_initial_state() {
        let mut kv = KvStateMachine::new();
        kv.apply(&Command::new("SET a 1")).await.unwrap();
        kv.reset().await.unwrap();
        assert!(kv.is_empty());
        assert_eq!(kv.version(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_applied_state() {
        let mut kv = KvStateMachine::new();
        let reader = kv.clone();
        kv.apply(&Command::new("SET shared yes")).await.unwrap();
        assert_eq!(reader.get("shared"), Some("yes".to_string()));
    }
}
