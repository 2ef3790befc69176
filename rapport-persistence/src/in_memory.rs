use async_trait::async_trait;
use parking_lot::RwLock;
use rapport_core::persistence::SavedStateStore;
use rapport_core::Result;
use std::sync::Arc;

/// Volatile store backing tests and ephemeral nodes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SavedStateStore for InMemoryStateStore {
    async fn save(&self, state: &[u8]) -> Result<()> {
        let mut current = self.state.write();
        *current = Some(state.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().clone())
    }
}
