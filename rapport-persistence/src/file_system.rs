use async_trait::async_trait;
use rapport_core::persistence::SavedStateStore;
use rapport_core::{RapportError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File-backed store holding the single latest saved-state blob.
///
/// Replacement is atomic: the blob is written to a temporary file, fsynced,
/// and renamed over the previous one, so a crash mid-write leaves the old
/// record intact.
#[derive(Debug, Clone)]
pub struct FileSystemStateStore {
    state_file_path: PathBuf,
}

impl FileSystemStateStore {
    /// Creates the store under `data_dir`, creating the directory if
    /// needed.
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await.map_err(|e| {
                RapportError::persistence(format!("failed to create data directory: {}", e))
            })?;
        }

        Ok(Self {
            state_file_path: data_dir.join("state.dat"),
        })
    }
}

#[async_trait]
impl SavedStateStore for FileSystemStateStore {
    async fn save(&self, state: &[u8]) -> Result<()> {
        let temp_file_path = self.state_file_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file_path).await.map_err(|e| {
            RapportError::persistence(format!("failed to create temp state file: {}", e))
        })?;
        file.write_all(state).await.map_err(|e| {
            RapportError::persistence(format!("failed to write state to temp file: {}", e))
        })?;
        file.sync_all().await.map_err(|e| {
            RapportError::persistence(format!("failed to sync temp state file: {}", e))
        })?;
        drop(file);

        fs::rename(&temp_file_path, &self.state_file_path)
            .await
            .map_err(|e| {
                RapportError::persistence(format!(
                    "failed to rename temp file over state file: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.state_file_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RapportError::persistence(format!(
                "failed to read state file: {}",
                e
            ))),
        }
    }
}
