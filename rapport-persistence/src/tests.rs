#[cfg(test)]
mod unit_tests {
    use crate::{FileSystemStateStore, InMemoryStateStore};
    use rapport_core::persistence::{SavedState, SavedStateStore};
    use rapport_core::state_machine::Snapshot;
    use rapport_core::Phase;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryStateStore::new();

        assert!(store.load().await.unwrap().is_none());

        let first = b"hello world";
        store.save(first).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(first.to_vec()));

        let second = b"goodbye world";
        store.save(second).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(second.to_vec()));
    }

    #[tokio::test]
    async fn file_system_store_survives_reopening() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStateStore::new(temp_dir.path()).await.unwrap();

        assert!(store.load().await.unwrap().is_none());

        let data = b"persistent data";
        store.save(data).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(data.to_vec()));

        let reopened = FileSystemStateStore::new(temp_dir.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(data.to_vec()));

        let updated = b"updated persistent data";
        reopened.save(updated).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(updated.to_vec()));
    }

    #[tokio::test]
    async fn replacement_is_latest_wins() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStateStore::new(temp_dir.path()).await.unwrap();

        for phase in 1..=5u64 {
            let saved = SavedState::new(
                Phase::new(phase),
                Snapshot::new(phase, format!("state at {phase}")),
            );
            store.save(&saved.encode().unwrap()).await.unwrap();
        }

        let blob = store.load().await.unwrap().unwrap();
        let decoded = SavedState::decode(&blob).unwrap();
        assert_eq!(decoded.applied_phase, Phase::new(5));
    }

    #[tokio::test]
    async fn empty_blobs_are_preserved() {
        let store = InMemoryStateStore::new();
        store.save(b"").await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Vec::new()));
    }
}
