//! Content-addressed store of pending command batches.

use crate::{Batch, BatchId};
use dashmap::DashMap;
use std::time::Instant;

struct StoredBatch {
    batch: Batch,
    inserted_at: Instant,
}

/// Concurrent batch cache keyed by `BatchId`.
///
/// Entries are written once and never mutated; re-inserting an existing id
/// is a no-op so duplicate `NewBatch` deliveries cannot replace a batch.
#[derive(Default)]
pub struct BatchStore {
    batches: DashMap<BatchId, StoredBatch>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a batch, returning `false` when the id was already present.
    pub fn insert(&self, batch: Batch) -> bool {
        let mut inserted = false;
        self.batches.entry(batch.id.clone()).or_insert_with(|| {
            inserted = true;
            StoredBatch {
                batch,
                inserted_at: Instant::now(),
            }
        });
        inserted
    }

    pub fn get(&self, id: &BatchId) -> Option<Batch> {
        self.batches.get(id).map(|entry| entry.batch.clone())
    }

    pub fn contains(&self, id: &BatchId) -> bool {
        self.batches.contains_key(id)
    }

    pub fn remove(&self, id: &BatchId) -> Option<Batch> {
        self.batches.remove(id).map(|(_, stored)| stored.batch)
    }

    /// Keeps only the batches for which `keep` returns true, returning how
    /// many entries were dropped. Driven by the engine's cleanup tick.
    pub fn retain(&self, mut keep: impl FnMut(&BatchId, &Batch, Instant) -> bool) -> usize {
        let before = self.batches.len();
        self.batches
            .retain(|id, stored| keep(id, &stored.batch, stored.inserted_at));
        before.saturating_sub(self.batches.len())
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, CorrelationId, NodeId};

    fn batch(origin: &str, seq: u64, payload: &str) -> Batch {
        Batch::new(
            NodeId::from(origin),
            seq,
            vec![Command::new(payload.to_string())],
            CorrelationId::new(),
        )
    }

    #[test]
    fn entries_are_write_once() {
        let store = BatchStore::new();
        let original = batch("n1", 1, "SET a 1");
        assert!(store.insert(original.clone()));

        // Same id, different correlation; the first insert wins.
        let duplicate = Batch {
            correlation: CorrelationId::new(),
            ..original.clone()
        };
        assert!(!store.insert(duplicate));
        assert_eq!(
            store.get(&original.id).unwrap().correlation,
            original.correlation
        );
    }

    #[test]
    fn retain_drops_and_counts() {
        let store = BatchStore::new();
        let keep = batch("n1", 1, "SET a 1");
        let drop = batch("n2", 1, "SET b 2");
        store.insert(keep.clone());
        store.insert(drop.clone());

        let removed = store.retain(|id, _, _| *id == keep.id);
        assert_eq!(removed, 1);
        assert!(store.contains(&keep.id));
        assert!(!store.contains(&drop.id));
    }
}
