//! # In-Memory Repository
//!
//! Complete [`BatchRepository`] implementation storing batches and items
//! in process memory. Atomicity comes from taking the write lock for the
//! whole read-modify-write of each operation.

use crate::error::{BatchMqError, Result};
use crate::models::{Batch, BatchItem};
use crate::repository::BatchRepository;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct InMemoryBatchRepository {
    batches: RwLock<HashMap<String, Batch>>,
    items: RwLock<Vec<BatchItem>>,
}

impl InMemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for InMemoryBatchRepository {
    async fn find_batch(&self, id: &str) -> Result<Batch> {
        self.batches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BatchMqError::not_found("Batch", id))
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<()> {
        self.batches
            .write()
            .insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn insert_items(&self, items: &[BatchItem]) -> Result<()> {
        self.items.write().extend_from_slice(items);
        Ok(())
    }

    async fn items_for_batch(&self, batch_id: &str) -> Result<Vec<BatchItem>> {
        Ok(self
            .items
            .read()
            .iter()
            .filter(|item| item.batch.id == batch_id)
            .cloned()
            .collect())
    }

    async fn mark_item_processed(&self, item_id: &str) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| BatchMqError::not_found("BatchItem", item_id))?;
        item.processed = true;
        Ok(())
    }

    async fn increment_stage(&self, batch_id: &str, stage: &str) -> Result<()> {
        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| BatchMqError::not_found("Batch", batch_id))?;
        let progress = batch
            .stages
            .iter_mut()
            .find(|p| p.stage == stage)
            .ok_or_else(|| BatchMqError::not_found("Stage", stage))?;
        progress.processed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchStage, NewBatch, Reference};
    use std::sync::Arc;

    fn seeded_batch() -> Batch {
        Batch::new(&NewBatch {
            name: "B1".to_string(),
            item_count: 10,
            stages: vec![BatchStage::Stage1, BatchStage::Stage2],
        })
    }

    #[tokio::test]
    async fn test_insert_and_find_round_trip() {
        let repository = InMemoryBatchRepository::new();
        let batch = seeded_batch();
        repository.insert_batch(&batch).await.unwrap();

        let found = repository.find_batch(&batch.id).await.unwrap();
        assert_eq!(found.name, "B1");
        assert_eq!(found.stages.len(), 2);

        assert!(matches!(
            repository.find_batch("missing").await,
            Err(BatchMqError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_items_filtered_by_batch() {
        let repository = InMemoryBatchRepository::new();
        let batch = seeded_batch();
        let other = Reference::new("other", "Other");

        let items: Vec<_> = (1..=3)
            .map(|n| BatchItem::new(Reference::new(&batch.id, &batch.name), n))
            .chain((1..=2).map(|n| BatchItem::new(other.clone(), n)))
            .collect();
        repository.insert_items(&items).await.unwrap();

        let found = repository.items_for_batch(&batch.id).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|item| item.batch.id == batch.id));
    }

    #[tokio::test]
    async fn test_mark_item_processed() {
        let repository = InMemoryBatchRepository::new();
        let item = BatchItem::new(Reference::new("b", "B"), 1);
        repository.insert_items(&[item.clone()]).await.unwrap();

        repository.mark_item_processed(&item.id).await.unwrap();
        let items = repository.items_for_batch("b").await.unwrap();
        assert!(items[0].processed);
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_nothing() {
        let repository = Arc::new(InMemoryBatchRepository::new());
        let batch = seeded_batch();
        repository.insert_batch(&batch).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let repository = Arc::clone(&repository);
            let batch_id = batch.id.clone();
            handles.push(tokio::spawn(async move {
                repository.increment_stage(&batch_id, "Stage1").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let found = repository.find_batch(&batch.id).await.unwrap();
        assert_eq!(found.stage_processed("Stage1"), Some(100));
        assert_eq!(found.stage_processed("Stage2"), Some(0));
    }
}
