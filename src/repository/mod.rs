//! # Repository Contract
//!
//! The narrow persistence seam the orchestration layer consumes. A real
//! deployment backs this with a document store; the in-memory
//! implementation ships for tests and local runs.
//!
//! Every operation is atomic at the single-document level: concurrent
//! counter increments on the same batch must never lose updates.

pub mod memory;

use crate::error::Result;
use crate::models::{Batch, BatchItem};
use async_trait::async_trait;

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn find_batch(&self, id: &str) -> Result<Batch>;

    async fn insert_batch(&self, batch: &Batch) -> Result<()>;

    async fn insert_items(&self, items: &[BatchItem]) -> Result<()>;

    /// All items referencing the batch, in item order
    async fn items_for_batch(&self, batch_id: &str) -> Result<Vec<BatchItem>>;

    async fn mark_item_processed(&self, item_id: &str) -> Result<()>;

    /// Atomically add one to the batch's counter for `stage`
    async fn increment_stage(&self, batch_id: &str, stage: &str) -> Result<()>;
}

pub use memory::InMemoryBatchRepository;
