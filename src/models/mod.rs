pub mod batch;
pub mod batch_item;
pub mod reference;

pub use batch::{Batch, BatchStage, NewBatch, StageProgress};
pub use batch_item::BatchItem;
pub use reference::Reference;
