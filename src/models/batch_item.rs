//! One item of a batch. Created once at batch creation; stage workers
//! flip the processed flag, never delete.

use crate::models::Reference;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub batch: Reference,
    pub name: String,
    pub item_no: u32,
    pub processed: bool,
}

impl BatchItem {
    pub fn new(batch: Reference, item_no: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: format!("{}-{item_no}", batch.name),
            batch,
            item_no,
            processed: false,
        }
    }

    pub fn reference(&self) -> Reference {
        Reference::new(&self.id, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_naming_follows_batch_name() {
        let item = BatchItem::new(Reference::new("b-1", "Nightly"), 3);
        assert_eq!(item.name, "Nightly-3");
        assert_eq!(item.batch.id, "b-1");
        assert!(!item.processed);
        assert_eq!(item.reference().name, "Nightly-3");
    }
}
