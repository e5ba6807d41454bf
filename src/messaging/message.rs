//! # Wire Message Envelope
//!
//! The JSON envelope every queue message travels in, and the batch control
//! payload. Field names on the wire are PascalCase (`Id`, `LinkedId`,
//! `BodyType`, `Body`) for compatibility with existing producers.

use crate::error::Result;
use crate::models::Reference;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Body type discriminator tags
pub mod body_type {
    /// Batch control/data payload
    pub const BATCH_MESSAGE: &str = "BatchMessage";
    /// Plain string payload, used by action messages
    pub const TEXT: &str = "String";
}

/// Envelope for every published message.
///
/// `body_type` names the shape of `body` so receivers that consume a
/// generically-typed envelope (e.g. `QueueMessage<serde_json::Value>`)
/// can re-decode it into the concrete payload type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueMessage<B> {
    /// Item identity
    #[serde(default)]
    pub id: String,
    /// Parent/batch identity, empty when the message stands alone
    #[serde(default)]
    pub linked_id: String,
    /// Discriminator tag for `body`
    pub body_type: String,
    pub body: B,
}

impl<B: Serialize> QueueMessage<B> {
    /// Re-decode the body into a concrete type.
    ///
    /// Round-trips through `serde_json::Value` so it works regardless of
    /// how generically the envelope was deserialized.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_json::to_value(&self.body)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Control/data payload for batch stage processing.
///
/// Exactly one `is_last` message is emitted per stage per batch; it marks
/// that all item messages for the stage have been enqueued and carries no
/// item reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchMessage {
    #[serde(default)]
    pub is_first: bool,
    #[serde(default)]
    pub is_last: bool,
    /// Stage ordinal the item belongs to
    #[serde(default)]
    pub item_stage: u32,
    /// Number of items the barrier waits for (in-memory variant)
    #[serde(default)]
    pub expected_count: u32,
    /// The item being processed; absent on barrier messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
}

impl BatchMessage {
    /// Item message for one stage
    pub fn for_item(stage_ordinal: u32, reference: Reference) -> Self {
        Self {
            item_stage: stage_ordinal,
            reference: Some(reference),
            ..Default::default()
        }
    }

    /// Barrier message closing one stage
    pub fn last(stage_ordinal: u32) -> Self {
        Self {
            is_last: true,
            item_stage: stage_ordinal,
            ..Default::default()
        }
    }
}
