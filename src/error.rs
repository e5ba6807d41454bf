//! # Error Types
//!
//! Structured error handling for the broker client and batch orchestration
//! layers using thiserror instead of `Box<dyn Error>` patterns.
//!
//! Transient network faults are absorbed by the connection layer and never
//! surface here; everything in this enum is either a hard failure or a
//! caller/protocol contract violation.

use crate::messaging::connection::ConnectionRole;
use thiserror::Error;

/// Errors raised by the messaging and orchestration layers
#[derive(Error, Debug)]
pub enum BatchMqError {
    #[error("No connection available ({role})")]
    NoConnection { role: ConnectionRole },

    #[error("Broker protocol error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscriber {subscriber_id} is already subscribed")]
    AlreadySubscribed { subscriber_id: String },

    #[error("The batch {batch_id} has already been registered")]
    AlreadyRegistered { batch_id: String },

    #[error("Unsupported batch action: {action}")]
    UnsupportedAction { action: String },

    #[error("Invalid stage: {value}")]
    InvalidStage { value: String },

    #[error("No pending stage found for batch {batch_id}")]
    NoPendingStage { batch_id: String },

    #[error("A stage has processed more than expected: {stage} at {processed} of {item_count}")]
    StageOverflow {
        stage: String,
        processed: u32,
        item_count: u32,
    },

    #[error("Batch processing timeout for {batch_id}: processed {processed} of {expected}")]
    BatchTimeout {
        batch_id: String,
        processed: u32,
        expected: u32,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl BatchMqError {
    /// Create an already-subscribed error
    pub fn already_subscribed(subscriber_id: impl Into<String>) -> Self {
        Self::AlreadySubscribed {
            subscriber_id: subscriber_id.into(),
        }
    }

    /// Create an already-registered error
    pub fn already_registered(batch_id: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            batch_id: batch_id.into(),
        }
    }

    /// Create an unsupported-action error
    pub fn unsupported_action(action: impl Into<String>) -> Self {
        Self::UnsupportedAction {
            action: action.into(),
        }
    }

    /// Create a batch-timeout error carrying the last known progress
    pub fn batch_timeout(batch_id: impl Into<String>, processed: u32, expected: u32) -> Self {
        Self::BatchTimeout {
            batch_id: batch_id.into(),
            processed,
            expected,
        }
    }

    /// Create a not-found error for a repository entity
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchMqError>;
