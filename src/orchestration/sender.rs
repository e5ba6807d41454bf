//! # Batch Message Sender
//!
//! The seam through which orchestration emits action and stage messages.
//! The broker-backed implementation opens a short-lived publisher per
//! call; tests substitute a recording implementation so saga decisions
//! stay observable without a broker.

use crate::error::Result;
use crate::messaging::connection::ConnectionPair;
use crate::messaging::message::{body_type, BatchMessage, QueueMessage};
use crate::messaging::settings::batch;
use crate::messaging::Publisher;
use crate::models::BatchStage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait BatchMessageSender: Send + Sync {
    /// Emit a control action for a batch on the actions fanout exchange.
    async fn send_action(&self, batch_id: &str, action: &str) -> Result<()>;

    /// Emit one stage's item messages, last message included, on the
    /// batch's stage-processing routing key.
    async fn send_stage_messages(
        &self,
        batch_id: &str,
        stage: BatchStage,
        messages: Vec<QueueMessage<BatchMessage>>,
    ) -> Result<()>;
}

pub struct RabbitBatchMessageSender {
    connections: Arc<ConnectionPair>,
    token: CancellationToken,
}

impl RabbitBatchMessageSender {
    pub fn new(connections: Arc<ConnectionPair>, token: CancellationToken) -> Self {
        Self { connections, token }
    }
}

#[async_trait]
impl BatchMessageSender for RabbitBatchMessageSender {
    async fn send_action(&self, batch_id: &str, action: &str) -> Result<()> {
        let settings = batch::for_batch_actions().as_client_settings();
        let publisher = Publisher::new(&self.connections, settings, self.token.clone()).await?;

        let message = QueueMessage {
            id: batch_id.to_string(),
            linked_id: String::new(),
            body_type: body_type::TEXT.to_string(),
            body: action.to_string(),
        };

        let result = publisher.publish(&message, action, None, None).await;
        publisher.close().await;
        result?;

        debug!(batch_id, action, "sent batch action message");
        Ok(())
    }

    async fn send_stage_messages(
        &self,
        batch_id: &str,
        stage: BatchStage,
        messages: Vec<QueueMessage<BatchMessage>>,
    ) -> Result<()> {
        let settings = batch::for_batch_processing(batch_id).as_client_settings();
        let publisher = Publisher::new(&self.connections, settings, self.token.clone()).await?;

        let result = publisher
            .publish_all(
                &messages,
                &batch::stage_processing_key(batch_id, stage),
                None,
                None,
            )
            .await;
        publisher.close().await;
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every send instead of touching a broker.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub actions: Mutex<Vec<(String, String)>>,
        pub stage_messages: Mutex<Vec<(String, BatchStage, Vec<QueueMessage<BatchMessage>>)>>,
    }

    #[async_trait]
    impl BatchMessageSender for RecordingSender {
        async fn send_action(&self, batch_id: &str, action: &str) -> Result<()> {
            self.actions
                .lock()
                .push((batch_id.to_string(), action.to_string()));
            Ok(())
        }

        async fn send_stage_messages(
            &self,
            batch_id: &str,
            stage: BatchStage,
            messages: Vec<QueueMessage<BatchMessage>>,
        ) -> Result<()> {
            self.stage_messages
                .lock()
                .push((batch_id.to_string(), stage, messages));
            Ok(())
        }
    }
}
