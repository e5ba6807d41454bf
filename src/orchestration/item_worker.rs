//! # Batch Item Worker
//!
//! Per-batch stage processor: consumes every stage message for its batch
//! via a topic binding scoped to the batch id, persists per-item progress,
//! and acts as the completion barrier when the stage's last message
//! arrives. Any worker instance may receive the last message; the barrier
//! poll decouples "all items enqueued" from "all items processed".

use crate::error::{BatchMqError, Result};
use crate::messaging::connection::ConnectionPair;
use crate::messaging::message::{BatchMessage, QueueMessage};
use crate::messaging::settings::batch;
use crate::messaging::Subscriber;
use crate::models::BatchStage;
use crate::orchestration::sender::BatchMessageSender;
use crate::orchestration::PollPolicy;
use crate::repository::BatchRepository;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct BatchItemWorker {
    subscriber: Subscriber,
}

impl BatchItemWorker {
    /// Construct the worker and start consuming.
    ///
    /// Returns only after the broker has registered the consumer, so an
    /// awaited `spawn` doubles as the readiness signal the orchestrator
    /// sequences its first publish behind.
    pub async fn spawn(
        connections: &ConnectionPair,
        repository: Arc<dyn BatchRepository>,
        sender: Arc<dyn BatchMessageSender>,
        batch_id: &str,
        application: &str,
        tag: &str,
        policy: PollPolicy,
        token: &CancellationToken,
    ) -> Result<Self> {
        let settings = batch::for_batch_processing(batch_id)
            .as_consumer_settings(batch::all_stage_processing_key(batch_id));
        let subscriber = Subscriber::new(connections, settings, application, tag, token).await?;

        subscriber
            .subscribe::<QueueMessage<BatchMessage>, _, _>(move |message, subscriber_id, _headers| {
                let repository = Arc::clone(&repository);
                let sender = Arc::clone(&sender);
                let policy = policy.clone();
                async move {
                    process_stage_message(&repository, &sender, &policy, &subscriber_id, message)
                        .await
                }
            })
            .await?;

        debug!(
            batch_id,
            subscriber = %subscriber.subscriber_id(),
            "constructed batch item worker"
        );
        Ok(Self { subscriber })
    }

    pub fn subscriber_id(&self) -> &str {
        self.subscriber.subscriber_id()
    }

    /// Stop consuming and close the channel.
    pub async fn dispose(self) {
        debug!(subscriber = %self.subscriber.subscriber_id(), "disposing batch item worker");
        self.subscriber.cancel(true).await;
    }
}

/// Dispatch one stage message: item messages record progress, the last
/// message runs the completion barrier.
pub(crate) async fn process_stage_message(
    repository: &Arc<dyn BatchRepository>,
    sender: &Arc<dyn BatchMessageSender>,
    policy: &PollPolicy,
    subscriber_id: &str,
    message: QueueMessage<BatchMessage>,
) -> anyhow::Result<bool> {
    if message.body.is_last {
        process_last_message(repository, sender, policy, subscriber_id, &message).await?;
        return Ok(true);
    }
    process_batch_item(repository, policy, subscriber_id, &message).await?;
    Ok(true)
}

async fn process_batch_item(
    repository: &Arc<dyn BatchRepository>,
    policy: &PollPolicy,
    subscriber_id: &str,
    message: &QueueMessage<BatchMessage>,
) -> Result<()> {
    let stage = BatchStage::from_ordinal(message.body.item_stage)?;

    // Simulated work
    tokio::time::sleep(policy.work_delay).await;

    repository.mark_item_processed(&message.id).await?;
    repository
        .increment_stage(&message.linked_id, stage.as_str())
        .await?;

    debug!(
        item = %message.id,
        batch = %message.linked_id,
        %stage,
        subscriber = %subscriber_id,
        "processed batch item"
    );
    Ok(())
}

async fn process_last_message(
    repository: &Arc<dyn BatchRepository>,
    sender: &Arc<dyn BatchMessageSender>,
    policy: &PollPolicy,
    subscriber_id: &str,
    message: &QueueMessage<BatchMessage>,
) -> Result<()> {
    let stage = BatchStage::from_ordinal(message.body.item_stage)?;
    let batch_id = &message.linked_id;
    let deadline = tokio::time::Instant::now() + policy.poll_timeout;

    debug!(batch = %batch_id, %stage, subscriber = %subscriber_id, "processing last message");

    loop {
        let batch = repository.find_batch(batch_id).await?;
        let processed = batch.stage_processed(stage.as_str()).unwrap_or(0);
        if processed == batch.item_count {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BatchMqError::batch_timeout(
                batch_id,
                processed,
                batch.item_count,
            ));
        }
        tokio::time::sleep(policy.poll_interval).await;
    }

    sender.send_action(batch_id, batch::COMPLETED_ACTION).await?;
    info!(batch = %batch_id, %stage, subscriber = %subscriber_id, "sent completed processing message");
    Ok(())
}
