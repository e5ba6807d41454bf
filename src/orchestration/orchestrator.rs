//! # Batch Orchestrator
//!
//! The saga controller. Batches are created synchronously; everything
//! after that is driven by action messages on the batch-actions fanout
//! exchange, never by direct calls between stages. Per-batch stage
//! workers are registered on the "start" action and disposed on the
//! "completed" action of the final stage.

use crate::error::{BatchMqError, Result};
use crate::messaging::connection::ConnectionPair;
use crate::messaging::message::{body_type, BatchMessage, QueueMessage};
use crate::messaging::settings::batch;
use crate::messaging::Subscriber;
use crate::models::{Batch, BatchItem, BatchStage, NewBatch, Reference};
use crate::orchestration::item_worker::BatchItemWorker;
use crate::orchestration::sender::BatchMessageSender;
use crate::orchestration::PollPolicy;
use crate::repository::BatchRepository;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fixed fan-out factor per batch, chosen to exercise competing-consumer
/// balancing across worker instances.
const WORKERS_PER_BATCH: usize = 2;

pub struct BatchOrchestrator {
    connections: Arc<ConnectionPair>,
    repository: Arc<dyn BatchRepository>,
    sender: Arc<dyn BatchMessageSender>,
    application: String,
    subscriber_tag: String,
    /// Batch id → its registered stage workers
    workers: DashMap<String, Vec<BatchItemWorker>>,
    action_subscriber: tokio::sync::Mutex<Option<Subscriber>>,
    policy: PollPolicy,
    token: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(
        connections: Arc<ConnectionPair>,
        repository: Arc<dyn BatchRepository>,
        sender: Arc<dyn BatchMessageSender>,
        application: impl Into<String>,
        subscriber_tag: impl Into<String>,
    ) -> Self {
        Self {
            connections,
            repository,
            sender,
            application: application.into(),
            subscriber_tag: subscriber_tag.into(),
            workers: DashMap::new(),
            action_subscriber: tokio::sync::Mutex::new(None),
            policy: PollPolicy::stage(),
            token: CancellationToken::new(),
        }
    }

    /// Override the stage workers' barrier timing (tests shrink it)
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribe to the batch-actions exchange and begin driving sagas.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let settings = batch::for_batch_actions().as_consumer_settings(batch::ALL_ACTIONS);
        let subscriber = Subscriber::new(
            &self.connections,
            settings,
            &self.application,
            &self.subscriber_tag,
            &self.token,
        )
        .await?;

        let orchestrator = Arc::clone(&self);
        subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |message, _subscriber_id, _headers| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator
                        .process_batch_action(message)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
            .await?;

        info!(
            application = %self.application,
            subscriber = %subscriber.subscriber_id(),
            "batch orchestrator started"
        );
        *self.action_subscriber.lock().await = Some(subscriber);
        Ok(())
    }

    /// Persist a new batch and its items, then kick off the saga with a
    /// single "start" action. Returns the created batch; processing
    /// continues asynchronously.
    pub async fn create_batch(&self, new_batch: NewBatch) -> Result<Batch> {
        let batch = Batch::new(&new_batch);
        self.repository.insert_batch(&batch).await?;

        let items: Vec<BatchItem> = (1..=new_batch.item_count)
            .map(|item_no| BatchItem::new(Reference::new(&batch.id, &batch.name), item_no))
            .collect();
        self.repository.insert_items(&items).await?;

        self.sender
            .send_action(&batch.id, batch::START_ACTION)
            .await?;

        info!(
            batch_id = %batch.id,
            name = %batch.name,
            item_count = batch.item_count,
            stages = batch.stages.len(),
            "batch created"
        );
        Ok(batch)
    }

    /// Drive the saga forward on an action message.
    ///
    /// Unsupported action bodies are a protocol violation and raise; the
    /// action subscriber then dead-letters the message.
    pub async fn process_batch_action(&self, message: QueueMessage<String>) -> Result<bool> {
        match message.body.as_str() {
            batch::START_ACTION => self.handle_start(&message.id).await?,
            batch::COMPLETED_ACTION => self.handle_completed(&message.id).await?,
            other => return Err(BatchMqError::unsupported_action(other)),
        }
        Ok(true)
    }

    async fn handle_start(&self, batch_id: &str) -> Result<()> {
        self.register_workers(batch_id).await?;
        let batch = self.repository.find_batch(batch_id).await?;
        let first_stage = batch.next_stage()?;
        self.publish_stage_messages(batch_id, first_stage).await
    }

    async fn handle_completed(&self, batch_id: &str) -> Result<()> {
        let batch = self.repository.find_batch(batch_id).await?;
        if batch.is_completed()? {
            self.deregister_workers(batch_id).await;
            info!(batch_id, "batch completed; stage workers removed");
            return Ok(());
        }
        let next_stage = batch.next_stage()?;
        self.publish_stage_messages(batch_id, next_stage).await
    }

    /// Register the batch's stage workers. Each `spawn` is awaited, so
    /// the workers' consumers are registered with the broker before this
    /// returns and the first publish cannot outrun them.
    async fn register_workers(&self, batch_id: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.workers.entry(batch_id.to_string()) {
            Entry::Occupied(_) => return Err(BatchMqError::already_registered(batch_id)),
            Entry::Vacant(entry) => {
                entry.insert(Vec::new());
            }
        }

        let mut spawned = Vec::with_capacity(WORKERS_PER_BATCH);
        for worker_no in 1..=WORKERS_PER_BATCH {
            let worker = BatchItemWorker::spawn(
                &self.connections,
                Arc::clone(&self.repository),
                Arc::clone(&self.sender),
                batch_id,
                &self.application,
                &format!("{}-{worker_no:03}", self.subscriber_tag),
                self.policy.clone(),
                &self.token,
            )
            .await;
            match worker {
                Ok(worker) => spawned.push(worker),
                Err(e) => {
                    self.workers.remove(batch_id);
                    for worker in spawned {
                        worker.dispose().await;
                    }
                    return Err(e);
                }
            }
        }
        self.workers.insert(batch_id.to_string(), spawned);
        debug!(batch_id, count = WORKERS_PER_BATCH, "stage workers registered");
        Ok(())
    }

    /// Dispose and forget the batch's workers. Idempotent: removal is
    /// keyed by batch id and a missing entry is not an error.
    async fn deregister_workers(&self, batch_id: &str) {
        if let Some((_, workers)) = self.workers.remove(batch_id) {
            for worker in workers {
                worker.dispose().await;
            }
            debug!(batch_id, "stage workers disposed");
        }
    }

    /// Emit one item message per batch item on the stage's routing key,
    /// closed by exactly one synthetic last message signalling that the
    /// stage's item set is fully enqueued.
    pub async fn publish_stage_messages(&self, batch_id: &str, stage: BatchStage) -> Result<()> {
        let items = self.repository.items_for_batch(batch_id).await?;

        let mut messages: Vec<QueueMessage<BatchMessage>> = items
            .iter()
            .map(|item| QueueMessage {
                id: item.id.clone(),
                linked_id: batch_id.to_string(),
                body_type: body_type::BATCH_MESSAGE.to_string(),
                body: BatchMessage::for_item(stage.ordinal(), item.reference()),
            })
            .collect();
        messages.push(QueueMessage {
            id: String::new(),
            linked_id: batch_id.to_string(),
            body_type: body_type::BATCH_MESSAGE.to_string(),
            body: BatchMessage::last(stage.ordinal()),
        });

        info!(
            batch_id,
            %stage,
            count = messages.len(),
            "publishing stage messages"
        );
        self.sender
            .send_stage_messages(batch_id, stage, messages)
            .await
    }

    /// Number of batches with registered workers
    pub fn registered_batches(&self) -> usize {
        self.workers.len()
    }

    /// Dispose every registered worker and stop consuming actions.
    pub async fn shutdown(&self) {
        let batch_ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for batch_id in batch_ids {
            self.deregister_workers(&batch_id).await;
        }
        if let Some(subscriber) = self.action_subscriber.lock().await.take() {
            subscriber.cancel(true).await;
        }
        self.token.cancel();
        info!(application = %self.application, "batch orchestrator shut down");
    }
}
