//! # In-Memory Barrier Processor
//!
//! The first/last barrier protocol without a persistence collaborator:
//! completion is counted in an injectable [`BarrierState`] store instead
//! of a durable batch record. Used for ad-hoc batches where nothing
//! outlives the run.
//!
//! On a "first" message the processor records the expected count, spins
//! up two subscribers on the batch-scoped queue, and — guarded by a lock
//! so racing registrants fan out at most once — publishes the item set
//! plus one last message. Item messages bump a per-(batch, worker)
//! counter; the last message polls the batch total, publishing progress
//! notifications while it waits, then tears the batch down.

use crate::error::{BatchMqError, Result};
use crate::messaging::connection::ConnectionPair;
use crate::messaging::message::{body_type, BatchMessage, QueueMessage};
use crate::messaging::settings::batch;
use crate::messaging::{Publisher, Subscriber};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestration::PollPolicy;

/// Mutex-guarded progress store for ad-hoc barrier batches.
///
/// Lifetime of an entry is tied to batch registration: `register` creates
/// it, `remove` deletes it with the batch's teardown. Nothing here
/// survives the process.
#[derive(Default)]
pub struct BarrierState {
    inner: Mutex<BarrierStateInner>,
}

#[derive(Default)]
struct BarrierStateInner {
    /// Batch id → item count the barrier waits for
    expected: HashMap<String, u32>,
    /// Batch id → per-worker processed counters
    processed: HashMap<String, HashMap<String, u32>>,
}

impl BarrierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch's expected count. Returns false when the batch was
    /// already registered (the count is left untouched).
    pub fn register(&self, batch_id: &str, expected_count: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.expected.contains_key(batch_id) {
            return false;
        }
        inner.expected.insert(batch_id.to_string(), expected_count);
        inner.processed.insert(batch_id.to_string(), HashMap::new());
        true
    }

    pub fn expected(&self, batch_id: &str) -> Option<u32> {
        self.inner.lock().expected.get(batch_id).copied()
    }

    /// Add one to the worker's counter; returns the worker's new count.
    pub fn increment(&self, batch_id: &str, subscriber_id: &str) -> u32 {
        let mut inner = self.inner.lock();
        let counters = inner.processed.entry(batch_id.to_string()).or_default();
        let count = counters.entry(subscriber_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Items processed across all of the batch's workers
    pub fn processed_total(&self, batch_id: &str) -> u32 {
        self.inner
            .lock()
            .processed
            .get(batch_id)
            .map(|counters| counters.values().sum())
            .unwrap_or(0)
    }

    /// Drop the batch's counters
    pub fn remove(&self, batch_id: &str) {
        let mut inner = self.inner.lock();
        inner.expected.remove(batch_id);
        inner.processed.remove(batch_id);
    }

    pub fn is_registered(&self, batch_id: &str) -> bool {
        self.inner.lock().expected.contains_key(batch_id)
    }
}

pub struct BarrierBatchProcessor {
    connections: Arc<ConnectionPair>,
    state: Arc<BarrierState>,
    application: String,
    /// Batch id → its two item subscribers
    subscribers: DashMap<String, Vec<Subscriber>>,
    /// Batches whose item set has been published; the lock is held across
    /// the publish so racing registrants fan out at most once.
    published: tokio::sync::Mutex<HashSet<String>>,
    policy: PollPolicy,
    token: CancellationToken,
}

impl BarrierBatchProcessor {
    pub fn new(
        connections: Arc<ConnectionPair>,
        state: Arc<BarrierState>,
        application: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            connections,
            state,
            application: application.into(),
            subscribers: DashMap::new(),
            published: tokio::sync::Mutex::new(HashSet::new()),
            policy: PollPolicy::barrier(),
            token,
        }
    }

    /// Override the barrier timing (tests shrink it)
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Entry point for control messages from the host's subscription.
    ///
    /// Only barrier markers are accepted here: "first" starts a batch,
    /// "last" is a defensive external teardown. Plain item messages never
    /// arrive on this path and raise.
    pub async fn process_message(
        self: Arc<Self>,
        message: QueueMessage<BatchMessage>,
        service_id: &str,
    ) -> Result<()> {
        if message.body.is_first {
            return Self::handle_first(&self, &message, service_id).await;
        }
        if message.body.is_last {
            self.cleanup(&message.linked_id).await;
            return Ok(());
        }
        Err(BatchMqError::unsupported_action(
            "only first and last barrier messages are accepted",
        ))
    }

    async fn handle_first(
        this: &Arc<Self>,
        message: &QueueMessage<BatchMessage>,
        service_id: &str,
    ) -> Result<()> {
        let batch_id = message.linked_id.clone();
        let expected = message.body.expected_count;
        this.state.register(&batch_id, expected);

        let settings = batch::for_barrier_processing(&batch_id)
            .as_consumer_settings(batch::barrier_key(&batch_id));
        let mut spawned = Vec::with_capacity(2);
        for subscriber_no in 1..=2 {
            let subscriber = Subscriber::new(
                &this.connections,
                settings.clone(),
                &this.application,
                &format!("{subscriber_no:03}"),
                &this.token,
            )
            .await?;

            let processor = Arc::clone(this);
            subscriber
                .subscribe::<QueueMessage<BatchMessage>, _, _>(
                    move |message, subscriber_id, _headers| {
                        let processor = Arc::clone(&processor);
                        async move {
                            processor
                                .handle_item_message(message, &subscriber_id)
                                .await
                        }
                    },
                )
                .await?;
            spawned.push(subscriber);
        }
        this.subscribers.entry(batch_id.clone()).or_default().extend(spawned);

        this.publish_batch_items(&batch_id, expected, service_id)
            .await
    }

    async fn publish_batch_items(
        &self,
        batch_id: &str,
        expected: u32,
        service_id: &str,
    ) -> Result<()> {
        let mut published = self.published.lock().await;
        if published.contains(batch_id) {
            return Ok(());
        }

        let settings = batch::for_barrier_processing(batch_id).as_client_settings();
        let publisher = Publisher::new(&self.connections, settings, self.token.clone()).await?;

        let mut messages: Vec<QueueMessage<BatchMessage>> = (1..=expected)
            .map(|item_no| QueueMessage {
                id: format!("{item_no}|{}", Uuid::new_v4()),
                linked_id: batch_id.to_string(),
                body_type: body_type::BATCH_MESSAGE.to_string(),
                body: BatchMessage {
                    item_stage: 0,
                    expected_count: expected,
                    ..Default::default()
                },
            })
            .collect();
        messages.push(QueueMessage {
            id: "LastMessage".to_string(),
            linked_id: batch_id.to_string(),
            body_type: body_type::BATCH_MESSAGE.to_string(),
            body: BatchMessage {
                is_last: true,
                item_stage: 0,
                expected_count: expected,
                ..Default::default()
            },
        });

        let result = publisher
            .publish_all(&messages, &batch::barrier_key(batch_id), None, None)
            .await;
        publisher.close().await;
        result?;

        published.insert(batch_id.to_string());
        info!(batch_id, expected, service_id, "created barrier batch items");
        Ok(())
    }

    async fn handle_item_message(
        &self,
        message: QueueMessage<BatchMessage>,
        subscriber_id: &str,
    ) -> anyhow::Result<bool> {
        if message.body.is_last {
            self.handle_last_message(&message, subscriber_id).await?;
            return Ok(true);
        }

        tokio::time::sleep(self.policy.work_delay).await;
        let count = self.state.increment(&message.linked_id, subscriber_id);
        debug!(
            item = %message.id,
            batch = %message.linked_id,
            subscriber = %subscriber_id,
            count,
            "completed barrier item"
        );
        Ok(true)
    }

    async fn handle_last_message(
        &self,
        message: &QueueMessage<BatchMessage>,
        subscriber_id: &str,
    ) -> Result<()> {
        let batch_id = message.linked_id.clone();
        let expected = self
            .state
            .expected(&batch_id)
            .ok_or_else(|| BatchMqError::not_found("Barrier batch", &batch_id))?;
        let deadline = tokio::time::Instant::now() + self.policy.poll_timeout;

        debug!(batch = %batch_id, subscriber = %subscriber_id, "processing barrier last message");

        loop {
            let processed = self.state.processed_total(&batch_id);
            if processed >= expected {
                info!(
                    batch = %batch_id,
                    expected,
                    subscriber = %subscriber_id,
                    "barrier batch completed"
                );
                self.send_progress(&batch_id, expected).await?;
                self.cleanup(&batch_id).await;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    batch = %batch_id,
                    processed,
                    expected,
                    subscriber = %subscriber_id,
                    "barrier batch timeout"
                );
                self.cleanup(&batch_id).await;
                return Err(BatchMqError::batch_timeout(&batch_id, processed, expected));
            }

            self.send_progress(&batch_id, processed).await?;
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Publish an incremental progress notification on the misc fanout
    /// exchange. The count travels in `expected_count`, matching what
    /// progress consumers already decode.
    async fn send_progress(&self, batch_id: &str, processed: u32) -> Result<()> {
        let settings = batch::for_misc().as_client_settings();
        let publisher = Publisher::new(&self.connections, settings, self.token.clone()).await?;

        let message = QueueMessage {
            id: String::new(),
            linked_id: batch_id.to_string(),
            body_type: body_type::BATCH_MESSAGE.to_string(),
            body: BatchMessage {
                is_last: true,
                expected_count: processed,
                ..Default::default()
            },
        };

        let result = publisher
            .publish(&message, batch::BATCH_COMPLETED_KEY, None, None)
            .await;
        publisher.close().await;
        result
    }

    /// Tear down a batch: counters, subscribers and the published flag.
    async fn cleanup(&self, batch_id: &str) {
        self.state.remove(batch_id);
        if let Some((_, subscribers)) = self.subscribers.remove(batch_id) {
            for subscriber in subscribers {
                subscriber.cancel(true).await;
            }
        }
        self.published.lock().await.remove(batch_id);
        debug!(batch_id, "barrier batch cleaned up");
    }

    /// Number of batches currently holding subscribers
    pub fn active_batches(&self) -> usize {
        self.subscribers.len()
    }
}
