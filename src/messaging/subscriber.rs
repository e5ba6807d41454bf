//! # Queue Subscriber
//!
//! Delivers messages to a handler with acknowledgement control. The
//! handler's return drives the delivery outcome:
//!
//! - `Ok(true)` — acknowledge, message removed from the queue
//! - `Ok(false)` — reject with requeue, broker redelivers (typically to a
//!   competing consumer)
//! - `Err(_)` — reject without requeue, message goes to the dead-letter
//!   exchange
//!
//! A cancellation observed before dispatch leaves the message unacked for
//! redelivery on consumer teardown.
//!
//! Fanout topologies bind a per-instance auto-deleting queue so every
//! subscriber sees every message; topic/direct topologies share the named
//! queue as competing consumers under the configured prefetch.

use crate::error::{BatchMqError, Result};
use crate::messaging::connection::ConnectionPair;
use crate::messaging::settings::RabbitConsumerSettings;
use crate::messaging::topology;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Subscriber {
    channel: Channel,
    settings: RabbitConsumerSettings,
    subscriber_id: String,
    queue_name: String,
    token: CancellationToken,
    consumer_tag: parking_lot::Mutex<Option<String>>,
    subscribed: AtomicBool,
}

impl Subscriber {
    /// Open a channel on the consumer connection, declare the exchange and
    /// the queue, and bind it.
    ///
    /// The subscriber id is `{application}-{tag}-{suffix}` with a unique
    /// suffix per instance. The passed token is parented: cancelling this
    /// subscriber never cancels its siblings, while cancelling the parent
    /// reaches every subscriber in the group.
    pub async fn new(
        connections: &ConnectionPair,
        settings: RabbitConsumerSettings,
        application: &str,
        tag: &str,
        token: &CancellationToken,
    ) -> Result<Self> {
        let connection = connections.consumer().connection().await?;
        let channel = connection.create_channel().await?;
        topology::configure_exchange(&channel, &settings.client).await?;

        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        let (queue_name, auto_delete) = if settings.per_instance_queue() {
            (format!("{}-{}", settings.queue_name, suffix), true)
        } else {
            (settings.queue_name.clone(), false)
        };
        topology::configure_queue(&channel, &settings, &queue_name, auto_delete).await?;

        let subscriber_id = format!("{application}-{tag}-{suffix}");
        debug!(
            subscriber = %subscriber_id,
            queue = %queue_name,
            route_key = %settings.route_key,
            "subscriber constructed"
        );

        Ok(Self {
            channel,
            settings,
            subscriber_id,
            queue_name,
            token: token.child_token(),
            consumer_tag: parking_lot::Mutex::new(None),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Start consuming, dispatching every delivery to `handler`.
    ///
    /// May be called exactly once per subscriber; a second call raises an
    /// already-subscribed error. Returns once the broker has registered
    /// the consumer, which makes an awaited `subscribe` a readiness
    /// rendezvous for callers sequencing publishes after registration.
    pub async fn subscribe<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, String, Option<FieldTable>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send,
    {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(BatchMqError::already_subscribed(&self.subscriber_id));
        }

        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        *self.consumer_tag.lock() = Some(consumer.tag().as_str().to_string());

        let token = self.token.clone();
        let subscriber_id = self.subscriber_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(subscriber = %subscriber_id, "delivery loop cancelled");
                        break;
                    }
                    next = consumer.next() => {
                        match next {
                            None => {
                                debug!(subscriber = %subscriber_id, "consumer stream ended");
                                break;
                            }
                            Some(Err(e)) => {
                                // Channel-level shutdown or callback failure;
                                // surfaced as a log event only.
                                warn!(subscriber = %subscriber_id, error = %e, "consumer channel error");
                                break;
                            }
                            Some(Ok(delivery)) => {
                                if token.is_cancelled() {
                                    // Neither acked nor processed: broker
                                    // redelivers on consumer teardown.
                                    break;
                                }
                                dispatch(&handler, delivery, &subscriber_id).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop deliveries: cancel the broker consumer (non-blocking), fire
    /// this subscriber's cancellation token, and optionally close the
    /// channel too.
    pub async fn cancel(&self, close_channel: bool) {
        let tag = self.consumer_tag.lock().take();
        if let Some(tag) = tag {
            if let Err(e) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions { nowait: true })
                .await
            {
                warn!(subscriber = %self.subscriber_id, error = %e, "consumer cancel failed");
            }
        }
        self.token.cancel();
        if close_channel {
            if let Err(e) = self.channel.close(200, "subscriber cancelled").await {
                debug!(subscriber = %self.subscriber_id, error = %e, "subscriber channel close failed");
            }
        }
        debug!(subscriber = %self.subscriber_id, "subscriber cancelled");
    }

    /// Prefetch agreed with the broker for this subscriber
    pub fn prefetch_count(&self) -> u16 {
        self.settings.prefetch_count
    }
}

async fn dispatch<T, F, Fut>(handler: &F, delivery: Delivery, subscriber_id: &str)
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, String, Option<FieldTable>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    let headers = delivery.properties.headers().clone();

    let message: T = match serde_json::from_slice(&delivery.data) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                subscriber = %subscriber_id,
                error = %e,
                payload = %String::from_utf8_lossy(&delivery.data),
                "failed to decode delivery; rejecting to dead-letter"
            );
            reject(&delivery, subscriber_id).await;
            return;
        }
    };

    match handler(message, subscriber_id.to_string(), headers).await {
        Ok(true) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(subscriber = %subscriber_id, error = %e, "ack failed");
            }
        }
        Ok(false) => {
            // This instance declined the message; requeue so a competing
            // consumer picks it up.
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                warn!(subscriber = %subscriber_id, error = %e, "nack failed");
            }
        }
        Err(e) => {
            warn!(
                subscriber = %subscriber_id,
                error = %e,
                payload = %String::from_utf8_lossy(&delivery.data),
                "handler failed; rejecting to dead-letter"
            );
            reject(&delivery, subscriber_id).await;
        }
    }
}

async fn reject(delivery: &Delivery, subscriber_id: &str) {
    if let Err(e) = delivery.reject(BasicRejectOptions { requeue: false }).await {
        warn!(subscriber = %subscriber_id, error = %e, "reject failed");
    }
}
