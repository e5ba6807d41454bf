//! # Queue Publisher
//!
//! One channel per publisher; the exchange is declared at construction so
//! publishing never races topology setup. Multi-message publishes are
//! wrapped in a broker-side transaction: consumers either see the whole
//! batch or none of it.

use crate::error::{BatchMqError, Result};
use crate::messaging::connection::ConnectionPair;
use crate::messaging::settings::RabbitClientSettings;
use crate::messaging::topology;
use lapin::options::BasicPublishOptions;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Publisher {
    channel: Channel,
    settings: RabbitClientSettings,
    token: CancellationToken,
    closed: AtomicBool,
}

impl Publisher {
    /// Open a channel on the producer connection and declare the exchange.
    pub async fn new(
        connections: &ConnectionPair,
        settings: RabbitClientSettings,
        token: CancellationToken,
    ) -> Result<Self> {
        let connection = connections.producer().connection().await?;
        let channel = connection.create_channel().await?;
        topology::configure_exchange(&channel, &settings).await?;
        Ok(Self {
            channel,
            settings,
            token,
            closed: AtomicBool::new(false),
        })
    }

    /// Publish a single message; defined as a batch publish of size one.
    pub async fn publish<T: Serialize>(
        &self,
        message: &T,
        routing_key: &str,
        headers: Option<FieldTable>,
        ttl_ms: Option<u32>,
    ) -> Result<()> {
        self.publish_all(std::slice::from_ref(message), routing_key, headers, ttl_ms)
            .await
    }

    /// Publish a list of messages.
    ///
    /// Lists longer than one are sent inside a broker transaction; any
    /// failure mid-list rolls the transaction back and re-raises, so no
    /// partial batch ever becomes visible to consumers. An observed
    /// cancellation also rolls back, but returns cleanly.
    pub async fn publish_all<T: Serialize>(
        &self,
        messages: &[T],
        routing_key: &str,
        headers: Option<FieldTable>,
        ttl_ms: Option<u32>,
    ) -> Result<()> {
        let transactional = messages.len() > 1;
        if transactional {
            self.channel.tx_select().await?;
        }

        for message in messages {
            if self.token.is_cancelled() {
                if transactional {
                    self.rollback().await;
                }
                debug!(
                    exchange = %self.settings.exchange_name,
                    routing_key,
                    "publish cancelled; stopping without partial commit"
                );
                return Ok(());
            }

            let body = match serde_json::to_vec(message) {
                Ok(body) => body,
                Err(e) => {
                    if transactional {
                        self.rollback().await;
                    }
                    return Err(BatchMqError::Serialization(e));
                }
            };

            let mut properties = BasicProperties::default()
                .with_delivery_mode(2)
                .with_content_type("application/json".into());
            if let Some(headers) = headers.clone() {
                properties = properties.with_headers(headers);
            }
            if let Some(ttl) = ttl_ms {
                properties = properties.with_expiration(ttl.to_string().into());
            }

            let sent = async {
                self.channel
                    .basic_publish(
                        &self.settings.exchange_name,
                        routing_key,
                        BasicPublishOptions::default(),
                        &body,
                        properties,
                    )
                    .await?
                    .await
            }
            .await;

            if let Err(e) = sent {
                if transactional {
                    self.rollback().await;
                }
                return Err(BatchMqError::Broker(e));
            }
        }

        if transactional {
            self.channel.tx_commit().await?;
        }

        debug!(
            exchange = %self.settings.exchange_name,
            routing_key,
            count = messages.len(),
            "published messages"
        );
        Ok(())
    }

    async fn rollback(&self) {
        if let Err(e) = self.channel.tx_rollback().await {
            warn!(
                exchange = %self.settings.exchange_name,
                error = %e,
                "transaction rollback failed"
            );
        }
    }

    /// Close the channel. Double close is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.channel.close(200, "publisher closed").await {
            debug!(
                exchange = %self.settings.exchange_name,
                error = %e,
                "publisher channel close failed"
            );
        }
    }
}
