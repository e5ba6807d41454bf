//! # Topology Declaration
//!
//! Stateless helpers declaring exchanges, queues, bindings and QoS.
//! Publisher and subscriber call the same functions, so topology is
//! declared consistently regardless of which side first touches it.
//!
//! Every exchange and queue carries a dead-letter-exchange argument and a
//! message TTL (one day unless the settings say otherwise).

use crate::error::Result;
use crate::messaging::settings::{RabbitClientSettings, RabbitConsumerSettings, DEAD_LETTER_EXCHANGE};
use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;

fn standard_arguments(settings: &RabbitClientSettings) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongInt(settings.effective_ttl_ms() as i32),
    );
    args
}

/// Declare the exchange described by the settings
pub async fn configure_exchange(channel: &Channel, settings: &RabbitClientSettings) -> Result<()> {
    channel
        .exchange_declare(
            &settings.exchange_name,
            settings.exchange_kind.clone(),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            standard_arguments(settings),
        )
        .await?;
    Ok(())
}

/// Declare a queue, bind it to the settings' exchange with the routing
/// key, and set the channel's prefetch. `auto_delete` is the caller's
/// call: per-instance fanout queues should not outlive their subscriber.
pub async fn configure_queue(
    channel: &Channel,
    settings: &RabbitConsumerSettings,
    queue_name: &str,
    auto_delete: bool,
) -> Result<()> {
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete,
                ..Default::default()
            },
            standard_arguments(&settings.client),
        )
        .await?;

    channel
        .queue_bind(
            queue_name,
            &settings.client.exchange_name,
            &settings.route_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    channel
        .basic_qos(settings.prefetch_count, BasicQosOptions { global: false })
        .await?;

    Ok(())
}
