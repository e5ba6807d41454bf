//! # Exchange and Queue Settings
//!
//! Immutable topology settings passed to publishers and subscribers, plus
//! the fixed exchanges, queues and routing keys of the batch protocol.

use lapin::ExchangeKind;
use std::time::Duration;

/// Dead-letter exchange wired into every exchange and queue declaration
pub const DEAD_LETTER_EXCHANGE: &str = "exch-deadletter";

/// Default message TTL applied when settings carry none
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings shared by publishers and subscribers of one exchange
#[derive(Debug, Clone)]
pub struct RabbitClientSettings {
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    /// Per-message TTL in milliseconds; `None` falls back to one day
    pub time_to_live_ms: Option<u32>,
}

impl RabbitClientSettings {
    pub fn new(exchange_name: impl Into<String>, exchange_kind: ExchangeKind) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            exchange_kind,
            time_to_live_ms: None,
        }
    }

    /// Effective TTL in milliseconds for exchange/queue arguments
    pub fn effective_ttl_ms(&self) -> u32 {
        self.time_to_live_ms
            .unwrap_or(DEFAULT_MESSAGE_TTL.as_millis() as u32)
    }
}

/// Consumer-side settings: the client settings plus queue, binding and QoS
#[derive(Debug, Clone)]
pub struct RabbitConsumerSettings {
    pub client: RabbitClientSettings,
    pub queue_name: String,
    pub route_key: String,
    /// Maximum unacknowledged deliveries per consumer
    pub prefetch_count: u16,
}

impl RabbitConsumerSettings {
    /// Whether subscribers of this exchange bind a per-instance queue
    /// (fanout delivers every message to every subscriber) rather than
    /// sharing one named queue as competing consumers.
    pub fn per_instance_queue(&self) -> bool {
        matches!(self.client.exchange_kind, ExchangeKind::Fanout)
    }
}

/// A named exchange/queue pair of the batch protocol
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub queue_name: String,
    pub time_to_live_ms: Option<u32>,
}

impl QueueSettings {
    pub fn as_client_settings(&self) -> RabbitClientSettings {
        RabbitClientSettings {
            exchange_name: self.exchange_name.clone(),
            exchange_kind: self.exchange_kind.clone(),
            time_to_live_ms: self.time_to_live_ms,
        }
    }

    pub fn as_consumer_settings(&self, route_key: impl Into<String>) -> RabbitConsumerSettings {
        RabbitConsumerSettings {
            client: self.as_client_settings(),
            queue_name: self.queue_name.clone(),
            route_key: route_key.into(),
            prefetch_count: 5,
        }
    }
}

/// Fixed exchanges, queues and routing keys of the batch protocol
pub mod batch {
    use super::QueueSettings;
    use lapin::ExchangeKind;

    pub const ACTIONS_EXCHANGE: &str = "exch-batch-actions";
    pub const ACTIONS_QUEUE: &str = "queue-batch-actions";
    pub const PROCESSING_EXCHANGE: &str = "exch-batch-processing";
    pub const BARRIER_EXCHANGE: &str = "exch-batch";
    pub const MISC_EXCHANGE: &str = "exch-misc";

    pub const START_ACTION: &str = "batch-action-start";
    pub const COMPLETED_ACTION: &str = "batch-action-complete";
    pub const ALL_ACTIONS: &str = "batch-action.*";
    pub const BATCH_COMPLETED_KEY: &str = "misc.batchCompleted";

    /// Batch exchanges keep messages for ten minutes
    const BATCH_TTL_MS: u32 = 600_000;

    /// Actions travel on a fanout exchange so every orchestrator instance
    /// observes every action.
    pub fn for_batch_actions() -> QueueSettings {
        QueueSettings {
            exchange_name: ACTIONS_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Fanout,
            queue_name: ACTIONS_QUEUE.to_string(),
            time_to_live_ms: Some(BATCH_TTL_MS),
        }
    }

    /// Stage item messages travel on a topic exchange, one queue per batch.
    pub fn for_batch_processing(batch_id: &str) -> QueueSettings {
        QueueSettings {
            exchange_name: PROCESSING_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Topic,
            queue_name: format!("queue-batch-processing-{batch_id}"),
            time_to_live_ms: Some(BATCH_TTL_MS),
        }
    }

    /// Batch-scoped queue of the in-memory barrier variant.
    pub fn for_barrier_processing(batch_id: &str) -> QueueSettings {
        QueueSettings {
            exchange_name: BARRIER_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Topic,
            queue_name: format!("batch-queue.{batch_id}"),
            time_to_live_ms: Some(BATCH_TTL_MS),
        }
    }

    /// Fanout exchange for barrier progress notifications.
    pub fn for_misc() -> QueueSettings {
        QueueSettings {
            exchange_name: MISC_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Fanout,
            queue_name: "queue-misc".to_string(),
            time_to_live_ms: Some(BATCH_TTL_MS),
        }
    }

    /// Routing key for one stage's item messages
    pub fn stage_processing_key(batch_id: &str, stage: impl std::fmt::Display) -> String {
        format!("batch-processing-{batch_id}.{stage}")
    }

    /// Wildcard key matching every stage of one batch
    pub fn all_stage_processing_key(batch_id: &str) -> String {
        format!("batch-processing-{batch_id}.*")
    }

    /// Routing key of the barrier variant's item messages
    pub fn barrier_key(batch_id: &str) -> String {
        format!("batch.{batch_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_ttl_defaults_to_one_day() {
        let settings = RabbitClientSettings::new("exch-tests", ExchangeKind::Topic);
        assert_eq!(settings.effective_ttl_ms(), 86_400_000);

        let settings = RabbitClientSettings {
            time_to_live_ms: Some(5_000),
            ..settings
        };
        assert_eq!(settings.effective_ttl_ms(), 5_000);
    }

    #[test]
    fn test_fanout_binds_per_instance_queue() {
        let fanout = batch::for_batch_actions().as_consumer_settings(batch::ALL_ACTIONS);
        assert!(fanout.per_instance_queue());

        let topic = batch::for_batch_processing("b1")
            .as_consumer_settings(batch::all_stage_processing_key("b1"));
        assert!(!topic.per_instance_queue());
        assert_eq!(topic.prefetch_count, 5);
    }

    #[test]
    fn test_batch_route_keys() {
        assert_eq!(
            batch::stage_processing_key("abc", "Stage2"),
            "batch-processing-abc.Stage2"
        );
        assert_eq!(
            batch::all_stage_processing_key("abc"),
            "batch-processing-abc.*"
        );
        assert_eq!(batch::barrier_key("abc"), "batch.abc");
    }

    #[test]
    fn test_batch_processing_settings() {
        let settings = batch::for_batch_processing("b42");
        assert_eq!(settings.exchange_name, "exch-batch-processing");
        assert_eq!(settings.queue_name, "queue-batch-processing-b42");
        assert_eq!(settings.time_to_live_ms, Some(600_000));
    }
}
