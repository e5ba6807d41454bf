//! Broker integration tests for the publisher/subscriber contract:
//! competing-consumer balancing, fanout completeness, requeue on consumer
//! loss, dead-letter isolation of poison messages, and transactional
//! batch publishing.

mod common;

use batchmq::messaging::settings::{RabbitClientSettings, RabbitConsumerSettings, DEAD_LETTER_EXCHANGE};
use batchmq::messaging::{HandleState, Publisher, QueueMessage, Subscriber};
use batchmq::BatchMqError;
use lapin::ExchangeKind;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn topic_settings(exchange: &str, queue: &str, prefetch: u16) -> RabbitConsumerSettings {
    RabbitConsumerSettings {
        client: RabbitClientSettings::new(exchange, ExchangeKind::Topic),
        queue_name: queue.to_string(),
        route_key: "queue-topic.*".to_string(),
        prefetch_count: prefetch,
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_competing_consumers_split_topic_messages_evenly() {
    let pair = common::connected_pair().await;
    let settings = topic_settings(
        &common::unique("exch-topic-tests"),
        &common::unique("queue-topic-tests"),
        5,
    );
    let token = CancellationToken::new();

    let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let mut subscribers = Vec::new();
    for n in 0..2 {
        let subscriber = Subscriber::new(
            &pair,
            settings.clone(),
            "RabbitTests",
            &format!("{:03}", n + 1),
            &token,
        )
        .await
        .unwrap();
        let counts = Arc::clone(&counts);
        subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |_message, _subscriber_id, _headers| {
                let counts = Arc::clone(&counts);
                async move {
                    counts[n].fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
        subscribers.push(subscriber);
    }

    let publisher = Publisher::new(&pair, settings.client.clone(), token.clone())
        .await
        .unwrap();
    for i in 0..10 {
        publisher
            .publish(
                &common::text_message(format!("m-{i}")),
                "queue-topic.test",
                None,
                None,
            )
            .await
            .unwrap();
    }

    let drained = common::wait_until(Duration::from_secs(10), || {
        counts[0].load(Ordering::SeqCst) + counts[1].load(Ordering::SeqCst) == 10
    })
    .await;
    assert!(drained, "messages were not drained in time");
    assert_eq!(counts[0].load(Ordering::SeqCst), 5);
    assert_eq!(counts[1].load(Ordering::SeqCst), 5);

    publisher.close().await;
    for subscriber in subscribers {
        subscriber.cancel(true).await;
    }
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_fanout_delivers_every_message_to_every_subscriber() {
    let pair = common::connected_pair().await;
    let settings = RabbitConsumerSettings {
        client: RabbitClientSettings::new(&common::unique("exch-fanout-tests"), ExchangeKind::Fanout),
        queue_name: common::unique("queue-fanout-tests"),
        route_key: String::new(),
        prefetch_count: 5,
    };
    let token = CancellationToken::new();

    let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let mut subscribers = Vec::new();
    for n in 0..2 {
        let subscriber = Subscriber::new(
            &pair,
            settings.clone(),
            "RabbitTests",
            &format!("{:03}", n + 1),
            &token,
        )
        .await
        .unwrap();
        // Fanout gives each instance its own queue
        assert_ne!(subscriber.queue_name(), settings.queue_name);
        let counts = Arc::clone(&counts);
        subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |_message, _subscriber_id, _headers| {
                let counts = Arc::clone(&counts);
                async move {
                    counts[n].fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
        subscribers.push(subscriber);
    }

    let publisher = Publisher::new(&pair, settings.client.clone(), token.clone())
        .await
        .unwrap();
    for i in 0..10 {
        publisher
            .publish(&common::text_message(format!("m-{i}")), "ignored", None, None)
            .await
            .unwrap();
    }

    let drained = common::wait_until(Duration::from_secs(10), || {
        counts[0].load(Ordering::SeqCst) == 10 && counts[1].load(Ordering::SeqCst) == 10
    })
    .await;
    assert!(drained, "fanout subscribers did not both receive all messages");

    publisher.close().await;
    for subscriber in subscribers {
        subscriber.cancel(true).await;
    }
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_cancelled_subscriber_messages_requeue_to_survivor() {
    let pair = common::connected_pair().await;
    let settings = topic_settings(
        &common::unique("exch-requeue-tests"),
        &common::unique("queue-requeue-tests"),
        1,
    );
    let token = CancellationToken::new();

    let processed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let doomed_count = Arc::new(AtomicUsize::new(0));

    let survivor = Subscriber::new(&pair, settings.clone(), "RabbitTests", "001", &token)
        .await
        .unwrap();
    {
        let processed = Arc::clone(&processed);
        survivor
            .subscribe::<QueueMessage<String>, _, _>(move |message, _subscriber_id, _headers| {
                let processed = Arc::clone(&processed);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    processed.lock().insert(message.id);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
    }

    let doomed = Subscriber::new(&pair, settings.clone(), "RabbitTests", "002", &token)
        .await
        .unwrap();
    {
        let processed = Arc::clone(&processed);
        let doomed_count = Arc::clone(&doomed_count);
        doomed
            .subscribe::<QueueMessage<String>, _, _>(move |message, _subscriber_id, _headers| {
                let processed = Arc::clone(&processed);
                let doomed_count = Arc::clone(&doomed_count);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    processed.lock().insert(message.id);
                    doomed_count.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
    }

    let publisher = Publisher::new(&pair, settings.client.clone(), token.clone())
        .await
        .unwrap();
    for i in 0..10 {
        publisher
            .publish(
                &common::text_message(format!("m-{i}")),
                "queue-topic.test",
                None,
                None,
            )
            .await
            .unwrap();
    }

    // Kill one consumer mid-stream; its unacked deliveries must requeue.
    let started = common::wait_until(Duration::from_secs(10), || {
        doomed_count.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(started, "doomed subscriber never got going");
    doomed.cancel(true).await;

    let drained = common::wait_until(Duration::from_secs(20), || processed.lock().len() == 10).await;
    assert!(
        drained,
        "survivor did not drain the queue: {} of 10 processed",
        processed.lock().len()
    );

    publisher.close().await;
    survivor.cancel(true).await;
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_poison_message_is_dead_lettered_not_redelivered() {
    let pair = common::connected_pair().await;
    let settings = topic_settings(
        &common::unique("exch-poison-tests"),
        &common::unique("queue-poison-tests"),
        5,
    );
    let token = CancellationToken::new();

    // Catch everything routed to the dead-letter exchange.
    let dead_lettered: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let dlx_settings = RabbitConsumerSettings {
        client: RabbitClientSettings::new(DEAD_LETTER_EXCHANGE, ExchangeKind::Topic),
        queue_name: common::unique("queue-deadletter-tests"),
        route_key: "#".to_string(),
        prefetch_count: 5,
    };
    let dlx_subscriber = Subscriber::new(&pair, dlx_settings, "RabbitTests", "dlx", &token)
        .await
        .unwrap();
    {
        let dead_lettered = Arc::clone(&dead_lettered);
        dlx_subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |message, _subscriber_id, _headers| {
                let dead_lettered = Arc::clone(&dead_lettered);
                async move {
                    dead_lettered.lock().insert(message.id);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
    }

    let succeeded: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut subscribers = Vec::new();
    for n in 1..=2 {
        let subscriber = Subscriber::new(
            &pair,
            settings.clone(),
            "RabbitTests",
            &format!("{n:03}"),
            &token,
        )
        .await
        .unwrap();
        let succeeded = Arc::clone(&succeeded);
        subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |message, _subscriber_id, _headers| {
                let succeeded = Arc::clone(&succeeded);
                async move {
                    if message.id == "m-4" {
                        anyhow::bail!("simulated processing failure");
                    }
                    succeeded.lock().insert(message.id);
                    Ok(true)
                }
            })
            .await
            .unwrap();
        subscribers.push(subscriber);
    }

    let publisher = Publisher::new(&pair, settings.client.clone(), token.clone())
        .await
        .unwrap();
    for i in 0..10 {
        publisher
            .publish(
                &common::text_message(format!("m-{i}")),
                "queue-topic.test",
                None,
                None,
            )
            .await
            .unwrap();
    }

    let drained = common::wait_until(Duration::from_secs(10), || succeeded.lock().len() == 9).await;
    assert!(drained, "expected 9 successful messages");
    assert!(!succeeded.lock().contains("m-4"));

    let dead = common::wait_until(Duration::from_secs(10), || {
        dead_lettered.lock().contains("m-4")
    })
    .await;
    assert!(dead, "poison message never reached the dead-letter exchange");

    publisher.close().await;
    for subscriber in subscribers {
        subscriber.cancel(true).await;
    }
    dlx_subscriber.cancel(true).await;
    pair.close().await;
}

/// Serializes as a plain envelope until the poison element, which fails.
enum MaybeMessage {
    Good(QueueMessage<String>),
    Poison,
}

impl Serialize for MaybeMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaybeMessage::Good(message) => message.serialize(serializer),
            MaybeMessage::Poison => Err(serde::ser::Error::custom("unserializable payload")),
        }
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_failed_batch_publish_leaves_nothing_visible() {
    let pair = common::connected_pair().await;
    let settings = topic_settings(
        &common::unique("exch-atomic-tests"),
        &common::unique("queue-atomic-tests"),
        5,
    );
    let token = CancellationToken::new();

    let received = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::new(&pair, settings.clone(), "RabbitTests", "001", &token)
        .await
        .unwrap();
    {
        let received = Arc::clone(&received);
        subscriber
            .subscribe::<QueueMessage<String>, _, _>(move |_message, _subscriber_id, _headers| {
                let received = Arc::clone(&received);
                async move {
                    received.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .await
            .unwrap();
    }

    let publisher = Publisher::new(&pair, settings.client.clone(), token.clone())
        .await
        .unwrap();
    let messages: Vec<MaybeMessage> = (0..4)
        .map(|i| MaybeMessage::Good(common::text_message(format!("m-{i}"))))
        .chain(std::iter::once(MaybeMessage::Poison))
        .chain((5..8).map(|i| MaybeMessage::Good(common::text_message(format!("m-{i}")))))
        .collect();

    let result = publisher
        .publish_all(&messages, "queue-topic.test", None, None)
        .await;
    assert!(matches!(result, Err(BatchMqError::Serialization(_))));

    // The rolled-back transaction must leave no partial batch behind.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);

    publisher.close().await;
    subscriber.cancel(true).await;
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_second_subscribe_call_raises() {
    let pair = common::connected_pair().await;
    let settings = topic_settings(
        &common::unique("exch-double-tests"),
        &common::unique("queue-double-tests"),
        5,
    );
    let token = CancellationToken::new();

    let subscriber = Subscriber::new(&pair, settings, "RabbitTests", "001", &token)
        .await
        .unwrap();
    subscriber
        .subscribe::<QueueMessage<String>, _, _>(|_message, _subscriber_id, _headers| async {
            Ok::<bool, anyhow::Error>(true)
        })
        .await
        .unwrap();

    let second = subscriber
        .subscribe::<QueueMessage<String>, _, _>(|_message, _subscriber_id, _headers| async {
            Ok::<bool, anyhow::Error>(true)
        })
        .await;
    assert!(matches!(second, Err(BatchMqError::AlreadySubscribed { .. })));

    subscriber.cancel(true).await;
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_deliberate_close_reports_disconnected() {
    let pair = common::connected_pair().await;
    assert!(pair.is_producer_connected());
    assert!(pair.is_consumer_connected());

    pair.close().await;
    assert!(!pair.is_producer_connected());
    assert!(!pair.is_consumer_connected());
    assert_eq!(pair.producer().state(), HandleState::Closed);
    assert_eq!(pair.consumer().state(), HandleState::Closed);
}
