//! End-to-end saga tests: a created batch runs every stage to completion
//! through real broker traffic, and the in-memory barrier variant counts
//! its way to completion and tears itself down.

mod common;

use batchmq::messaging::settings::batch;
use batchmq::messaging::{body_type, BatchMessage, QueueMessage, Subscriber};
use batchmq::models::{BatchStage, NewBatch};
use batchmq::orchestration::{
    BarrierBatchProcessor, BarrierState, BatchOrchestrator, PollPolicy, RabbitBatchMessageSender,
};
use batchmq::repository::{BatchRepository, InMemoryBatchRepository};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_policy() -> PollPolicy {
    PollPolicy {
        work_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(50),
        poll_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_batch_runs_all_stages_to_completion() {
    let pair = common::connected_pair().await;
    let repository = Arc::new(InMemoryBatchRepository::new());
    let token = CancellationToken::new();
    let sender = Arc::new(RabbitBatchMessageSender::new(
        Arc::clone(&pair),
        token.clone(),
    ));

    let orchestrator = Arc::new(
        BatchOrchestrator::new(
            Arc::clone(&pair),
            Arc::clone(&repository) as Arc<dyn BatchRepository>,
            sender,
            "AppServer",
            common::unique("001"),
        )
        .with_policy(fast_policy()),
    );
    Arc::clone(&orchestrator).start().await.unwrap();

    let batch = orchestrator
        .create_batch(NewBatch {
            name: "B1".to_string(),
            item_count: 10,
            stages: vec![BatchStage::Stage1, BatchStage::Stage2, BatchStage::Stage3],
        })
        .await
        .unwrap();

    assert_eq!(batch.stages.len(), 3);
    assert!(batch.stages.iter().all(|p| p.processed == 0));

    // The saga is message-driven from here; wait for the state machine to
    // push every stage to the item count.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let found = repository.find_batch(&batch.id).await.unwrap();
        if found.is_completed().unwrap() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch never completed; stages: {:?}",
            found.stages
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let completed = repository.find_batch(&batch.id).await.unwrap();
    for progress in &completed.stages {
        assert_eq!(progress.processed, 10, "stage {}", progress.stage);
    }
    let items = repository.items_for_batch(&batch.id).await.unwrap();
    assert_eq!(items.len(), 10);
    assert!(items.iter().all(|item| item.processed));

    // The completed action for the final stage removes the workers.
    let removed =
        common::wait_until(Duration::from_secs(10), || orchestrator.registered_batches() == 0)
            .await;
    assert!(removed, "stage workers were not deregistered");

    orchestrator.shutdown().await;
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_in_memory_barrier_completes_and_cleans_up() {
    let pair = common::connected_pair().await;
    let state = Arc::new(BarrierState::new());
    let token = CancellationToken::new();
    let processor = Arc::new(
        BarrierBatchProcessor::new(
            Arc::clone(&pair),
            Arc::clone(&state),
            "AppServer",
            token.clone(),
        )
        .with_policy(fast_policy()),
    );

    // Listen for progress notifications on the misc fanout exchange.
    let progress: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let misc_settings = batch::for_misc().as_consumer_settings(batch::BATCH_COMPLETED_KEY);
    let listener = Subscriber::new(&pair, misc_settings, "RabbitTests", "prog", &token)
        .await
        .unwrap();
    {
        let progress = Arc::clone(&progress);
        listener
            .subscribe::<QueueMessage<BatchMessage>, _, _>(
                move |message, _subscriber_id, _headers| {
                    let progress = Arc::clone(&progress);
                    async move {
                        progress.lock().push(message.body.expected_count);
                        Ok::<bool, anyhow::Error>(true)
                    }
                },
            )
            .await
            .unwrap();
    }

    let batch_id = common::unique("adhoc");
    let first = QueueMessage {
        id: String::new(),
        linked_id: batch_id.clone(),
        body_type: body_type::BATCH_MESSAGE.to_string(),
        body: BatchMessage {
            is_first: true,
            expected_count: 10,
            ..Default::default()
        },
    };
    Arc::clone(&processor)
        .process_message(first, "test-service")
        .await
        .unwrap();
    assert!(state.is_registered(&batch_id) || processor.active_batches() == 0);

    // Completion tears down subscribers and counters.
    let torn_down = common::wait_until(Duration::from_secs(30), || {
        processor.active_batches() == 0 && !state.is_registered(&batch_id)
    })
    .await;
    assert!(torn_down, "barrier batch never cleaned up");

    // The final progress notification carries the full count.
    let finished =
        common::wait_until(Duration::from_secs(10), || progress.lock().contains(&10)).await;
    assert!(finished, "no final progress notification observed");

    listener.cancel(true).await;
    pair.close().await;
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ broker
async fn test_plain_item_message_is_rejected_at_the_control_entry() {
    let pair = common::connected_pair().await;
    let state = Arc::new(BarrierState::new());
    let processor = Arc::new(BarrierBatchProcessor::new(
        Arc::clone(&pair),
        state,
        "AppServer",
        CancellationToken::new(),
    ));

    let message = QueueMessage {
        id: "1".to_string(),
        linked_id: "b-1".to_string(),
        body_type: body_type::BATCH_MESSAGE.to_string(),
        body: BatchMessage::default(),
    };
    assert!(Arc::clone(&processor)
        .process_message(message, "test-service")
        .await
        .is_err());

    pair.close().await;
}
