#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # batchmq
//!
//! RabbitMQ client layer and distributed, multi-stage batch-processing
//! orchestrator.
//!
//! ## Overview
//!
//! batchmq keeps resilient, auto-reconnecting broker connections, gives
//! publishers and subscribers explicit delivery guarantees
//! (ack / reject+requeue / dead-letter, TTL, transactional multi-message
//! publish), and runs a batch as a saga: a unit of work split into items,
//! pushed through an ordered sequence of stages by independent worker
//! subscribers, with a last-message barrier to detect stage completion
//! and drive the state machine forward.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Connections, topology, publisher and subscriber
//! - [`models`] - Batch, item and stage domain types
//! - [`repository`] - Narrow persistence contract plus the in-memory store
//! - [`orchestration`] - Saga controller, stage workers, barrier processor
//! - [`config`] - Broker connection configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchmq::config::BrokerConfig;
//! use batchmq::messaging::ConnectionPair;
//! use batchmq::models::{BatchStage, NewBatch};
//! use batchmq::orchestration::{BatchOrchestrator, RabbitBatchMessageSender};
//! use batchmq::repository::{BatchRepository, InMemoryBatchRepository};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connections = Arc::new(ConnectionPair::connect(BrokerConfig::from_env()));
//! let repository: Arc<dyn BatchRepository> = Arc::new(InMemoryBatchRepository::new());
//! let sender = Arc::new(RabbitBatchMessageSender::new(
//!     Arc::clone(&connections),
//!     CancellationToken::new(),
//! ));
//!
//! let orchestrator = Arc::new(BatchOrchestrator::new(
//!     connections,
//!     repository,
//!     sender,
//!     "AppServer",
//!     "001",
//! ));
//! Arc::clone(&orchestrator).start().await?;
//!
//! let batch = orchestrator
//!     .create_batch(NewBatch {
//!         name: "nightly".to_string(),
//!         item_count: 10,
//!         stages: vec![BatchStage::Stage1, BatchStage::Stage2],
//!     })
//!     .await?;
//! println!("created batch {}", batch.id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod repository;

pub use config::BrokerConfig;
pub use error::{BatchMqError, Result};
pub use messaging::{
    BatchMessage, ConnectionHandle, ConnectionPair, ConnectionRole, HandleState, Publisher,
    QueueMessage, Subscriber,
};
pub use models::{Batch, BatchItem, BatchStage, NewBatch, Reference};
pub use orchestration::{
    BarrierBatchProcessor, BarrierState, BatchItemWorker, BatchMessageSender, BatchOrchestrator,
    PollPolicy, RabbitBatchMessageSender,
};
pub use repository::{BatchRepository, InMemoryBatchRepository};
