//! # Batch Orchestration
//!
//! The saga layer on top of the broker client: the orchestrator creates
//! batches and drives stage-to-stage transitions via action messages,
//! per-batch item workers process one stage's messages and trigger the
//! completion barrier, and the in-memory barrier processor runs the same
//! protocol without durable state.

pub mod barrier;
pub mod item_worker;
pub mod orchestrator;
pub mod sender;

use std::time::Duration;

pub use barrier::{BarrierBatchProcessor, BarrierState};
pub use item_worker::BatchItemWorker;
pub use orchestrator::BatchOrchestrator;
pub use sender::{BatchMessageSender, RabbitBatchMessageSender};

/// Timing knobs for simulated work and completion-barrier polling.
///
/// Production uses the defaults; tests shrink them to keep barrier
/// timeouts observable.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Simulated per-item processing delay
    pub work_delay: Duration,
    /// Wait between barrier poll reads
    pub poll_interval: Duration,
    /// Bound on the completion barrier; exceeding it is fatal
    pub poll_timeout: Duration,
}

impl PollPolicy {
    /// Stage workers poll the persisted batch: 5 minute bound.
    pub fn stage() -> Self {
        Self {
            work_delay: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(300),
        }
    }

    /// The in-memory barrier resolves faster: 1 minute bound.
    pub fn barrier() -> Self {
        Self {
            work_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::stage()
    }
}
