//! # Batch and Stage Models
//!
//! A batch is a unit of work split into items and pushed through an
//! ordered sequence of processing stages. Stage order is an explicit,
//! caller-supplied list; progress is a per-stage processed counter that
//! may never exceed the item count.

use crate::error::{BatchMqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One processing stage of a batch.
///
/// The ordinal travels on the wire inside stage item messages; the string
/// form keys the batch's progress counters and routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStage {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
}

impl BatchStage {
    pub fn ordinal(self) -> u32 {
        match self {
            BatchStage::Stage1 => 1,
            BatchStage::Stage2 => 2,
            BatchStage::Stage3 => 3,
            BatchStage::Stage4 => 4,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Result<Self> {
        match ordinal {
            1 => Ok(BatchStage::Stage1),
            2 => Ok(BatchStage::Stage2),
            3 => Ok(BatchStage::Stage3),
            4 => Ok(BatchStage::Stage4),
            _ => Err(BatchMqError::InvalidStage {
                value: ordinal.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStage::Stage1 => "Stage1",
            BatchStage::Stage2 => "Stage2",
            BatchStage::Stage3 => "Stage3",
            BatchStage::Stage4 => "Stage4",
        }
    }
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BatchStage {
    type Err = BatchMqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Stage1" => Ok(BatchStage::Stage1),
            "Stage2" => Ok(BatchStage::Stage2),
            "Stage3" => Ok(BatchStage::Stage3),
            "Stage4" => Ok(BatchStage::Stage4),
            _ => Err(BatchMqError::InvalidStage {
                value: s.to_string(),
            }),
        }
    }
}

/// Batch creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    pub item_count: u32,
    /// Processing order, first to last
    pub stages: Vec<BatchStage>,
}

/// Processed counter for one stage; list position is processing order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub processed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub item_count: u32,
    pub stages: Vec<StageProgress>,
}

impl Batch {
    /// Seed a batch with a zero counter per requested stage, preserving
    /// the caller's order.
    pub fn new(new_batch: &NewBatch) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: new_batch.name.clone(),
            item_count: new_batch.item_count,
            stages: new_batch
                .stages
                .iter()
                .map(|stage| StageProgress {
                    stage: stage.to_string(),
                    processed: 0,
                })
                .collect(),
        }
    }

    pub fn stage_processed(&self, stage: &str) -> Option<u32> {
        self.stages
            .iter()
            .find(|p| p.stage == stage)
            .map(|p| p.processed)
    }

    /// Whether every stage has processed every item.
    ///
    /// A counter above the item count is a consistency violation and
    /// raises rather than answering.
    pub fn is_completed(&self) -> Result<bool> {
        for progress in &self.stages {
            if progress.processed > self.item_count {
                return Err(BatchMqError::StageOverflow {
                    stage: progress.stage.clone(),
                    processed: progress.processed,
                    item_count: self.item_count,
                });
            }
        }
        Ok(self.stages.iter().all(|p| p.processed == self.item_count))
    }

    /// The next stage to run: the first entry still at zero, in order.
    pub fn next_stage(&self) -> Result<BatchStage> {
        self.stages
            .iter()
            .find(|p| p.processed == 0)
            .ok_or_else(|| BatchMqError::NoPendingStage {
                batch_id: self.id.clone(),
            })
            .and_then(|p| p.stage.parse())
    }
}
