//! Checkpoint contents.
//!
//! Epistemic foundation:
//! - K_i: A checkpoint is immutable once written and superseded by the next one
//! - K_i: Offsets below `source_offset` are loaded, retained here, or skipped
//! - B_i: Batches in `inflight` may or may not have reached the sink → redelivered
//!   under the same label on resume

use crate::models::{Batch, BufferedRecord};
use crate::pipeline::BufferSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable snapshot of pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic checkpoint id within a checkpoint directory
    pub id: u64,

    /// Run the batches in this checkpoint were labeled under
    pub run_id: String,

    pub created_at: DateTime<Utc>,

    /// Source offset and buffer contents at snapshot time
    #[serde(flatten)]
    pub progress: BufferSnapshot,
}

impl Checkpoint {
    pub fn new(id: u64, run_id: &str, progress: BufferSnapshot) -> Self {
        Self {
            id,
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            progress,
        }
    }

    /// Offset the source resumes from.
    pub fn source_offset(&self) -> u64 {
        self.progress.source_offset
    }

    pub fn inflight(&self) -> &[Batch] {
        &self.progress.inflight
    }

    pub fn buffered(&self) -> &[BufferedRecord] {
        &self.progress.buffered
    }
}
