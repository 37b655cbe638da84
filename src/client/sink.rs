//! Sink loader contract.

use crate::models::{Batch, LoadAck, LoadError};
use async_trait::async_trait;

/// Sends one batch to the external store as a single load operation.
///
/// `label` is the idempotency key for this batch content; stores that track
/// labels may report a repeated label as an already applied load.
#[async_trait]
pub trait SinkLoader: Send + Sync {
    async fn load(&self, label: &str, batch: &Batch) -> Result<LoadAck, LoadError>;
}

/// Load label for a batch: unique per run and offset range.
///
/// Batches rebuilt from a checkpoint cover the same offsets with the same
/// records, so a redelivered batch keeps its label.
pub fn batch_label(prefix: &str, run_id: &str, batch: &Batch) -> String {
    format!(
        "{prefix}-{run_id}-{}-{}",
        batch.first_offset, batch.last_offset
    )
}
