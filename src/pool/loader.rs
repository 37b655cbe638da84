//! Load pool for flushed batches.
//!
//! Epistemic foundation:
//! - K_i: At most `parallelism` loads run at once; with 1 they run in sequence order
//! - K_i: A batch is released from the buffer only after the sink acknowledged it
//! - B_i: Each load may fail or time out → local retry, then escalation
//! - I^B: Sink availability unknowable → exponential backoff, capped

use crate::client::{SinkLoader, batch_label};
use crate::models::{Batch, LoadAck, LoadError, PipelineError, PipelineStats, Result, SinkConfig};
use crate::pipeline::BatchBuffer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
pub fn compute_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms).min(max)
}

/// Drives sink loads for one pipeline attempt.
pub struct LoadPool {
    loader: Arc<dyn SinkLoader>,
    buffer: Arc<Mutex<BatchBuffer>>,
    stats: Arc<PipelineStats>,
    label_prefix: String,
    run_id: String,
    parallelism: usize,
    /// Attempts per batch before escalating
    max_attempts: u32,
    retry_backoff: Duration,
    max_backoff: Duration,
    timeout: Duration,
}

impl LoadPool {
    pub fn new(
        loader: Arc<dyn SinkLoader>,
        buffer: Arc<Mutex<BatchBuffer>>,
        stats: Arc<PipelineStats>,
        config: &SinkConfig,
        run_id: String,
    ) -> Self {
        Self {
            loader,
            buffer,
            stats,
            label_prefix: config.label_prefix.clone(),
            run_id,
            parallelism: config.parallelism.max(1),
            max_attempts: config.max_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: config.timeout(),
        }
    }

    /// Load every batch received until the channel closes.
    ///
    /// Returns once all queued and in-flight loads have finished, or with the
    /// first escalated failure. Dropping the future aborts in-flight loads.
    pub async fn run(self: Arc<Self>, mut batches: mpsc::Receiver<Arc<Batch>>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<Result<LoadAck>> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                Some(joined) = tasks.join_next() => {
                    Self::settle(joined)?;
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|_| PipelineError::Internal("Load semaphore closed".to_string()))?,
            };

            let batch = tokio::select! {
                biased;
                Some(joined) = tasks.join_next() => {
                    Self::settle(joined)?;
                    continue;
                }
                batch = batches.recv() => batch,
            };
            let Some(batch) = batch else {
                break;
            };

            let pool = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                pool.load_batch(batch).await
            });
        }

        debug!(in_flight = tasks.len(), "Batch channel closed, draining loads");
        while let Some(joined) = tasks.join_next().await {
            Self::settle(joined)?;
        }
        Ok(())
    }

    fn settle(joined: std::result::Result<Result<LoadAck>, JoinError>) -> Result<()> {
        match joined {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(PipelineError::Internal(format!("Load task panicked: {e}"))),
        }
    }

    /// Load one batch with local retries, releasing it from the buffer on success.
    ///
    /// B_i(sink accepts batch) → Result<LoadAck>
    pub async fn load_batch(&self, batch: Arc<Batch>) -> Result<LoadAck> {
        let label = batch_label(&self.label_prefix, &self.run_id, &batch);
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.loader.load(&label, &batch))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LoadError::Timeout(self.timeout)),
            };

            match result {
                Ok(ack) => {
                    self.buffer.lock().await.acknowledge(batch.sequence_id);
                    PipelineStats::incr(&self.stats.batches_loaded);
                    PipelineStats::add(&self.stats.rows_loaded, ack.rows_loaded);
                    if ack.duplicate {
                        PipelineStats::incr(&self.stats.duplicate_batches);
                        info!(
                            label = %label,
                            sequence_id = batch.sequence_id,
                            "Batch already applied by sink"
                        );
                    } else {
                        info!(
                            label = %label,
                            sequence_id = batch.sequence_id,
                            rows = ack.rows_loaded,
                            attempts = attempt,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Batch loaded"
                        );
                    }
                    return Ok(ack);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let backoff = compute_backoff(self.retry_backoff, self.max_backoff, attempt);
                    PipelineStats::incr(&self.stats.load_retries);
                    warn!(
                        label = %label,
                        sequence_id = batch.sequence_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Load failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        label = %label,
                        sequence_id = batch.sequence_id,
                        attempts = attempt,
                        error = %e,
                        "Load failed"
                    );
                    return Err(PipelineError::Load {
                        sequence_id: batch.sequence_id,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
