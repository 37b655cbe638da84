//! One supervised run attempt.
//!
//! Pipeline flow:
//! Source → Transform → Batch Buffer → Load Pool → Sink
//!
//! The pull loop, the load pool and the checkpoint timer are driven
//! concurrently from one task. The first escalated error from any of them
//! ends the attempt and drops the others; a shutdown request or the end of
//! the stream drains them instead.

use super::{BatchBuffer, RecordSource, Transform};
use crate::checkpoint::{Checkpoint, CheckpointCoordinator};
use crate::client::SinkLoader;
use crate::models::{
    Batch, Config, PipelineError, PipelineStats, RawRecord, Result, TransformErrorPolicy,
};
use crate::pool::LoadPool;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an attempt ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The source is exhausted and every record has been loaded
    EndOfStream,
    /// Shutdown was requested and the pipeline drained
    Shutdown,
}

/// The stages of a pipeline, reused across attempts.
pub struct Pipeline {
    config: Arc<Config>,
    source: Box<dyn RecordSource>,
    transform: Arc<dyn Transform>,
    loader: Arc<dyn SinkLoader>,
    buffer: Arc<Mutex<BatchBuffer>>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        source: Box<dyn RecordSource>,
        transform: Arc<dyn Transform>,
        loader: Arc<dyn SinkLoader>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(BatchBuffer::new(&config.buffer)));
        Self {
            config,
            source,
            transform,
            loader,
            buffer,
            stats,
        }
    }

    pub fn buffer(&self) -> Arc<Mutex<BatchBuffer>> {
        Arc::clone(&self.buffer)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reset buffer and source to a checkpoint, or to the start of the
    /// stream when there is none. Returns the batches to load again.
    pub async fn reset(&mut self, checkpoint: Option<&Checkpoint>) -> Result<Vec<Arc<Batch>>> {
        let snapshot = checkpoint.map(|c| c.progress.clone()).unwrap_or_default();
        let restored = self.buffer.lock().await.restore(&snapshot);
        self.source.resume_from(snapshot.source_offset).await?;

        info!(
            checkpoint = checkpoint.map(|c| c.id),
            source_offset = snapshot.source_offset,
            redelivered_batches = restored.len(),
            buffered = snapshot.buffered.len(),
            "Pipeline reset"
        );
        Ok(restored)
    }

    /// Run until end of stream, shutdown, or the first escalated failure.
    pub async fn run_attempt(
        &mut self,
        coordinator: &mut CheckpointCoordinator,
        run_id: &str,
        restored: Vec<Arc<Batch>>,
        shutdown: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let (tx, rx) = mpsc::channel(self.config.sink.parallelism.max(1) * 2);
        let pool = Arc::new(LoadPool::new(
            Arc::clone(&self.loader),
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats),
            &self.config.sink,
            run_id.to_string(),
        ));
        let committed = coordinator.subscribe();
        let checkpoint_cancel = CancellationToken::new();

        let pull = self.pull(tx, restored, shutdown, committed);
        let loads = pool.run(rx);
        let checkpoints = coordinator.run(checkpoint_cancel.clone());
        tokio::pin!(pull, loads, checkpoints);

        let mut outcome = None;
        let mut loads_done = false;
        while outcome.is_none() || !loads_done {
            tokio::select! {
                result = &mut pull, if outcome.is_none() => {
                    let result = result?;
                    debug!(outcome = ?result, "Pull loop finished, waiting for loads");
                    outcome = Some(result);
                }
                result = &mut loads, if !loads_done => {
                    result?;
                    loads_done = true;
                }
                result = &mut checkpoints => {
                    result?;
                    return Err(PipelineError::Internal(
                        "Checkpoint coordinator stopped".to_string(),
                    ));
                }
            }
        }

        // Let an in-flight checkpoint write finish
        checkpoint_cancel.cancel();
        checkpoints.await?;

        outcome.ok_or_else(|| PipelineError::Internal("Attempt ended without outcome".to_string()))
    }

    /// Source → Transform → Buffer, plus the interval flush.
    ///
    /// Consumes the batch sender: returning closes the load pool's channel.
    async fn pull(
        &mut self,
        tx: mpsc::Sender<Arc<Batch>>,
        restored: Vec<Arc<Batch>>,
        shutdown: &CancellationToken,
        mut committed: watch::Receiver<u64>,
    ) -> Result<AttemptOutcome> {
        for batch in restored {
            send(&tx, batch).await?;
        }

        let buffer = Arc::clone(&self.buffer);
        let outcome = loop {
            let deadline = buffer.lock().await.deadline();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, draining pipeline");
                    break AttemptOutcome::Shutdown;
                }
                Ok(()) = committed.changed() => {
                    let offset = *committed.borrow_and_update();
                    self.source.commit(offset);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let batch = buffer.lock().await.poll_interval(Instant::now());
                    if let Some(batch) = batch {
                        send(&tx, batch).await?;
                    }
                }
                next = self.source.next() => match next? {
                    Some(raw) => self.ingest(raw, &tx).await?,
                    None => {
                        info!(offset = self.source.position(), "Source exhausted, draining pipeline");
                        break AttemptOutcome::EndOfStream;
                    }
                },
            }
        };

        let last = buffer.lock().await.flush();
        if let Some(batch) = last {
            send(&tx, batch).await?;
        }
        Ok(outcome)
    }

    async fn ingest(&self, raw: RawRecord, tx: &mpsc::Sender<Arc<Batch>>) -> Result<()> {
        PipelineStats::incr(&self.stats.records_read);

        match self.transform.transform(&raw) {
            Ok(record) => {
                let batches = self.buffer.lock().await.append(raw.offset, record);
                for batch in batches {
                    send(tx, batch).await?;
                }
                Ok(())
            }
            Err(e) => match self.config.transform.on_error {
                TransformErrorPolicy::Skip => {
                    warn!(offset = raw.offset, error = %e, "Skipping record");
                    self.buffer.lock().await.skip(raw.offset);
                    PipelineStats::incr(&self.stats.records_skipped);
                    Ok(())
                }
                TransformErrorPolicy::Fail => Err(PipelineError::Transform {
                    offset: raw.offset,
                    source: e,
                }),
            },
        }
    }
}

async fn send(tx: &mpsc::Sender<Arc<Batch>>, batch: Arc<Batch>) -> Result<()> {
    tx.send(batch)
        .await
        .map_err(|_| PipelineError::ChannelClosed)
}
