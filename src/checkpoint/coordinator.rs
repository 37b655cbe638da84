//! Checkpoint coordinator.
//!
//! On a fixed timer, freezes the buffer's progress into a checkpoint and
//! writes it to storage. At most one checkpoint is in flight: the timer loop
//! awaits each write before looking at the next tick.

use super::{Checkpoint, CheckpointStorage};
use crate::models::{CheckpointConfig, CheckpointError, PipelineError, PipelineStats, Result};
use crate::pipeline::{BatchBuffer, PipelineState};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    storage: Arc<dyn CheckpointStorage>,
    buffer: Arc<Mutex<BatchBuffer>>,
    state: watch::Receiver<PipelineState>,
    stats: Arc<PipelineStats>,
    run_id: String,
    next_id: u64,
    consecutive_failures: u32,
    last_completed: Option<Instant>,
    latest: Option<Checkpoint>,
    /// Source offset covered by the latest durable checkpoint
    committed: watch::Sender<u64>,
}

impl CheckpointCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CheckpointConfig,
        storage: Arc<dyn CheckpointStorage>,
        buffer: Arc<Mutex<BatchBuffer>>,
        state: watch::Receiver<PipelineState>,
        stats: Arc<PipelineStats>,
        run_id: String,
        baseline: Option<Checkpoint>,
        next_id: u64,
    ) -> Self {
        let committed = baseline.as_ref().map_or(0, Checkpoint::source_offset);
        Self {
            config,
            storage,
            buffer,
            state,
            stats,
            run_id,
            next_id,
            consecutive_failures: 0,
            last_completed: None,
            latest: baseline,
            committed: watch::Sender::new(committed),
        }
    }

    /// Latest checkpoint written or resumed from in this run.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.latest.as_ref()
    }

    /// Watch the committed source offset.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.committed.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Timer loop for one attempt.
    ///
    /// Returns `Ok` when `cancel` fires, or the escalated error once
    /// consecutive failures exceed the tolerance. A write in progress when
    /// `cancel` fires is completed first.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let interval = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if *self.state.borrow() != PipelineState::Running {
                debug!("Pipeline not running, skipping checkpoint");
                continue;
            }
            if let Some(last) = self.last_completed {
                if last.elapsed() < self.config.min_pause() {
                    debug!("Minimum pause not elapsed, skipping checkpoint");
                    continue;
                }
            }

            self.trigger().await?;
        }
    }

    /// Take one checkpoint, applying the failure tolerance.
    ///
    /// A failure within tolerance is logged and yields `Ok(None)`.
    pub async fn trigger(&mut self) -> Result<Option<Checkpoint>> {
        match self.checkpoint_now().await {
            Ok(checkpoint) => {
                self.consecutive_failures = 0;
                Ok(Some(checkpoint))
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                PipelineStats::incr(&self.stats.checkpoints_failed);
                if self.consecutive_failures > self.config.tolerable_failures {
                    return Err(PipelineError::CheckpointToleranceExceeded {
                        consecutive: self.consecutive_failures,
                        last: e,
                    });
                }
                warn!(
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "Checkpoint failed"
                );
                Ok(None)
            }
        }
    }

    /// Snapshot the buffer and write a checkpoint, bounded by the timeout.
    pub async fn checkpoint_now(&mut self) -> std::result::Result<Checkpoint, CheckpointError> {
        let id = self.next_id;
        self.next_id += 1;
        let start = Instant::now();

        let snapshot = self.buffer.lock().await.snapshot();
        let checkpoint = Checkpoint::new(id, &self.run_id, snapshot);

        let timeout = self.config.timeout();
        let written = tokio::time::timeout(timeout, self.storage.write(&checkpoint)).await;
        self.last_completed = Some(Instant::now());
        match written {
            Ok(result) => result?,
            Err(_) => return Err(CheckpointError::Timeout { id, timeout }),
        }

        if let Err(e) = self.storage.discard_before(id).await {
            warn!(id, error = %e, "Failed to discard superseded checkpoints");
        }

        PipelineStats::incr(&self.stats.checkpoints_completed);
        self.committed.send_replace(checkpoint.source_offset());
        info!(
            id,
            source_offset = checkpoint.source_offset(),
            inflight = checkpoint.inflight().len(),
            buffered = checkpoint.buffered().len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint complete"
        );
        self.latest = Some(checkpoint.clone());
        Ok(checkpoint)
    }
}
