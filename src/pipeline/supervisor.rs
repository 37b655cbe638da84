//! Restart supervisor.
//!
//! Epistemic foundation:
//! - K_i: Exactly one `PipelineState`, owned here, published read-only via watch
//! - K_i: StoppedFailed iff more than `max_failures` failures fall within one window
//! - B_i: Any stage may fail → restart from the latest checkpoint after a delay
//! - I^R: Budget, window, delay and checkpoint retention are configurable

use super::{Pipeline, RecordSource, SchemaTransform, Transform, source_from_config};
use crate::checkpoint::{
    Checkpoint, CheckpointCoordinator, CheckpointStorage, FileCheckpointStore,
};
use crate::client::{SinkLoader, StreamLoadClient, serializer_from_config};
use crate::models::{
    CheckpointRetention, Config, PipelineError, PipelineStats, RestartConfig, Result, RunStats,
    Stage,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a supervised pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Restarting,
    StoppedFailed,
    StoppedClean,
}

impl PipelineState {
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::StoppedFailed | Self::StoppedClean)
    }

    /// Whether the supervisor may move from `self` to `next`.
    ///
    /// Failures always pass through Restarting; the budget check happens there.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Running, Running)
                | (Running, Restarting)
                | (Running, StoppedClean)
                | (Restarting, Running)
                | (Restarting, Restarting)
                | (Restarting, StoppedFailed)
                | (Restarting, StoppedClean)
        )
    }
}

/// One escalated stage failure.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub at: Instant,
    pub stage: Stage,
    pub cause: String,
}

/// Sliding failure-rate window.
///
/// Two failures at `t_i < t_j` share a window iff `t_j - t_i < window`.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    max_failures: usize,
    records: VecDeque<FailureRecord>,
}

impl FailureWindow {
    pub fn new(config: &RestartConfig) -> Self {
        Self::with_limits(config.failure_window(), config.max_failures as usize)
    }

    pub fn with_limits(window: Duration, max_failures: usize) -> Self {
        Self {
            window,
            max_failures,
            records: VecDeque::new(),
        }
    }

    /// Record a failure. Returns `true` when the restart budget is exhausted.
    pub fn record(&mut self, failure: FailureRecord) -> bool {
        while self
            .records
            .front()
            .is_some_and(|old| failure.at.duration_since(old.at) >= self.window)
        {
            self.records.pop_front();
        }
        self.records.push_back(failure);
        self.records.len() > self.max_failures
    }

    /// Failures currently inside the window.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Outcome of a supervised run that did not exhaust its restart budget.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: PipelineState,
    pub run_id: String,
    /// Id of the last checkpoint written or resumed from
    pub last_checkpoint: Option<u64>,
    pub stats: RunStats,
}

/// Owns the pipeline lifecycle: attempts, restarts, and checkpoint retention.
pub struct Supervisor {
    config: Arc<Config>,
    pipeline: Pipeline,
    storage: Arc<dyn CheckpointStorage>,
    state: watch::Sender<PipelineState>,
    stats: Arc<PipelineStats>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        source: Box<dyn RecordSource>,
        transform: Arc<dyn Transform>,
        loader: Arc<dyn SinkLoader>,
        storage: Arc<dyn CheckpointStorage>,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let pipeline = Pipeline::new(
            Arc::clone(&config),
            source,
            transform,
            loader,
            Arc::clone(&stats),
        );
        Self {
            config,
            pipeline,
            storage,
            state: watch::Sender::new(PipelineState::Running),
            stats,
        }
    }

    /// Wire the configured source, schema transform, stream load client and
    /// file checkpoint store.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        config.validate()?;
        let password = config.resolve_password()?;
        let serializer = serializer_from_config(&config)?;
        let transform = Arc::new(SchemaTransform::from_config(&config, serializer.as_ref()));
        let loader = StreamLoadClient::new(&config.sink, password, serializer).map_err(|e| {
            PipelineError::Internal(format!("Failed to build stream load client: {e}"))
        })?;
        let storage = FileCheckpointStore::new(&config.checkpoint.dir)?;
        let source = source_from_config(&config);

        info!(
            url = %loader.url(),
            checkpoint_dir = %storage.dir().display(),
            "Pipeline configured"
        );
        Ok(Self::new(
            config,
            source,
            transform,
            Arc::new(loader),
            Arc::new(storage),
        ))
    }

    /// Watch the pipeline state.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Live run counters.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until a clean stop or until the restart budget is exhausted.
    ///
    /// With `resume`, starts from the latest stored checkpoint. Cancelling
    /// `shutdown` drains the pipeline and stops it cleanly.
    pub async fn run(mut self, resume: bool, shutdown: CancellationToken) -> Result<RunReport> {
        let started = std::time::Instant::now();

        let stored = self.storage.latest().await?;
        let next_id = stored.as_ref().map_or(0, |c| c.id + 1);
        let baseline = match (resume, stored) {
            (true, Some(checkpoint)) => {
                info!(
                    id = checkpoint.id,
                    run_id = %checkpoint.run_id,
                    source_offset = checkpoint.source_offset(),
                    "Resuming from checkpoint"
                );
                Some(checkpoint)
            }
            (true, None) => {
                info!("No checkpoint found, starting from the beginning");
                None
            }
            (false, _) => None,
        };
        let run_id = baseline
            .as_ref()
            .map(|c| c.run_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let mut coordinator = CheckpointCoordinator::new(
            self.config.checkpoint.clone(),
            Arc::clone(&self.storage),
            self.pipeline.buffer(),
            self.state.subscribe(),
            Arc::clone(&self.stats),
            run_id.clone(),
            baseline,
            next_id,
        );
        let mut failures = FailureWindow::new(&self.config.restart);

        info!(run_id = %run_id, "Starting pipeline");
        loop {
            let restore_from: Option<Checkpoint> = coordinator.latest().cloned();
            let attempt = match self.pipeline.reset(restore_from.as_ref()).await {
                Ok(restored) => {
                    self.transition(PipelineState::Running);
                    self.pipeline
                        .run_attempt(&mut coordinator, &run_id, restored, &shutdown)
                        .await
                }
                Err(e) => Err(e),
            };

            let e = match attempt {
                Ok(outcome) => {
                    info!(outcome = ?outcome, "Pipeline drained");
                    self.apply_retention(&mut coordinator).await;
                    return Ok(self.finish(PipelineState::StoppedClean, run_id, &coordinator, started));
                }
                Err(e) => e,
            };

            let stage = e.stage();
            error!(stage = %stage, error = %e, "Pipeline attempt failed");
            let exhausted = failures.record(FailureRecord {
                at: Instant::now(),
                stage,
                cause: e.to_string(),
            });

            self.transition(PipelineState::Restarting);
            if exhausted {
                self.transition(PipelineState::StoppedFailed);
                error!(
                    failures = failures.len(),
                    window_secs = failures.window().as_secs(),
                    last_checkpoint = coordinator.latest().map(|c| c.id),
                    "Restart budget exhausted, stopping"
                );
                return Err(PipelineError::RestartBudgetExhausted {
                    failures: failures.len(),
                    window: failures.window(),
                    last_cause: e.to_string(),
                });
            }

            PipelineStats::incr(&self.stats.restarts);
            let delay = self.config.restart.delay();
            warn!(
                failures_in_window = failures.len(),
                delay_ms = delay.as_millis() as u64,
                "Restarting pipeline"
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during restart delay, keeping checkpoints");
                    return Ok(self.finish(PipelineState::StoppedClean, run_id, &coordinator, started));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn apply_retention(&self, coordinator: &mut CheckpointCoordinator) {
        match self.config.checkpoint.retention {
            CheckpointRetention::RetainOnCancellation => {
                match coordinator.checkpoint_now().await {
                    Ok(checkpoint) => info!(id = checkpoint.id, "Final checkpoint retained"),
                    Err(e) => warn!(error = %e, "Final checkpoint failed"),
                }
            }
            CheckpointRetention::DeleteOnCancellation => {
                if let Err(e) = self.storage.clear().await {
                    warn!(error = %e, "Failed to delete checkpoints");
                }
            }
        }
    }

    fn transition(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        debug_assert!(
            previous.can_transition_to(next),
            "illegal state transition {previous:?} -> {next:?}"
        );
        if previous != next {
            debug!(from = ?previous, to = ?next, "Pipeline state changed");
        }
    }

    fn finish(
        &self,
        state: PipelineState,
        run_id: String,
        coordinator: &CheckpointCoordinator,
        started: std::time::Instant,
    ) -> RunReport {
        self.transition(state);
        RunReport {
            state,
            run_id,
            last_checkpoint: coordinator.latest().map(|c| c.id),
            stats: self.stats.snapshot(started.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(base: Instant, at_ms: u64) -> FailureRecord {
        FailureRecord {
            at: base + Duration::from_millis(at_ms),
            stage: Stage::Sink,
            cause: "load failed".to_string(),
        }
    }

    #[test]
    fn test_window_budget() {
        let base = Instant::now();
        let mut window = FailureWindow::with_limits(Duration::from_secs(300), 3);
        assert!(!window.record(failure(base, 0)));
        assert!(!window.record(failure(base, 1_000)));
        assert!(!window.record(failure(base, 2_000)));
        assert!(window.record(failure(base, 3_000)));
    }

    #[test]
    fn test_window_evicts_old_failures() {
        let base = Instant::now();
        let mut window = FailureWindow::with_limits(Duration::from_secs(300), 3);
        window.record(failure(base, 0));
        window.record(failure(base, 100_000));
        window.record(failure(base, 200_000));
        // Exactly one window length after the first: it no longer counts
        assert!(!window.record(failure(base, 300_000)));
        assert_eq!(window.len(), 3);
        assert!(window.record(failure(base, 300_001)));
    }

    #[test]
    fn test_failures_pass_through_restarting() {
        use PipelineState::*;
        assert!(!Running.can_transition_to(StoppedFailed));
        assert!(Running.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(StoppedFailed));
        // A failed reset during a restart fails again from Restarting
        assert!(Restarting.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(StoppedClean));
        assert!(!StoppedFailed.can_transition_to(Running));
        assert!(!StoppedClean.can_transition_to(Restarting));
    }

    #[test]
    fn test_state_is_stopped() {
        assert!(PipelineState::StoppedClean.is_stopped());
        assert!(PipelineState::StoppedFailed.is_stopped());
        assert!(!PipelineState::Restarting.is_stopped());
    }
}
