//! End-to-end tests for the supervised pipeline
//!
//! These tests drive the full Source → Transform → Buffer → Load flow with an
//! in-process sink and checkpoint store, covering:
//! - Batching by row count
//! - Local retries and supervisor restarts
//! - Restart budget exhaustion
//! - Resume from a stored checkpoint
//! - No record lost across injected failures
//! - Graceful shutdown and checkpoint retention

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamload::checkpoint::{Checkpoint, CheckpointStorage, MemoryCheckpointStore};
use streamload::client::SinkLoader;
use streamload::models::{
    Batch, CheckpointError, CheckpointRetention, Config, LoadAck, LoadError, PipelineError,
    RawRecord, Record, SchemaConfig, Value,
};
use streamload::pipeline::{
    BufferSnapshot, ChannelSource, GeneratorSource, PipelineState, RecordSource, SchemaTransform,
    Supervisor, Transform,
};
use tokio_util::sync::CancellationToken;

const BASE_CONFIG: &str = r#"
[source]
kind = "generator"
interval_ms = 0

[sink]
load_url = "http://localhost:8030"
database = "starrocks_demo"
table = "demo2_flink_tb1"
max_retries = 1
retry_backoff_ms = 10
"#;

fn base_config() -> Config {
    let config: Config = toml::from_str(BASE_CONFIG).unwrap();
    config.validate().unwrap();
    config
}

fn transform() -> SchemaTransform {
    SchemaTransform::new(SchemaConfig::default().columns, vec![vec![0x01], vec![0x02]])
}

/// In-process sink that dedupes by label and can fail chosen calls.
#[derive(Default)]
struct RecordingSink {
    /// Zero-based call indices that fail
    fail_calls: HashSet<usize>,
    always_fail: bool,
    calls: AtomicUsize,
    loaded: Mutex<Vec<(String, Batch)>>,
}

impl RecordingSink {
    fn failing_calls(calls: &[usize]) -> Self {
        Self {
            fail_calls: calls.iter().copied().collect(),
            ..Default::default()
        }
    }

    fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn loaded(&self) -> Vec<(String, Batch)> {
        self.loaded.lock().unwrap().clone()
    }

    fn labels(&self) -> Vec<String> {
        self.loaded().into_iter().map(|(label, _)| label).collect()
    }

    fn scores(&self) -> Vec<i64> {
        self.loaded()
            .iter()
            .flat_map(|(_, batch)| batch.records.iter())
            .map(|record| match record.values[1] {
                Value::Int(score) => score,
                ref other => panic!("unexpected score {other:?}"),
            })
            .collect()
    }
}

#[async_trait]
impl SinkLoader for RecordingSink {
    async fn load(&self, label: &str, batch: &Batch) -> Result<LoadAck, LoadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || self.fail_calls.contains(&call) {
            return Err(LoadError::Unavailable("backend not alive".to_string()));
        }

        let mut loaded = self.loaded.lock().unwrap();
        if loaded.iter().any(|(existing, _)| existing == label) {
            return Ok(LoadAck {
                sequence_id: batch.sequence_id,
                rows_loaded: 0,
                duplicate: true,
            });
        }
        loaded.push((label.to_string(), batch.clone()));
        Ok(LoadAck {
            sequence_id: batch.sequence_id,
            rows_loaded: batch.len() as u64,
            duplicate: false,
        })
    }
}

/// Checkpoint storage whose first `failures` writes fail.
struct FlakyStorage {
    failures: AtomicUsize,
    inner: MemoryCheckpointStore,
}

impl FlakyStorage {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: MemoryCheckpointStore::default(),
        }
    }
}

#[async_trait]
impl CheckpointStorage for FlakyStorage {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CheckpointError::io(
                "writing checkpoint",
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.write(checkpoint).await
    }

    async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.latest().await
    }

    async fn discard_before(&self, id: u64) -> Result<(), CheckpointError> {
        self.inner.discard_before(id).await
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        self.inner.clear().await
    }
}

fn supervisor(
    config: Config,
    source: Box<dyn RecordSource>,
    sink: Arc<RecordingSink>,
    storage: Arc<MemoryCheckpointStore>,
) -> Supervisor {
    Supervisor::new(Arc::new(config), source, Arc::new(transform()), sink, storage)
}

fn demo_record(name: &str, score: i64) -> Record {
    Record::new(vec![Value::from(name), Value::from(score)])
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test]
async fn test_two_records_form_one_batch() {
    let mut config = base_config();
    config.buffer.max_rows = 2;

    let (source, tx) = ChannelSource::new(8);
    tx.send(vec!["alice".to_string(), "42".to_string()])
        .await
        .unwrap();
    tx.send(vec!["bob".to_string(), "7".to_string()])
        .await
        .unwrap();
    drop(tx);

    let sink = Arc::new(RecordingSink::default());
    let storage = Arc::new(MemoryCheckpointStore::default());
    let report = supervisor(config, Box::new(source), sink.clone(), storage.clone())
        .run(false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, PipelineState::StoppedClean);
    assert_eq!(sink.calls(), 1);
    let loaded = sink.loaded();
    assert_eq!(
        loaded[0].1.records,
        vec![demo_record("alice", 42), demo_record("bob", 7)]
    );
    assert_eq!(report.stats.rows_loaded, 2);
    assert_eq!(report.stats.restarts, 0);
    // Default retention removes checkpoints after a clean stop
    assert!(storage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_batch_exceeds_max_rows() {
    let mut config = base_config();
    config.buffer.max_rows = 4;

    let sink = Arc::new(RecordingSink::default());
    let source = GeneratorSource::new(Duration::from_millis(10), Some(30));
    let report = supervisor(
        config,
        Box::new(source),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::default()),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.stats.rows_loaded, 30);
    let loaded = sink.loaded();
    assert!(loaded.iter().all(|(_, batch)| batch.len() <= 4));
    // 7 full batches and the remainder flushed at end of stream
    assert_eq!(loaded.len(), 8);
    assert_eq!(loaded.last().unwrap().1.len(), 2);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_restarts_and_loads() {
    let mut config = base_config();
    config.buffer.max_rows = 2;
    config.restart.max_failures = 3;

    let (source, tx) = ChannelSource::new(8);
    tx.send(vec!["alice".to_string(), "42".to_string()])
        .await
        .unwrap();
    tx.send(vec!["bob".to_string(), "7".to_string()])
        .await
        .unwrap();
    drop(tx);

    let sink = Arc::new(RecordingSink::failing_calls(&[0, 1]));
    let supervisor = supervisor(
        config,
        Box::new(source),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::default()),
    );
    let state = supervisor.state();
    let report = supervisor.run(false, CancellationToken::new()).await.unwrap();

    assert_eq!(report.state, PipelineState::StoppedClean);
    assert_eq!(*state.borrow(), PipelineState::StoppedClean);
    assert_eq!(report.stats.restarts, 2);
    assert_eq!(sink.calls(), 3);
    assert_eq!(
        sink.loaded()[0].1.records,
        vec![demo_record("alice", 42), demo_record("bob", 7)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_local_retries_absorb_transient_failures() {
    let mut config = base_config();
    config.buffer.max_rows = 2;
    config.sink.max_retries = 3;

    let sink = Arc::new(RecordingSink::failing_calls(&[0, 1]));
    let report = supervisor(
        config,
        Box::new(GeneratorSource::new(Duration::ZERO, Some(2))),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::default()),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.stats.restarts, 0);
    assert_eq!(report.stats.load_retries, 2);
    assert_eq!(report.stats.batches_loaded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_budget_exhausted() {
    let mut config = base_config();
    config.buffer.max_rows = 1;
    config.restart.max_failures = 3;

    let sink = Arc::new(RecordingSink::always_failing());
    let supervisor = supervisor(
        config,
        Box::new(GeneratorSource::new(Duration::ZERO, Some(5))),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::default()),
    );
    let state = supervisor.state();
    let stats = supervisor.stats();

    let err = supervisor
        .run(false, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::RestartBudgetExhausted { failures: 4, .. }
    ));
    assert_eq!(*state.borrow(), PipelineState::StoppedFailed);
    assert_eq!(stats.restarts.load(Ordering::Relaxed), 3);
    assert!(sink.loaded().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transform_failure_escalates_unless_skipped() {
    let rows = || {
        let (source, tx) = ChannelSource::new(8);
        for fields in [["alice", "42"], ["bob", "seven"], ["carol", "9"]] {
            tx.try_send(fields.iter().map(|f| f.to_string()).collect())
                .unwrap();
        }
        drop(tx);
        source
    };

    let mut config = base_config();
    config.restart.max_failures = 0;
    let err = supervisor(
        config.clone(),
        Box::new(rows()),
        Arc::new(RecordingSink::default()),
        Arc::new(MemoryCheckpointStore::default()),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap_err();
    assert!(err.to_string().contains("offset 1"));

    config.transform.on_error = streamload::models::TransformErrorPolicy::Skip;
    let sink = Arc::new(RecordingSink::default());
    let report = supervisor(
        config,
        Box::new(rows()),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::default()),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap();
    assert_eq!(report.stats.records_skipped, 1);
    assert_eq!(sink.scores(), vec![42, 9]);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resume_redelivers_checkpointed_batches_first() {
    let mut config = base_config();
    config.buffer.max_rows = 2;
    config.checkpoint.retention = CheckpointRetention::RetainOnCancellation;

    let transform = transform();
    let record_at = |offset: u64| {
        transform
            .transform(&RawRecord::new(offset, GeneratorSource::row_at(offset)))
            .unwrap()
    };

    // Offsets 0-1 loaded, 2-3 flushed but unacknowledged
    let storage = Arc::new(MemoryCheckpointStore::default());
    storage
        .write(&Checkpoint::new(
            3,
            "r1",
            BufferSnapshot {
                source_offset: 4,
                next_sequence: 1,
                inflight: vec![Batch {
                    sequence_id: 0,
                    first_offset: 2,
                    last_offset: 3,
                    records: vec![record_at(2), record_at(3)],
                }],
                buffered: Vec::new(),
            },
        ))
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let report = supervisor(
        config,
        Box::new(GeneratorSource::new(Duration::ZERO, Some(6))),
        sink.clone(),
        storage.clone(),
    )
    .run(true, CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.run_id, "r1");
    assert_eq!(
        sink.labels(),
        vec![
            "streamload-r1-2-3".to_string(),
            "streamload-r1-4-5".to_string()
        ]
    );
    assert_eq!(sink.scores(), vec![2, 3, 4, 5]);

    // Final checkpoint after drain, nothing left in flight
    let last = storage.latest().await.unwrap().unwrap();
    assert_eq!(last.id, 4);
    assert_eq!(last.source_offset(), 6);
    assert!(last.inflight().is_empty());
    assert!(last.buffered().is_empty());
    assert_eq!(report.last_checkpoint, Some(4));
}

#[tokio::test(start_paused = true)]
async fn test_no_record_lost_across_restarts() {
    let mut config = base_config();
    config.buffer.max_rows = 5;
    config.checkpoint.interval_ms = 1000;
    config.checkpoint.min_pause_ms = 0;
    config.checkpoint.retention = CheckpointRetention::RetainOnCancellation;
    config.restart.max_failures = 3;
    config.restart.delay_ms = 1000;

    let sink = Arc::new(RecordingSink::failing_calls(&[2, 6]));
    let storage = Arc::new(MemoryCheckpointStore::default());
    let report = supervisor(
        config,
        Box::new(GeneratorSource::new(Duration::from_millis(100), Some(60))),
        sink.clone(),
        storage.clone(),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.state, PipelineState::StoppedClean);
    assert_eq!(report.stats.restarts, 2);
    assert!(report.stats.checkpoints_completed > 0);

    let scores: BTreeSet<i64> = sink.scores().into_iter().collect();
    assert_eq!(scores, (0..60).collect::<BTreeSet<i64>>());

    // Each label applied once; redeliveries were acknowledged as duplicates
    let labels = sink.labels();
    let unique: HashSet<&String> = labels.iter().collect();
    assert_eq!(unique.len(), labels.len());
    assert_eq!(storage.latest().await.unwrap().unwrap().source_offset(), 60);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_failures_beyond_tolerance_restart_pipeline() {
    let mut config = base_config();
    config.buffer.max_rows = 5;
    config.checkpoint.interval_ms = 1000;
    config.checkpoint.min_pause_ms = 0;
    config.checkpoint.tolerable_failures = 0;
    config.restart.max_failures = 3;
    config.restart.delay_ms = 1000;

    let sink = Arc::new(RecordingSink::default());
    let storage = Arc::new(FlakyStorage::new(2));
    let report = Supervisor::new(
        Arc::new(config),
        Box::new(GeneratorSource::new(Duration::from_millis(100), Some(30))),
        Arc::new(transform()),
        sink.clone(),
        storage.clone(),
    )
    .run(false, CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.state, PipelineState::StoppedClean);
    assert_eq!(report.stats.restarts, 2);
    assert_eq!(report.stats.checkpoints_failed, 2);
    assert!(report.stats.checkpoints_completed > 0);

    // Without a checkpoint each restart replays from offset 0
    let scores: BTreeSet<i64> = sink.scores().into_iter().collect();
    assert_eq!(scores, (0..30).collect::<BTreeSet<i64>>());
    assert!(report.stats.duplicate_batches > 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_buffered_records() {
    let mut config = base_config();
    config.buffer.max_rows = 1000;

    let sink = Arc::new(RecordingSink::default());
    let storage = Arc::new(MemoryCheckpointStore::default());
    let supervisor = supervisor(
        config,
        Box::new(GeneratorSource::new(Duration::from_millis(100), None)),
        sink.clone(),
        storage.clone(),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let (report, ()) = tokio::join!(supervisor.run(false, shutdown), async move {
        tokio::time::sleep(Duration::from_millis(1050)).await;
        trigger.cancel();
    });
    let report = report.unwrap();

    assert_eq!(report.state, PipelineState::StoppedClean);
    assert_eq!(report.stats.records_read, 10);
    assert_eq!(report.stats.rows_loaded, 10);
    assert_eq!(sink.calls(), 1);
    assert!(storage.is_empty());
}
