//! Run statistics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every stage of a run, across restarts.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub records_read: AtomicU64,
    pub records_skipped: AtomicU64,
    pub rows_loaded: AtomicU64,
    pub batches_loaded: AtomicU64,
    pub duplicate_batches: AtomicU64,
    pub load_retries: AtomicU64,
    pub checkpoints_completed: AtomicU64,
    pub checkpoints_failed: AtomicU64,
    pub restarts: AtomicU64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self, runtime_secs: f64) -> RunStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut stats = RunStats {
            records_read: load(&self.records_read),
            records_skipped: load(&self.records_skipped),
            rows_loaded: load(&self.rows_loaded),
            batches_loaded: load(&self.batches_loaded),
            duplicate_batches: load(&self.duplicate_batches),
            load_retries: load(&self.load_retries),
            checkpoints_completed: load(&self.checkpoints_completed),
            checkpoints_failed: load(&self.checkpoints_failed),
            restarts: load(&self.restarts),
            runtime_secs,
            ..Default::default()
        };
        stats.finalize();
        stats
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Records pulled from the source, replays included
    pub records_read: u64,

    /// Records dropped by the transform skip policy
    pub records_skipped: u64,

    /// Rows the sink reported as loaded
    pub rows_loaded: u64,

    /// Batches acknowledged by the sink
    pub batches_loaded: u64,

    /// Batches the sink recognized as already applied
    pub duplicate_batches: u64,

    pub load_retries: u64,
    pub checkpoints_completed: u64,
    pub checkpoints_failed: u64,
    pub restarts: u64,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Loaded rows per second
    pub throughput_per_sec: f64,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_sec = self.rows_loaded as f64 / self.runtime_secs;
        }
    }
}
