//! Batch buffer.
//!
//! Accumulates transformed records and cuts them into batches when a row
//! count, byte size or time threshold is reached. Flushed batches stay
//! retained until the load pool acknowledges them, so a checkpoint taken at
//! any moment covers every record that is not yet durably in the sink.

use crate::models::{Batch, BufferConfig, BufferedRecord, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Rows,
    Bytes,
    Interval,
    Forced,
}

/// Buffer progress frozen for a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Next source offset to read; every lower offset is buffered, retained,
    /// loaded or skipped
    pub source_offset: u64,

    /// Sequence id the next batch gets
    pub next_sequence: u64,

    /// Flushed but unacknowledged batches, by sequence id
    pub inflight: Vec<Batch>,

    /// Records not yet flushed
    pub buffered: Vec<BufferedRecord>,
}

impl BufferSnapshot {
    /// Records held by this snapshot, flushed or not.
    pub fn record_count(&self) -> usize {
        self.buffered.len() + self.inflight.iter().map(Batch::len).sum::<usize>()
    }
}

pub struct BatchBuffer {
    max_rows: usize,
    max_bytes: usize,
    flush_interval: Duration,

    pending: Vec<BufferedRecord>,
    pending_bytes: usize,
    next_sequence: u64,
    next_offset: u64,
    last_flush: Instant,

    /// Flushed batches awaiting acknowledgment
    retained: BTreeMap<u64, Arc<Batch>>,
}

impl BatchBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            max_bytes: config.max_bytes,
            flush_interval: config.flush_interval(),
            pending: Vec::new(),
            pending_bytes: 0,
            next_sequence: 0,
            next_offset: 0,
            last_flush: Instant::now(),
            retained: BTreeMap::new(),
        }
    }

    /// Add a record read at `offset`. Returns the batches this append cut,
    /// in sequence order.
    pub fn append(&mut self, offset: u64, record: Record) -> Vec<Arc<Batch>> {
        let mut flushed = Vec::new();
        let size = record.encoded_len();

        // Cut what we have before the byte budget would be exceeded
        if !self.pending.is_empty() && self.pending_bytes + size > self.max_bytes {
            flushed.extend(self.cut(FlushReason::Bytes));
        }

        self.pending.push(BufferedRecord { offset, record });
        self.pending_bytes += size;
        self.next_offset = self.next_offset.max(offset + 1);

        if self.pending.len() >= self.max_rows {
            flushed.extend(self.cut(FlushReason::Rows));
        } else if self.pending_bytes >= self.max_bytes {
            // A single record at or over the byte budget goes alone
            flushed.extend(self.cut(FlushReason::Bytes));
        }
        flushed
    }

    /// Cut a batch if the flush interval has elapsed. An elapsed interval
    /// with nothing buffered just restarts the clock.
    pub fn poll_interval(&mut self, now: Instant) -> Option<Arc<Batch>> {
        if now.duration_since(self.last_flush) < self.flush_interval {
            return None;
        }
        if self.pending.is_empty() {
            self.last_flush = now;
            return None;
        }
        self.cut(FlushReason::Interval)
    }

    /// When the interval flush is next due.
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.flush_interval
    }

    /// Cut whatever is buffered.
    pub fn flush(&mut self) -> Option<Arc<Batch>> {
        self.cut(FlushReason::Forced)
    }

    /// Mark `offset` as consumed without buffering a record for it.
    pub fn skip(&mut self, offset: u64) {
        self.next_offset = self.next_offset.max(offset + 1);
    }

    /// Release a loaded batch.
    pub fn acknowledge(&mut self, sequence_id: u64) -> Option<Arc<Batch>> {
        self.retained.remove(&sequence_id)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            source_offset: self.next_offset,
            next_sequence: self.next_sequence,
            inflight: self.retained.values().map(|b| Batch::clone(b)).collect(),
            buffered: self.pending.clone(),
        }
    }

    /// Reset to a snapshot. Returns the restored unacknowledged batches in
    /// sequence order; they must be loaded again.
    pub fn restore(&mut self, snapshot: &BufferSnapshot) -> Vec<Arc<Batch>> {
        self.retained = snapshot
            .inflight
            .iter()
            .map(|b| (b.sequence_id, Arc::new(b.clone())))
            .collect();
        self.pending = snapshot.buffered.clone();
        self.pending_bytes = self.pending.iter().map(|b| b.record.encoded_len()).sum();
        self.next_sequence = snapshot.next_sequence;
        self.next_offset = snapshot.source_offset;
        self.last_flush = Instant::now();

        debug!(
            source_offset = self.next_offset,
            next_sequence = self.next_sequence,
            inflight = self.retained.len(),
            buffered = self.pending.len(),
            "Buffer restored"
        );
        self.retained.values().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    /// Next source offset to read.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    fn cut(&mut self, reason: FlushReason) -> Option<Arc<Batch>> {
        let records = std::mem::take(&mut self.pending);
        let bytes = std::mem::replace(&mut self.pending_bytes, 0);
        self.last_flush = Instant::now();

        let batch = Arc::new(Batch::from_buffered(self.next_sequence, records)?);
        self.next_sequence += 1;
        self.retained.insert(batch.sequence_id, Arc::clone(&batch));

        debug!(
            sequence_id = batch.sequence_id,
            first_offset = batch.first_offset,
            last_offset = batch.last_offset,
            rows = batch.len(),
            bytes,
            reason = ?reason,
            "Batch flushed"
        );
        Some(batch)
    }
}
