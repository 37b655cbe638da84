//! Record sources.
//!
//! A source hands out raw records with monotonically increasing offsets and
//! can be repositioned to an earlier offset after a restart. Offsets count
//! records, starting at 0.

use crate::models::{Config, RawRecord, SourceConfig, SourceError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Read-only view of a source's read position, shareable across tasks.
#[derive(Debug, Clone, Default)]
pub struct OffsetHandle(Arc<AtomicU64>);

impl OffsetHandle {
    /// Offset of the next record the source will produce.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, offset: u64) {
        self.0.store(offset, Ordering::Release);
    }
}

/// Producer of raw records.
///
/// `next` must be cancel safe: dropping its future before it resolves must
/// not lose a record.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Next record, or `None` at end of stream.
    async fn next(&mut self) -> Result<Option<RawRecord>, SourceError>;

    /// Reposition so the next record produced has offset `offset`.
    async fn resume_from(&mut self, offset: u64) -> Result<(), SourceError>;

    /// Shared handle to the read position.
    fn offsets(&self) -> OffsetHandle;

    /// Offset of the next record to be produced.
    fn position(&self) -> u64 {
        self.offsets().get()
    }

    /// All records below `offset` are covered by a durable checkpoint.
    fn commit(&mut self, _offset: u64) {}
}

/// Build the source selected by `[source]`.
pub fn source_from_config(config: &Config) -> Box<dyn RecordSource> {
    match &config.source {
        SourceConfig::Generator { interval_ms, limit } => Box::new(GeneratorSource::new(
            Duration::from_millis(*interval_ms),
            *limit,
        )),
        SourceConfig::File {
            path,
            field_delimiter,
        } => Box::new(FileSource::new(path.clone(), *field_delimiter)),
    }
}

const GENERATOR_NAMES: [&str; 4] = ["stephen", "lebron", "kobe", "alice"];

/// Demo feed emitting `(name, score)` rows at a fixed pace.
///
/// The row at offset N is a pure function of N, so the feed is seekable.
pub struct GeneratorSource {
    interval: Duration,
    limit: Option<u64>,
    position: OffsetHandle,
}

impl GeneratorSource {
    pub fn new(interval: Duration, limit: Option<u64>) -> Self {
        Self {
            interval,
            limit,
            position: OffsetHandle::default(),
        }
    }

    /// The row produced at `offset`.
    pub fn row_at(offset: u64) -> Vec<String> {
        let name = GENERATOR_NAMES[(offset % GENERATOR_NAMES.len() as u64) as usize];
        vec![name.to_string(), (offset % 100).to_string()]
    }
}

#[async_trait]
impl RecordSource for GeneratorSource {
    async fn next(&mut self) -> Result<Option<RawRecord>, SourceError> {
        let offset = self.position.get();
        if self.limit.is_some_and(|limit| offset >= limit) {
            return Ok(None);
        }

        if self.interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.interval).await;
        }

        self.position.set(offset + 1);
        Ok(Some(RawRecord::new(offset, Self::row_at(offset))))
    }

    async fn resume_from(&mut self, offset: u64) -> Result<(), SourceError> {
        self.position.set(offset);
        Ok(())
    }

    fn offsets(&self) -> OffsetHandle {
        self.position.clone()
    }
}

/// Delimited text file, one record per non-empty line.
pub struct FileSource {
    path: PathBuf,
    field_delimiter: char,
    lines: Option<Lines<BufReader<File>>>,
    position: OffsetHandle,
}

impl FileSource {
    pub fn new(path: PathBuf, field_delimiter: char) -> Self {
        Self {
            path,
            field_delimiter,
            lines: None,
            position: OffsetHandle::default(),
        }
    }

    async fn open(&self) -> Result<Lines<BufReader<File>>, SourceError> {
        let file = File::open(&self.path).await.map_err(|e| {
            SourceError::io(format!("opening source file {}", self.path.display()), e)
        })?;
        Ok(BufReader::new(file).lines())
    }

    /// Next non-empty line, or `None` at end of file.
    async fn next_line(
        lines: &mut Lines<BufReader<File>>,
    ) -> Result<Option<String>, SourceError> {
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| SourceError::io("reading source file", e))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.trim_end_matches('\r').to_string())),
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl RecordSource for FileSource {
    async fn next(&mut self) -> Result<Option<RawRecord>, SourceError> {
        if self.lines.is_none() {
            self.lines = Some(self.open().await?);
        }
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        let Some(line) = Self::next_line(lines).await? else {
            return Ok(None);
        };

        let offset = self.position.get();
        self.position.set(offset + 1);
        let fields = line
            .split(self.field_delimiter)
            .map(str::to_string)
            .collect();
        Ok(Some(RawRecord::new(offset, fields)))
    }

    async fn resume_from(&mut self, offset: u64) -> Result<(), SourceError> {
        let mut lines = self.open().await?;
        for skipped in 0..offset {
            if Self::next_line(&mut lines).await?.is_none() {
                return Err(SourceError::ResumeUnavailable {
                    requested: offset,
                    reason: format!("file ends after {skipped} records"),
                });
            }
        }
        debug!(path = %self.path.display(), offset, "File source repositioned");
        self.lines = Some(lines);
        self.position.set(offset);
        Ok(())
    }

    fn offsets(&self) -> OffsetHandle {
        self.position.clone()
    }
}

/// Non-seekable in-process feed.
///
/// Records above the last committed offset are kept in a replay log so the
/// source can be rewound to any uncommitted offset.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<String>>,
    /// Records with offset >= `committed`, in offset order
    log: VecDeque<RawRecord>,
    committed: u64,
    /// Offset the next record received from the channel gets
    received: u64,
    position: OffsetHandle,
}

impl ChannelSource {
    /// Create a source and the sender feeding it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self {
            rx,
            log: VecDeque::new(),
            committed: 0,
            received: 0,
            position: OffsetHandle::default(),
        };
        (source, tx)
    }

    /// Records held for replay.
    pub fn replay_len(&self) -> usize {
        self.log.len()
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<RawRecord>, SourceError> {
        let position = self.position.get();

        if position < self.received {
            let index = (position - self.committed) as usize;
            let record = self.log.get(index).cloned().ok_or_else(|| {
                SourceError::ResumeUnavailable {
                    requested: position,
                    reason: "record missing from replay log".to_string(),
                }
            })?;
            self.position.set(position + 1);
            return Ok(Some(record));
        }

        let Some(fields) = self.rx.recv().await else {
            return Ok(None);
        };
        let record = RawRecord::new(self.received, fields);
        self.received += 1;
        self.log.push_back(record.clone());
        self.position.set(self.received);
        Ok(Some(record))
    }

    async fn resume_from(&mut self, offset: u64) -> Result<(), SourceError> {
        if offset < self.committed || offset > self.received {
            return Err(SourceError::ResumeUnavailable {
                requested: offset,
                reason: format!(
                    "replay log covers offsets {}..{}",
                    self.committed, self.received
                ),
            });
        }
        if offset < self.position.get() {
            info!(
                offset,
                replay = self.received - offset,
                "Replaying uncommitted records"
            );
        }
        self.position.set(offset);
        Ok(())
    }

    fn offsets(&self) -> OffsetHandle {
        self.position.clone()
    }

    fn commit(&mut self, offset: u64) {
        let offset = offset.min(self.received);
        while self.log.front().is_some_and(|r| r.offset < offset) {
            self.log.pop_front();
        }
        self.committed = self.committed.max(offset);
    }
}
