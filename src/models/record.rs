//! Record and batch types for streamload.
//!
//! These types represent the core data flow through the pipeline:
//! `RawRecord` (source) → `Record` (transform) → `Batch` (buffer, loader).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Untyped row produced by a record source.
///
/// Every raw record carries the source offset it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Monotonic source offset (0-based)
    pub offset: u64,

    /// Field values in column order, as produced upstream
    pub fields: Vec<String>,
}

impl RawRecord {
    pub fn new(offset: u64, fields: Vec<String>) -> Self {
        Self { offset, fields }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    Null,
}

impl Value {
    /// Approximate encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Int(v) => v.to_string().len(),
            Value::Str(s) => s.len(),
            Value::Null => 2,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            // StarRocks CSV null marker
            Value::Null => write!(f, "\\N"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

/// Typed output record, one value per schema column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Approximate encoded size of this record in bytes, separators included.
    pub fn encoded_len(&self) -> usize {
        self.values.iter().map(Value::encoded_len).sum::<usize>() + self.values.len()
    }
}

/// A record held in the buffer together with the offset it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub offset: u64,
    pub record: Record,
}

/// An immutable group of records flushed to the sink in one load call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonically increasing per pipeline run
    pub sequence_id: u64,

    /// Offset of the first record in this batch (inclusive)
    pub first_offset: u64,

    /// Offset of the last record in this batch (inclusive)
    pub last_offset: u64,

    /// Records in source order
    pub records: Vec<Record>,
}

impl Batch {
    /// Build a batch from buffered records. Returns `None` for an empty slice.
    pub fn from_buffered(sequence_id: u64, buffered: Vec<BufferedRecord>) -> Option<Self> {
        let first_offset = buffered.first()?.offset;
        let last_offset = buffered.last()?.offset;
        Some(Self {
            sequence_id,
            first_offset,
            last_offset,
            records: buffered.into_iter().map(|b| b.record).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Approximate encoded size in bytes.
    pub fn byte_size(&self) -> usize {
        self.records.iter().map(Record::encoded_len).sum()
    }
}

/// Outcome of a successful load call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadAck {
    /// Sequence id of the acknowledged batch
    pub sequence_id: u64,

    /// Rows the store reports as loaded
    pub rows_loaded: u64,

    /// Whether the store recognized this batch as already applied
    pub duplicate: bool,
}
