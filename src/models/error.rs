//! Error types for streamload.
//!
//! Taxonomy:
//! - Stage errors: one enum per pipeline stage (source, transform, load, checkpoint)
//! - Pipeline errors: stage errors tagged for the restart supervisor
//! - Invariant violations: internal bugs, channel teardown

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Source,
    Transform,
    Sink,
    Checkpoint,
    Supervisor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Source => write!(f, "source"),
            Stage::Transform => write!(f, "transform"),
            Stage::Sink => write!(f, "sink"),
            Stage::Checkpoint => write!(f, "checkpoint"),
            Stage::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// Top-level error type for streamload.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ═══════════════════════════════════════════════════════════════════
    // STAGE FAILURES: escalated into the restart supervisor
    // ═══════════════════════════════════════════════════════════════════
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Transform error at offset {offset}: {source}")]
    Transform {
        offset: u64,
        #[source]
        source: TransformError,
    },

    #[error("Load of batch {sequence_id} failed after {attempts} attempts: {source}")]
    Load {
        sequence_id: u64,
        attempts: u32,
        #[source]
        source: LoadError,
    },

    #[error("Checkpoint failure tolerance exceeded ({consecutive} consecutive failures): {last}")]
    CheckpointToleranceExceeded {
        consecutive: u32,
        last: CheckpointError,
    },

    // ═══════════════════════════════════════════════════════════════════
    // TERMINAL: the pipeline will not be restarted
    // ═══════════════════════════════════════════════════════════════════
    #[error("Restart budget exhausted: {failures} failures within {window:?} (last: {last_cause})")]
    RestartBudgetExhausted {
        failures: usize,
        window: Duration,
        last_cause: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT VIOLATED: should not happen
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl PipelineError {
    /// Stage this failure is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Source(_) => Stage::Source,
            Self::Transform { .. } => Stage::Transform,
            Self::Load { .. } => Stage::Sink,
            Self::CheckpointToleranceExceeded { .. } | Self::Checkpoint(_) => Stage::Checkpoint,
            Self::RestartBudgetExhausted { .. }
            | Self::Config(_)
            | Self::Internal(_)
            | Self::ChannelClosed => Stage::Supervisor,
        }
    }
}

/// Errors raised by a record source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed record at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("Cannot resume from offset {requested}: {reason}")]
    ResumeUnavailable { requested: u64, reason: String },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors raised while transforming a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Column '{column}': cannot parse '{value}' as {kind}")]
    Parse {
        column: String,
        value: String,
        kind: String,
    },

    #[error("Column '{column}': value of {len} bytes exceeds limit of {max}")]
    ValueTooLong {
        column: String,
        len: usize,
        max: usize,
    },

    #[error("Column '{column}': value contains a reserved delimiter byte sequence")]
    DelimiterCollision { column: String },
}

/// Errors raised by a sink loader.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Load timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Batch rejected ({status}): {message}")]
    Rejected { status: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl LoadError {
    /// Check if this error is worth retrying with the same batch.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::AuthenticationFailed
            | Self::Rejected { .. }
            | Self::InvalidResponse(_)
            | Self::Encoding(_) => false,
        }
    }
}

/// Errors raised while writing or reading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint {id} write timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Checkpoint storage task failed: {0}")]
    Task(String),
}

impl CheckpointError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for streamload.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_retry_classification() {
        assert!(LoadError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(LoadError::Unavailable("down".into()).is_retryable());
        assert!(
            LoadError::Http {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !LoadError::Http {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!LoadError::AuthenticationFailed.is_retryable());
        assert!(
            !LoadError::Rejected {
                status: "Fail".into(),
                message: "too many filtered rows".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_pipeline_error_stage() {
        let err = PipelineError::Transform {
            offset: 3,
            source: TransformError::FieldCount {
                expected: 2,
                actual: 1,
            },
        };
        assert_eq!(err.stage(), Stage::Transform);
        assert_eq!(
            PipelineError::Source(SourceError::Unreachable("x".into())).stage(),
            Stage::Source
        );
        assert_eq!(
            PipelineError::Load {
                sequence_id: 0,
                attempts: 3,
                source: LoadError::Timeout(Duration::from_secs(1)),
            }
            .stage(),
            Stage::Sink
        );
    }
}
