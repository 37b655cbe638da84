//! Configuration models for streamload.
//!
//! Everything the pipeline needs at start-up is parameterized here and
//! resolved once from a TOML file. The resulting `Config` is immutable and
//! shared as `Arc<Config>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Top-level configuration for streamload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where records come from
    pub source: SourceConfig,

    /// Where batches are loaded
    pub sink: SinkConfig,

    /// Target table columns
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Transform stage settings
    #[serde(default)]
    pub transform: TransformConfig,

    /// Batch buffer flush policy
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Checkpoint cadence and retention
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Restart supervisor policy
    #[serde(default)]
    pub restart: RestartConfig,
}

/// Record source configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Built-in demo feed emitting `(name, score)` rows
    Generator {
        /// Delay between rows in milliseconds
        #[serde(default = "default_generator_interval")]
        interval_ms: u64,

        /// Stop after this many rows (unbounded when absent)
        #[serde(default)]
        limit: Option<u64>,
    },

    /// Delimited text file, one row per line
    File {
        path: PathBuf,

        #[serde(default = "default_field_delimiter")]
        field_delimiter: char,
    },
}

fn default_generator_interval() -> u64 {
    1000
}

fn default_field_delimiter() -> char {
    ','
}

/// Sink (stream load) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// HTTP address of the load endpoint, e.g. "http://master1:8030"
    pub load_url: String,

    /// Target database
    pub database: String,

    /// Target table
    pub table: String,

    #[serde(default = "default_username")]
    pub username: String,

    /// Password (supports ${ENV_VAR} expansion)
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Row encoding sent to the store
    #[serde(default)]
    pub format: SinkFormat,

    /// Column separator, `\xNN` escapes allowed
    #[serde(default = "default_column_separator")]
    pub column_separator: String,

    /// Row delimiter, `\xNN` escapes allowed
    #[serde(default = "default_row_delimiter")]
    pub row_delimiter: String,

    /// Prefix for load labels
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Per-load timeout in milliseconds
    #[serde(default = "default_load_timeout")]
    pub timeout_ms: u64,

    /// Local retries of one batch before escalating
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Retry backoff cap in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Concurrent load calls
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_username() -> String {
    "root".to_string()
}

fn default_column_separator() -> String {
    "\\x01".to_string()
}

fn default_row_delimiter() -> String {
    "\\x02".to_string()
}

fn default_label_prefix() -> String {
    "streamload".to_string()
}

fn default_load_timeout() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_parallelism() -> usize {
    1
}

/// Row encoding for stream load.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// Delimited text with column/row separators
    #[default]
    Csv,
    /// JSON array of objects
    Json,
}

/// Target table schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaConfig {
    pub columns: Vec<ColumnSpec>,
}

impl Default for SchemaConfig {
    /// The demo table: `name VARCHAR(20), score INT`.
    fn default() -> Self {
        Self {
            columns: vec![
                ColumnSpec {
                    name: "name".to_string(),
                    kind: ColumnType::Varchar,
                    length: Some(20),
                },
                ColumnSpec {
                    name: "score".to_string(),
                    kind: ColumnType::Int,
                    length: None,
                },
            ],
        }
    }
}

impl SchemaConfig {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One column of the target table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ColumnType,

    /// Maximum byte length (varchar only)
    #[serde(default)]
    pub length: Option<usize>,
}

/// Supported column types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Varchar,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Bigint,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Varchar => write!(f, "varchar"),
            ColumnType::Int => write!(f, "int"),
            ColumnType::Bigint => write!(f, "bigint"),
        }
    }
}

/// Transform stage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub on_error: TransformErrorPolicy,
}

/// What to do with a record the transform cannot convert.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformErrorPolicy {
    /// Escalate to the restart supervisor
    #[default]
    Fail,
    /// Log, drop the record and continue
    Skip,
}

/// Batch buffer flush policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Flush at least this often (milliseconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Flush when this many rows are buffered
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Flush before buffered bytes would exceed this
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_flush_interval() -> u64 {
    5000
}

fn default_max_rows() -> usize {
    500_000
}

fn default_max_bytes() -> usize {
    90 * 1024 * 1024
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Checkpoint coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding externalized checkpoints
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_checkpoint_interval")]
    pub interval_ms: u64,

    /// Abandon a checkpoint write after this long
    #[serde(default = "default_checkpoint_timeout")]
    pub timeout_ms: u64,

    /// Checkpoints allowed in flight at once (only 1 is supported)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Minimum pause between the end of one checkpoint and the start of the next
    #[serde(default = "default_min_pause")]
    pub min_pause_ms: u64,

    /// Consecutive failed checkpoints absorbed before escalating
    #[serde(default = "default_tolerable_failures")]
    pub tolerable_failures: u32,

    #[serde(default)]
    pub retention: CheckpointRetention,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_checkpoint_interval() -> u64 {
    30_000
}

fn default_checkpoint_timeout() -> u64 {
    10 * 60 * 1000
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_min_pause() -> u64 {
    500
}

fn default_tolerable_failures() -> u32 {
    u32::MAX
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval_ms: default_checkpoint_interval(),
            timeout_ms: default_checkpoint_timeout(),
            max_concurrent: default_max_concurrent(),
            min_pause_ms: default_min_pause(),
            tolerable_failures: default_tolerable_failures(),
            retention: CheckpointRetention::default(),
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_pause(&self) -> Duration {
        Duration::from_millis(self.min_pause_ms)
    }
}

/// What happens to externalized checkpoints when the pipeline stops cleanly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRetention {
    #[default]
    DeleteOnCancellation,
    RetainOnCancellation,
}

/// Restart supervisor policy (failure-rate restart strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Failures tolerated within the window
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    /// Wait before restarting
    #[serde(default = "default_restart_delay")]
    pub delay_ms: u64,
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window() -> u64 {
    5 * 60 * 1000
}

fn default_restart_delay() -> u64 {
    10_000
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            failure_window_ms: default_failure_window(),
            delay_ms: default_restart_delay(),
        }
    }
}

impl RestartConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.columns.is_empty() {
            return Err(ConfigError::Invalid {
                field: "schema.columns",
                reason: "at least one column is required".to_string(),
            });
        }
        if self.buffer.max_rows == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.max_rows",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.buffer.max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.max_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.buffer.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.flush_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sink.parallelism == 0 {
            return Err(ConfigError::Invalid {
                field: "sink.parallelism",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sink.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "sink.max_retries",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.checkpoint.max_concurrent != 1 {
            return Err(ConfigError::Invalid {
                field: "checkpoint.max_concurrent",
                reason: format!(
                    "only 1 concurrent checkpoint is supported, got {}",
                    self.checkpoint.max_concurrent
                ),
            });
        }
        if self.checkpoint.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint.interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.sink.format == SinkFormat::Csv {
            let column = self.sink.column_separator_bytes()?;
            let row = self.sink.row_delimiter_bytes()?;
            if self_overlaps(&column) {
                return Err(ConfigError::InvalidDelimiter {
                    name: "column_separator",
                    value: self.sink.column_separator.clone(),
                    reason: "must not end with its own prefix".to_string(),
                });
            }
            if self_overlaps(&row) {
                return Err(ConfigError::InvalidDelimiter {
                    name: "row_delimiter",
                    value: self.sink.row_delimiter.clone(),
                    reason: "must not end with its own prefix".to_string(),
                });
            }
            if overlaps(&column, &row) {
                return Err(ConfigError::InvalidDelimiter {
                    name: "row_delimiter",
                    value: self.sink.row_delimiter.clone(),
                    reason: "must not overlap the column separator".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the sink password from config or environment.
    ///
    /// An unset password is valid (the demo store uses an empty root password).
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        if let Some(password) = &self.sink.password {
            return Ok(expand_env_vars(password));
        }

        match &self.sink.password_env {
            Some(env_var) => std::env::var(env_var).map_err(|_| ConfigError::MissingPassword {
                env_var: env_var.clone(),
            }),
            None => Ok(String::new()),
        }
    }
}

impl SinkConfig {
    pub fn column_separator_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        parse_delimiter("column_separator", &self.column_separator)
    }

    pub fn row_delimiter_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        parse_delimiter("row_delimiter", &self.row_delimiter)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// True if either sequence contains the other, or one ends with a prefix of
/// the other. Either way a separator can match across a field boundary.
fn overlaps(a: &[u8], b: &[u8]) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long.windows(short.len()).any(|w| w == short) || joins(a, b) || joins(b, a)
}

/// A proper suffix of `a` equals a prefix of `b`.
fn joins(a: &[u8], b: &[u8]) -> bool {
    (1..a.len())
        .filter(|&k| k <= b.len())
        .any(|k| a[a.len() - k..] == b[..k])
}

/// A proper prefix of `s` is also its suffix, as in "aa" or "aba".
fn self_overlaps(s: &[u8]) -> bool {
    (1..s.len()).any(|k| s[..k] == s[s.len() - k..])
}

/// Parse a delimiter written with `\xNN`, `\n`, `\t`, `\r` or `\\` escapes.
pub fn parse_delimiter(name: &'static str, value: &str) -> Result<Vec<u8>, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDelimiter {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let mut bytes = Vec::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('x') | Some('X') => {
                let hex: String = chars.by_ref().take(2).collect();
                if hex.len() != 2 {
                    return Err(invalid("\\x escape needs two hex digits"));
                }
                let byte =
                    u8::from_str_radix(&hex, 16).map_err(|_| invalid("invalid hex digits"))?;
                bytes.push(byte);
            }
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some('\\') => bytes.push(b'\\'),
            Some(other) => return Err(invalid(&format!("unknown escape \\{other}"))),
            None => return Err(invalid("trailing backslash")),
        }
    }

    if bytes.is_empty() {
        return Err(invalid("must not be empty"));
    }
    Ok(bytes)
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing sink password: set {env_var} env var or sink.password in config")]
    MissingPassword { env_var: String },

    #[error("Invalid {name} '{value}': {reason}")]
    InvalidDelimiter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
