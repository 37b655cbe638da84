//! streamload - Fault-tolerant streaming ingestion into analytical stores.
//!
//! ## Architecture
//!
//! Records flow through four stages:
//! - **Record Source**: produces raw records with monotonic offsets
//! - **Transform**: maps raw records to typed records, deterministically
//! - **Batch Buffer**: cuts batches on row count, byte size or time
//! - **Load Pool**: sends each batch as one stream load request
//!
//! Two components watch over them:
//! - **Checkpoint Coordinator**: periodically persists source offset and buffer contents
//! - **Restart Supervisor**: restarts from the latest checkpoint within a failure budget
//!
//! ## Delivery
//!
//! At-least-once. Every batch carries a label derived from its offset range;
//! stores that track labels drop redelivered batches.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network and storage uncertainties (retry, timeout, restart)

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointStorage, FileCheckpointStore};
pub use client::{RowSerializer, SinkLoader, StreamLoadClient};
pub use models::{Config, PipelineError, Result, RunStats};
pub use pipeline::{PipelineState, RecordSource, RunReport, Supervisor, Transform};
pub use pool::LoadPool;
