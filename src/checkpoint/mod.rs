//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `Checkpoint`: Durable snapshot of source offset and buffer contents
//! - `CheckpointStorage`: Persistence of checkpoints (file-backed or in-process)
//! - `CheckpointCoordinator`: Periodic checkpointing with timeout and failure tolerance

mod coordinator;
mod state;
mod store;

pub use coordinator::*;
pub use state::*;
pub use store::*;
