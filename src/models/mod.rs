//! Core data models for streamload.
//!
//! - `config`: immutable start-up configuration
//! - `error`: per-stage error taxonomy
//! - `record`: records and batches flowing through the pipeline
//! - `stats`: run counters

mod config;
mod error;
mod record;
mod stats;

pub use config::*;
pub use error::*;
pub use record::*;
pub use stats::*;
