//! Pool module - load pool for flushed batches.

mod loader;

pub use loader::*;
