//! Pipeline module - stages, attempt runner and restart supervisor.

mod buffer;
mod runner;
mod source;
mod supervisor;
mod transform;

pub use buffer::*;
pub use runner::*;
pub use source::*;
pub use supervisor::*;
pub use transform::*;
