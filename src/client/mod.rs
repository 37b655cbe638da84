//! Sink client module: loader contract, row encodings, stream load over HTTP.

mod format;
mod sink;
mod stream_load;

pub use format::*;
pub use sink::*;
pub use stream_load::*;
