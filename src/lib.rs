//! Backpressure-aware streams: readable (with zero-copy byte reads), writable
//! and transform streams, plus piping and teeing between them.
//!
//! Every stream is driven by a future returned from its builder's `prepare()`
//! (or handed to an executor through `spawn()`); that future owns the user's
//! source, sink or transformer and runs its callbacks one at a time.

pub mod platform;
pub mod streams;

pub use streams::*;
