//! Playback lifecycle engine
//!
//! [`StreamEngine`] ties the stream layer together: it opens one playback
//! stream at a time, feeds it from a writer thread, and replaces it when
//! the device behind it goes away.

mod controller;
mod counters;
mod restart;
mod writer;

pub use controller::StreamEngine;
pub use counters::{CounterSnapshot, LifecycleCounters};
pub use restart::RestartOutcome;
pub use writer::{BufferWriter, PendingBuffer};
