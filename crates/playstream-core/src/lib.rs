//! Playstream Core - Low-latency playback stream lifecycle
//!
//! Opens a stereo 16-bit playback stream tuned to the smallest workable
//! buffer, pushes caller-supplied audio to it from a writer thread, and
//! transparently reopens it when the output device disconnects.

pub mod audio;
pub mod engine;
pub mod host;

pub use audio::{AudioError, AudioResult, StreamParameters, StreamProperties};
pub use engine::StreamEngine;
pub use host::EngineHost;
