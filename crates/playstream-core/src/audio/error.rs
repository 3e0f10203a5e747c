//! Audio stream error types

use thiserror::Error;

use super::platform::StreamState;

/// Errors that can occur during stream lifecycle operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The platform could not hand out a stream builder
    #[error("Unable to obtain a stream builder: {0}")]
    BuilderUnavailable(String),

    /// The builder failed to finalize a stream
    #[error("Failed to open playback stream: {0}")]
    StreamOpen(String),

    /// A state transition was not confirmed within the wait ceiling
    #[error("Timed out waiting for {operation} (stream still {state})")]
    StateTimeout {
        operation: &'static str,
        state: StreamState,
    },

    /// A state transition settled somewhere other than where it was driven
    #[error("{operation} ended in {actual}, expected {expected}")]
    UnexpectedState {
        operation: &'static str,
        expected: StreamState,
        actual: StreamState,
    },

    /// Platform call returned an error code
    #[error("Platform error: {0}")]
    Platform(String),

    /// `start()` was called while a stream is already open
    #[error("A playback stream is already running")]
    AlreadyRunning,

    /// Host operation issued before `init()`
    #[error("Engine is not initialized, call init() first")]
    NotInitialized,

    /// Operation on a stream that has been closed
    #[error("Stream {0} is closed")]
    StreamClosed(u64),

    /// Backend-specific failure (device lookup, thread spawn, ...)
    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
