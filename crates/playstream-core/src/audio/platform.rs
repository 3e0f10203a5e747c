//! Platform audio capability traits
//!
//! The engine never talks to an audio API directly. It consumes four
//! capabilities from the platform: a stream builder, a stream handle,
//! a blocking state-wait, and an error-notification callback.
//!
//! Implementations:
//! - [`SimulatedPlatform`](super::sim::SimulatedPlatform): in-process, scriptable
//! - `CpalPlatform`: real output through CPAL (feature `cpal-backend`)
//!
//! This file must NOT contain backend-specific imports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::config::{DeviceId, PerformanceMode, SampleFormat};
use super::error::AudioResult;

/// Platform-side state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Uninitialized,
    Open,
    Starting,
    Started,
    Pausing,
    Paused,
    Flushing,
    Flushed,
    Stopping,
    Stopped,
    Closing,
    Closed,
    /// Backing device went away; the stream must be recreated
    Disconnected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Uninitialized => "UNINITIALIZED",
            StreamState::Open => "OPEN",
            StreamState::Starting => "STARTING",
            StreamState::Started => "STARTED",
            StreamState::Pausing => "PAUSING",
            StreamState::Paused => "PAUSED",
            StreamState::Flushing => "FLUSHING",
            StreamState::Flushed => "FLUSHED",
            StreamState::Stopping => "STOPPING",
            StreamState::Stopped => "STOPPED",
            StreamState::Closing => "CLOSING",
            StreamState::Closed => "CLOSED",
            StreamState::Disconnected => "DISCONNECTED",
        };
        write!(f, "{}", name)
    }
}

/// Error reported asynchronously by the platform for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorEvent {
    /// Stream the error belongs to
    pub stream_id: u64,
    /// Stream state observed when the error was raised
    pub state: StreamState,
    /// Human-readable platform error text
    pub message: String,
}

/// Error-notification hook registered on a builder
///
/// Invoked on the platform's own audio thread. Must not block.
pub type ErrorCallback = Arc<dyn Fn(StreamErrorEvent) + Send + Sync>;

/// Entry point into a platform audio subsystem
pub trait AudioPlatform: Send + Sync {
    /// Obtain a fresh stream builder
    fn create_stream_builder(&self) -> AudioResult<Box<dyn StreamBuilder>>;

    /// Backend name for logging (e.g., "CPAL", "Simulated")
    fn name(&self) -> &'static str;
}

/// Accumulates stream parameters, then finalizes into a stream
pub trait StreamBuilder: Send {
    fn set_device_id(&mut self, device: &DeviceId);
    fn set_format(&mut self, format: SampleFormat);
    fn set_channel_count(&mut self, channels: u16);
    fn set_sample_rate(&mut self, sample_rate: u32);
    fn set_error_callback(&mut self, callback: ErrorCallback);

    /// Finalize the builder into an open (not yet started) stream
    fn open_stream(self: Box<Self>) -> AudioResult<Arc<dyn PlatformStream>>;
}

/// One open output stream
///
/// All methods take `&self`: the platform synchronizes internally, so the
/// writer thread can push samples while the lifecycle thread waits on state.
pub trait PlatformStream: Send + Sync {
    /// Platform-assigned identifier, unique per opened stream
    fn id(&self) -> u64;

    fn device_name(&self) -> String;
    fn format(&self) -> SampleFormat;
    fn channel_count(&self) -> u16;
    fn sample_rate(&self) -> u32;
    fn frames_per_burst(&self) -> u32;
    fn performance_mode(&self) -> PerformanceMode;

    /// Current buffer size in frames
    fn buffer_size_in_frames(&self) -> u32;

    /// Maximum buffer size the stream can be tuned to
    fn buffer_capacity_in_frames(&self) -> u32;

    /// Request a buffer size; returns the size actually applied
    fn set_buffer_size_in_frames(&self, frames: u32) -> AudioResult<u32>;

    fn state(&self) -> StreamState;

    /// Asynchronous start request; the stream moves to `Starting`
    fn request_start(&self) -> AudioResult<()>;

    /// Asynchronous stop request; the stream moves to `Stopping`
    fn request_stop(&self) -> AudioResult<()>;

    /// Block until the state differs from `current` or `timeout` elapses
    ///
    /// Returns the new state, or `AudioError::StateTimeout` when the state
    /// is still `current` at the deadline.
    fn wait_for_state_change(&self, current: StreamState, timeout: Duration) -> AudioResult<StreamState>;

    /// Blocking write of interleaved samples
    ///
    /// Returns the number of frames accepted before `timeout`.
    fn write(&self, samples: &[i16], timeout: Duration) -> AudioResult<usize>;

    /// Release platform resources
    ///
    /// Any in-flight callback on this stream has completed when this returns.
    fn close(&self) -> AudioResult<()>;
}
