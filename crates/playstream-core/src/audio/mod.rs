//! Platform stream layer
//!
//! Abstracts a push-style audio output API behind three traits:
//!
//! - [`AudioPlatform`]: hands out stream builders
//! - [`StreamBuilder`]: collects the requested configuration and opens a stream
//! - [`PlatformStream`]: state machine, bounded waits and blocking writes
//!
//! On top of those sit [`StreamFactory`], which opens and latency-tunes a
//! playback stream, and [`StreamHandle`], which owns it and drives the
//! start/stop transitions.
//!
//! # Backends
//!
//! - **Simulated**: always available, scriptable, used by tests and `--simulate`
//! - **CPAL**: real output devices (with the `cpal-backend` feature)

mod config;
mod error;
mod factory;
mod handle;
mod platform;
pub mod sim;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;

pub use config::{
    DeviceId, PerformanceMode, SampleFormat, StreamParameters, StreamProperties,
    DEFAULT_SAMPLE_RATE, STATE_TRANSITION_TIMEOUT, STEREO_CHANNEL_COUNT, WRITE_TIMEOUT_BURSTS,
};
pub use error::{AudioError, AudioResult};
pub use factory::StreamFactory;
pub use handle::StreamHandle;
pub use platform::{
    AudioPlatform, ErrorCallback, PlatformStream, StreamBuilder, StreamErrorEvent, StreamState,
};
pub use sim::{SimulatedPlatform, SimulatedStream};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::{list_output_devices, CpalPlatform};
