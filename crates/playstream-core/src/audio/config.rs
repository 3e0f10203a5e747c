//! Fixed playback stream parameters
//!
//! The playback stream is always built with the same format. These values
//! are compiled in and not configurable at runtime; the platform may still
//! grant a different sample rate or burst size, which is reported through
//! [`StreamProperties`].

use std::fmt;
use std::time::Duration;

/// Requested sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Stereo output
pub const STEREO_CHANNEL_COUNT: u16 = 2;

/// Ceiling for every start/stop state-transition wait
pub const STATE_TRANSITION_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of bursts a single blocking write may wait for before giving up
pub const WRITE_TIMEOUT_BURSTS: u32 = 4;

/// Sample format of the playback stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed PCM
    I16,
    /// 32-bit float PCM
    F32,
}

impl SampleFormat {
    /// Size of a single sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::I16 => write!(f, "PCM_I16"),
            SampleFormat::F32 => write!(f, "PCM_FLOAT"),
        }
    }
}

/// Output device selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceId {
    /// Let the platform pick its default output
    #[default]
    Unspecified,
    /// Specific device by name as reported by the platform
    Named(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Unspecified => write!(f, "default"),
            DeviceId::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Latency class granted by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    /// No particular performance needs
    #[default]
    None,
    /// Larger buffers, lower power
    PowerSaving,
    /// Smallest buffers the device can service
    LowLatency,
}

impl fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceMode::None => write!(f, "none"),
            PerformanceMode::PowerSaving => write!(f, "power-saving"),
            PerformanceMode::LowLatency => write!(f, "low-latency"),
        }
    }
}

/// Parameters applied to every stream builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
    pub format: SampleFormat,
    pub channel_count: u16,
    pub sample_rate: u32,
    pub device: DeviceId,
}

impl StreamParameters {
    /// 16-bit stereo at 48kHz on the default device
    pub fn playback() -> Self {
        Self {
            format: SampleFormat::I16,
            channel_count: STEREO_CHANNEL_COUNT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            device: DeviceId::Unspecified,
        }
    }

    /// Target a specific output device instead of the default
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self::playback()
    }
}

/// Properties granted by the platform for one stream
///
/// Refreshed every time a stream is (re)created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperties {
    /// Stream id assigned by the platform
    pub stream_id: u64,
    /// Sample rate actually granted (may differ from the request)
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Minimum schedulable unit of frames
    pub frames_per_burst: u32,
    /// Buffer size applied after tuning (one burst when the platform accepts it)
    pub buffer_size_frames: u32,
    pub performance_mode: PerformanceMode,
}

impl StreamProperties {
    /// Output latency of the tuned buffer in milliseconds
    pub fn latency_ms(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.buffer_size_frames as f32 / self.sample_rate as f32) * 1000.0
    }

    /// Duration of a single burst
    pub fn burst_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.frames_per_burst as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Timeout used for one blocking write of up to a burst of frames
    pub fn write_timeout(&self) -> Duration {
        self.burst_duration() * WRITE_TIMEOUT_BURSTS
    }
}
