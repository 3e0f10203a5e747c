//! Playback stream construction
//!
//! Builds a stream with the fixed [`StreamParameters`], registers the
//! error-notification hook, then tunes the buffer down to a single burst:
//! the smallest size the platform can reliably service, and therefore the
//! lowest latency without underruns.

use std::sync::Arc;

use super::config::{PerformanceMode, StreamParameters, StreamProperties};
use super::error::AudioResult;
use super::handle::StreamHandle;
use super::platform::{AudioPlatform, ErrorCallback, PlatformStream};

/// Creates playback streams on one platform
pub struct StreamFactory {
    platform: Arc<dyn AudioPlatform>,
    params: StreamParameters,
}

impl StreamFactory {
    pub fn new(platform: Arc<dyn AudioPlatform>, params: StreamParameters) -> Self {
        Self { platform, params }
    }

    pub fn parameters(&self) -> &StreamParameters {
        &self.params
    }

    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    /// Build, open and latency-tune a playback stream
    ///
    /// Failures are logged and returned. None of them are fatal, playback
    /// simply does not start.
    pub fn create_playback_stream(&self, on_error: ErrorCallback) -> AudioResult<StreamHandle> {
        let mut builder = self.platform.create_stream_builder().map_err(|e| {
            log::error!("[StreamFactory] Unable to obtain a stream builder: {}", e);
            e
        })?;

        builder.set_device_id(&self.params.device);
        builder.set_format(self.params.format);
        builder.set_channel_count(self.params.channel_count);
        builder.set_sample_rate(self.params.sample_rate);
        builder.set_error_callback(on_error);

        let stream = builder.open_stream().map_err(|e| {
            log::error!("[StreamFactory] Failed to create playback stream: {}", e);
            e
        })?;

        let sample_rate = stream.sample_rate();
        let frames_per_burst = stream.frames_per_burst();
        if sample_rate != self.params.sample_rate {
            log::info!(
                "[StreamFactory] Requested {}Hz, platform granted {}Hz",
                self.params.sample_rate,
                sample_rate
            );
        }

        warn_if_not_low_latency(stream.performance_mode());

        let buffer_size_frames = match stream.set_buffer_size_in_frames(frames_per_burst) {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!(
                    "[StreamFactory] Could not set buffer size to {} frames: {}",
                    frames_per_burst,
                    e
                );
                stream.buffer_size_in_frames()
            }
        };

        let properties = StreamProperties {
            stream_id: stream.id(),
            sample_rate,
            channel_count: stream.channel_count(),
            frames_per_burst,
            buffer_size_frames,
            performance_mode: stream.performance_mode(),
        };

        log_stream_info(stream.as_ref(), &properties);

        Ok(StreamHandle::new(stream, properties))
    }
}

/// Diagnostic for the granted latency class
fn warn_if_not_low_latency(mode: PerformanceMode) {
    match mode {
        PerformanceMode::LowLatency => {
            log::info!("[StreamFactory] Stream is low latency");
        }
        PerformanceMode::PowerSaving => {
            log::warn!(
                "[StreamFactory] Stream is NOT low latency, it is power saving. \
                 Check the requested format, sample rate and channel count"
            );
        }
        PerformanceMode::None => {
            log::warn!("[StreamFactory] Stream does not offer particular performance needs");
        }
    }
}

fn log_stream_info(stream: &dyn PlatformStream, properties: &StreamProperties) {
    log::info!(
        "[StreamFactory] Stream {}: device={}, {}Hz, {} channels, {}, \
         {} frames/burst, buffer {} of {} frames (~{:.1}ms), {}, state {}",
        properties.stream_id,
        stream.device_name(),
        properties.sample_rate,
        properties.channel_count,
        stream.format(),
        properties.frames_per_burst,
        properties.buffer_size_frames,
        stream.buffer_capacity_in_frames(),
        properties.latency_ms(),
        properties.performance_mode,
        stream.state()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sim::SimulatedPlatform;
    use crate::audio::{AudioError, StreamState};

    fn factory(platform: &SimulatedPlatform) -> StreamFactory {
        StreamFactory::new(Arc::new(platform.clone()), StreamParameters::playback())
    }

    fn noop() -> ErrorCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_buffer_tuned_to_one_burst() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(240);
        let handle = factory(&platform).create_playback_stream(noop()).unwrap();

        let props = handle.properties();
        assert_eq!(props.frames_per_burst, 240);
        assert_eq!(props.buffer_size_frames, 240);
        assert_eq!(
            platform.latest_stream().unwrap().buffer_size_in_frames(),
            240
        );
        assert_eq!(handle.state(), StreamState::Open);
    }

    #[test]
    fn test_granted_rate_recorded() {
        let platform = SimulatedPlatform::new();
        platform.set_granted_sample_rate(Some(44100));
        platform.set_performance_mode(PerformanceMode::PowerSaving);
        let handle = factory(&platform).create_playback_stream(noop()).unwrap();

        assert_eq!(handle.properties().sample_rate, 44100);
        assert_eq!(handle.properties().performance_mode, PerformanceMode::PowerSaving);
    }

    #[test]
    fn test_builder_failure_is_reported() {
        let platform = SimulatedPlatform::new();
        platform.set_fail_builder(true);
        let result = factory(&platform).create_playback_stream(noop());
        assert!(matches!(result, Err(AudioError::BuilderUnavailable(_))));
        assert_eq!(platform.open_stream_count(), 0);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let platform = SimulatedPlatform::new();
        platform.set_fail_open(true);
        let result = factory(&platform).create_playback_stream(noop());
        assert!(matches!(result, Err(AudioError::StreamOpen(_))));
        assert_eq!(platform.builders_created(), 1);
    }
}
