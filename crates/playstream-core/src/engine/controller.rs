//! Stream lifecycle controller
//!
//! Owns at most one playback stream and its writer. Start, stop and restart
//! all serialize on one lifecycle lock, so a restart can never interleave
//! with a host-initiated stop and a stopped engine is never resurrected.
//!
//! ```text
//!  host ──start/stop──▶ ┌────────────────┐ ◀──restart── restart worker
//!                       │ Mutex<Lifecycle>│                  ▲
//!                       │ stream + writer │                  │ (guarded)
//!                       └────────────────┘        stream error callback
//!  host ──write_buffer──▶ PendingBuffer ──▶ writer thread ──▶ stream
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audio::{
    AudioError, AudioPlatform, AudioResult, StreamFactory, StreamHandle, StreamParameters,
    StreamProperties, StreamState,
};

use super::counters::LifecycleCounters;
use super::restart::{RestartChannel, RestartOutcome, RestartTarget, RestartTrigger, RestartWorker};
use super::writer::{BufferWriter, PendingBuffer};

#[derive(Default)]
struct Lifecycle {
    stream: Option<StreamHandle>,
    writer: Option<BufferWriter>,
}

struct EngineShared {
    factory: StreamFactory,
    lifecycle: Mutex<Lifecycle>,
    pending: Arc<PendingBuffer>,
    trigger: RestartTrigger,
    counters: Arc<LifecycleCounters>,
}

/// Low-latency playback stream manager
///
/// All methods take `&self` and may be called from any thread.
pub struct StreamEngine {
    shared: Arc<EngineShared>,
    restart_worker: Option<RestartWorker>,
}

impl StreamEngine {
    /// Engine for the default stereo 16-bit 48kHz playback configuration
    pub fn new(platform: Arc<dyn AudioPlatform>) -> AudioResult<Self> {
        Self::with_parameters(platform, StreamParameters::playback())
    }

    pub fn with_parameters(platform: Arc<dyn AudioPlatform>, params: StreamParameters) -> AudioResult<Self> {
        log::info!(
            "[StreamEngine] Using {} platform ({} {}ch {}Hz, device {})",
            platform.name(),
            params.format,
            params.channel_count,
            params.sample_rate,
            params.device
        );

        let counters = Arc::new(LifecycleCounters::default());
        let channel = RestartChannel::new(Arc::clone(&counters));
        let shared = Arc::new(EngineShared {
            factory: StreamFactory::new(platform, params),
            lifecycle: Mutex::new(Lifecycle::default()),
            pending: Arc::new(PendingBuffer::new()),
            trigger: channel.trigger.clone(),
            counters,
        });
        let restart_worker = RestartWorker::spawn(channel, Arc::clone(&shared) as Arc<dyn RestartTarget>)?;

        Ok(Self {
            shared,
            restart_worker: Some(restart_worker),
        })
    }

    /// Open and start a playback stream, then launch the buffer writer
    ///
    /// Fails with [`AudioError::AlreadyRunning`] if a stream is already open.
    pub fn start(&self) -> AudioResult<StreamProperties> {
        let mut lifecycle = self.shared.lock_lifecycle();
        if let Some(stream) = &lifecycle.stream {
            log::warn!("[StreamEngine] start() ignored, stream {} already running", stream.id());
            return Err(AudioError::AlreadyRunning);
        }

        let properties = self.shared.open_playback_stream(&mut lifecycle)?;
        if let Err(e) = self.shared.launch_writer(&mut lifecycle) {
            log::error!("[StreamEngine] Failed to launch writer, closing stream {}", properties.stream_id);
            if let Err(close_err) = self.shared.close_playback_stream(&mut lifecycle) {
                log::warn!("[StreamEngine] Close after failed writer launch also failed: {}", close_err);
            }
            return Err(e);
        }
        log::info!("[StreamEngine] Playback started on stream {}", properties.stream_id);
        Ok(properties)
    }

    /// Stop the writer, stop and close the stream
    ///
    /// Idempotent: stopping an idle engine is `Ok`. The stream is released
    /// even if the stop transition fails, and that failure is returned.
    pub fn stop(&self) -> AudioResult<()> {
        let mut lifecycle = self.shared.lock_lifecycle();
        if lifecycle.stream.is_none() {
            log::debug!("[StreamEngine] stop() with no open stream");
            return Ok(());
        }
        let result = self.shared.close_playback_stream(&mut lifecycle);
        log::info!("[StreamEngine] Playback stopped");
        result
    }

    /// Hand a new interleaved buffer to the writer
    ///
    /// Never blocks on the stream. Replaces the previous buffer, which is
    /// cut short if the writer is still playing it. The latest buffer is
    /// kept across `stop()`: it is played once by every writer launch (each
    /// start and each restart) and once more whenever it is replaced.
    pub fn write_buffer(&self, samples: impl Into<Arc<[i16]>>) {
        let samples = samples.into();
        let frames = samples.len() / self.shared.factory.parameters().channel_count.max(1) as usize;
        let generation = self.shared.pending.replace(samples);
        log::debug!("[StreamEngine] Buffer {} supplied ({} frames)", generation, frames);
    }

    /// Request a restart of the current stream
    ///
    /// Same path a device disconnect takes. Returns `false` if nothing is
    /// playing or a restart is already in progress.
    pub fn restart_streams(&self) -> bool {
        let stream_id = match self.shared.lock_lifecycle().stream.as_ref() {
            Some(stream) => stream.id(),
            None => return false,
        };
        self.shared.trigger.request_restart(stream_id)
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_lifecycle().stream.is_some()
    }

    pub fn is_restarting(&self) -> bool {
        self.shared.trigger.is_restarting()
    }

    pub fn stream_properties(&self) -> Option<StreamProperties> {
        self.shared.lock_lifecycle().stream.as_ref().map(StreamHandle::properties)
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.shared.lock_lifecycle().stream.as_ref().map(StreamHandle::state)
    }

    pub fn counters(&self) -> &LifecycleCounters {
        &self.shared.counters
    }

    pub fn platform_name(&self) -> &'static str {
        self.shared.factory.platform_name()
    }

    /// Stop playback and the restart worker
    ///
    /// Called by `Drop`. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("[StreamEngine] Error stopping stream during shutdown: {}", e);
        }
        if let Some(mut worker) = self.restart_worker.take() {
            worker.shutdown();
            log::debug!("[StreamEngine] Restart worker joined");
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and start a stream, storing it in `lifecycle` on success
    ///
    /// A stream that fails to start is closed before returning.
    fn open_playback_stream(&self, lifecycle: &mut Lifecycle) -> AudioResult<StreamProperties> {
        let handle = self.factory.create_playback_stream(self.trigger.error_callback())?;
        self.counters.record_stream_opened();

        if let Err(e) = handle.start_stream() {
            log::error!("[StreamEngine] Failed to start stream {}, closing it", handle.id());
            if let Err(close_err) = handle.close_stream() {
                log::warn!("[StreamEngine] Close after failed start also failed: {}", close_err);
            }
            return Err(e);
        }

        let properties = handle.properties();
        lifecycle.stream = Some(handle);
        Ok(properties)
    }

    fn launch_writer(&self, lifecycle: &mut Lifecycle) -> AudioResult<()> {
        let Some(handle) = lifecycle.stream.as_ref() else {
            return Err(AudioError::NotInitialized);
        };
        let writer = BufferWriter::spawn(
            handle.platform_stream(),
            handle.properties(),
            Arc::clone(&self.pending),
            Arc::clone(&self.counters),
        )?;
        lifecycle.writer = Some(writer);
        Ok(())
    }

    /// Join the writer, then stop and close the stream
    fn close_playback_stream(&self, lifecycle: &mut Lifecycle) -> AudioResult<()> {
        if let Some(writer) = lifecycle.writer.take() {
            log::debug!("[StreamEngine] Stopping writer for stream {}", writer.stream_id());
            writer.stop();
        }
        let Some(handle) = lifecycle.stream.take() else {
            return Ok(());
        };
        let stopped = handle.stop_stream();
        let closed = handle.close_stream();
        stopped.and(closed)
    }
}

impl RestartTarget for EngineShared {
    fn restart_streams(&self, stream_id: u64) -> RestartOutcome {
        let mut lifecycle = self.lock_lifecycle();
        match lifecycle.stream.as_ref().map(StreamHandle::id) {
            Some(current) if current == stream_id => {}
            _ => return RestartOutcome::Skipped,
        }

        let had_writer = lifecycle.writer.is_some();
        if let Err(e) = self.close_playback_stream(&mut lifecycle) {
            log::debug!("[StreamEngine] Closing lost stream {} reported: {}", stream_id, e);
        }

        let properties = match self.open_playback_stream(&mut lifecycle) {
            Ok(properties) => properties,
            Err(e) => return RestartOutcome::Failed(e),
        };
        if had_writer {
            if let Err(e) = self.launch_writer(&mut lifecycle) {
                if let Err(close_err) = self.close_playback_stream(&mut lifecycle) {
                    log::warn!(
                        "[StreamEngine] Close of stream {} after failed writer launch also failed: {}",
                        properties.stream_id,
                        close_err
                    );
                }
                return RestartOutcome::Failed(e);
            }
        }

        RestartOutcome::Completed {
            old_stream: stream_id,
            new_stream: properties.stream_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sim::SimulatedPlatform;
    use crate::audio::STATE_TRANSITION_TIMEOUT;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn engine(platform: &SimulatedPlatform) -> StreamEngine {
        StreamEngine::new(Arc::new(platform.clone())).unwrap()
    }

    #[test]
    fn test_start_opens_one_low_latency_stream() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(96);
        let engine = engine(&platform);

        let props = engine.start().unwrap();
        assert_eq!(props.frames_per_burst, 96);
        assert_eq!(props.buffer_size_frames, 96);
        assert_eq!(props.channel_count, 2);
        assert_eq!(engine.stream_state(), Some(StreamState::Started));
        assert_eq!(platform.open_stream_count(), 1);
        assert_eq!(engine.counters().streams_opened(), 1);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        assert_eq!(engine.start(), Err(AudioError::AlreadyRunning));
        assert_eq!(engine.stream_properties().map(|p| p.stream_id), Some(first.stream_id));
        assert_eq!(platform.open_stream_count(), 1);
    }

    #[test]
    fn test_stop_releases_stream() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        engine.start().unwrap();
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert_eq!(platform.open_stream_count(), 0);

        // Stop while idle is a no-op
        engine.stop().unwrap();
    }

    #[test]
    fn test_start_after_stop_opens_new_stream() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        engine.stop().unwrap();
        let second = engine.start().unwrap();
        assert_ne!(first.stream_id, second.stream_id);
        assert_eq!(platform.open_stream_count(), 1);
    }

    #[test]
    fn test_start_failures_leave_engine_idle() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        platform.set_fail_builder(true);
        assert!(matches!(engine.start(), Err(AudioError::BuilderUnavailable(_))));
        platform.set_fail_builder(false);

        platform.set_fail_open(true);
        assert!(matches!(engine.start(), Err(AudioError::StreamOpen(_))));
        platform.set_fail_open(false);

        assert!(!engine.is_running());
        engine.start().unwrap();
        assert!(engine.is_running());
    }

    #[test]
    fn test_stalled_start_times_out_and_closes() {
        let platform = SimulatedPlatform::new();
        platform.set_stall_start(true);
        let engine = engine(&platform);

        let started = Instant::now();
        let result = engine.start();
        assert!(matches!(result, Err(AudioError::StateTimeout { operation: "start", .. })));
        assert!(started.elapsed() < STATE_TRANSITION_TIMEOUT * 10);
        assert!(!engine.is_running());
        assert_eq!(platform.open_stream_count(), 0);
    }

    #[test]
    fn test_stalled_stop_still_closes() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        engine.start().unwrap();
        platform.set_stall_stop(true);
        assert!(matches!(engine.stop(), Err(AudioError::StateTimeout { operation: "stop", .. })));
        assert!(!engine.is_running());
        assert_eq!(platform.open_stream_count(), 0);
    }

    #[test]
    fn test_buffer_written_to_stream() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        engine.start().unwrap();
        engine.write_buffer(vec![3i16; 400]);
        assert!(wait_until(Duration::from_secs(2), || engine.counters().frames_written() == 200));

        let written = platform.latest_stream().unwrap().written_samples();
        assert_eq!(written, vec![3i16; 400]);
    }

    #[test]
    fn test_buffer_before_start_played_on_start() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        engine.write_buffer(vec![1i16; 8]);
        engine.write_buffer(vec![2i16; 8]);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.counters().frames_written() == 4));

        assert_eq!(platform.latest_stream().unwrap().written_samples(), vec![2i16; 8]);
    }

    #[test]
    fn test_buffer_replayed_after_stop_and_start() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        engine.write_buffer(vec![7i16; 64]);
        let first = engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.counters().frames_written() == 32));
        engine.stop().unwrap();

        let second = engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.counters().frames_written() == 64));
        thread::sleep(Duration::from_millis(20));
        engine.stop().unwrap();

        assert_eq!(platform.stream(first.stream_id).unwrap().written_samples(), vec![7i16; 64]);
        assert_eq!(platform.stream(second.stream_id).unwrap().written_samples(), vec![7i16; 64]);
    }

    #[test]
    fn test_restart_replays_latest_buffer() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        engine.write_buffer(vec![4i16; 32]);
        assert!(wait_until(Duration::from_secs(2), || engine.counters().frames_written() == 16));

        platform.disconnect(first.stream_id).unwrap().join().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.counters().restarts_completed() == 1));
        let second = engine.stream_properties().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            platform.stream(second.stream_id).unwrap().written_samples() == vec![4i16; 32]
        }));
    }

    #[test]
    fn test_disconnect_restarts_stream() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(96);
        platform.push_burst_size(240);
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        assert_eq!(first.frames_per_burst, 96);
        platform.disconnect(first.stream_id).unwrap().join().unwrap();

        assert!(wait_until(Duration::from_secs(2), || engine.counters().restarts_completed() == 1));
        let second = engine.stream_properties().unwrap();
        assert_ne!(second.stream_id, first.stream_id);
        assert_eq!(second.frames_per_burst, 240);
        assert_eq!(second.buffer_size_frames, 240);
        assert_eq!(engine.stream_state(), Some(StreamState::Started));
        assert_eq!(platform.open_stream_count(), 1);

        // Writer follows the new stream
        engine.write_buffer(vec![5i16; 16]);
        assert!(wait_until(Duration::from_secs(2), || {
            platform.stream(second.stream_id).unwrap().written_samples().len() == 16
        }));
    }

    #[test]
    fn test_double_disconnect_restarts_once() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        let stream = platform.stream(first.stream_id).unwrap();
        let a = stream.disconnect();
        let b = stream.raise_error("device disconnected");
        a.join().unwrap();
        b.join().unwrap();

        assert!(wait_until(Duration::from_secs(2), || !engine.is_restarting()
            && engine.counters().restarts_completed() == 1));
        let counters = engine.counters().snapshot();
        // Second notification either lost the guard race or found the stream replaced
        assert_eq!(counters.restarts_dropped + counters.restarts_skipped, 1);
        assert_eq!(counters.streams_opened, 2);
        assert_eq!(platform.open_stream_count(), 1);
    }

    #[test]
    fn test_disconnect_after_stop_does_not_resurrect() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        let stream = platform.stream(first.stream_id).unwrap();
        engine.stop().unwrap();

        stream.raise_error("late disconnect").join().unwrap();
        // Closed streams report their state, which is not Disconnected
        assert!(!engine.is_restarting());

        engine.restart_streams();
        assert!(!engine.is_running());
        assert_eq!(platform.open_stream_count(), 0);
    }

    #[test]
    fn test_manual_restart() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        assert!(!engine.restart_streams());
        let first = engine.start().unwrap();
        assert!(engine.restart_streams());
        assert!(wait_until(Duration::from_secs(2), || engine.counters().restarts_completed() == 1));
        assert_ne!(engine.stream_properties().unwrap().stream_id, first.stream_id);
    }

    #[test]
    fn test_failed_restart_leaves_engine_stopped() {
        let platform = SimulatedPlatform::new();
        let engine = engine(&platform);

        let first = engine.start().unwrap();
        platform.set_fail_open(true);
        platform.disconnect(first.stream_id).unwrap().join().unwrap();

        assert!(wait_until(Duration::from_secs(2), || engine.counters().restarts_failed() == 1));
        assert!(!engine.is_running());
        assert_eq!(platform.open_stream_count(), 0);

        platform.set_fail_open(false);
        engine.start().unwrap();
    }

    #[test]
    fn test_drop_closes_stream() {
        let platform = SimulatedPlatform::new();
        {
            let engine = engine(&platform);
            engine.start().unwrap();
            engine.write_buffer(vec![0i16; 64]);
        }
        assert_eq!(platform.open_stream_count(), 0);
    }
}
