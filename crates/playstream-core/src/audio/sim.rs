//! In-process simulated audio platform
//!
//! Behaves like a push-style platform stream without touching hardware:
//! state transitions complete immediately unless told to stall, writes are
//! recorded, and disconnects are raised on a separate "audio" thread just
//! like a real platform raises them from its callback thread.
//!
//! Used by the test-suite and by `playstream-player --simulate`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::config::{DeviceId, PerformanceMode, SampleFormat};
use super::error::{AudioError, AudioResult};
use super::platform::{
    AudioPlatform, ErrorCallback, PlatformStream, StreamBuilder, StreamErrorEvent, StreamState,
};

/// Burst size handed out when none was scripted (4ms at 48kHz)
pub const DEFAULT_SIM_BURST: u32 = 192;

/// Buffer capacity as a multiple of the burst
const CAPACITY_BURSTS: u32 = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour switches shared with every opened stream
struct StreamScript {
    stall_start: AtomicBool,
    stall_stop: AtomicBool,
    disconnect_on_start: AtomicBool,
    /// Total frames a stream accepts before it stays full
    accept_limit: AtomicUsize,
}

impl Default for StreamScript {
    fn default() -> Self {
        Self {
            stall_start: AtomicBool::new(false),
            stall_stop: AtomicBool::new(false),
            disconnect_on_start: AtomicBool::new(false),
            accept_limit: AtomicUsize::new(usize::MAX),
        }
    }
}

struct SimInner {
    next_id: AtomicU64,
    builders_created: AtomicUsize,
    fail_builder: AtomicBool,
    fail_open: AtomicBool,
    flags: Arc<StreamScript>,
    burst_sizes: Mutex<VecDeque<u32>>,
    granted_sample_rate: Mutex<Option<u32>>,
    performance_mode: Mutex<PerformanceMode>,
    streams: Mutex<Vec<Arc<SimulatedStream>>>,
}

/// Scriptable platform for tests and headless runs
#[derive(Clone)]
pub struct SimulatedPlatform {
    inner: Arc<SimInner>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                next_id: AtomicU64::new(1),
                builders_created: AtomicUsize::new(0),
                fail_builder: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                flags: Arc::new(StreamScript::default()),
                burst_sizes: Mutex::new(VecDeque::new()),
                granted_sample_rate: Mutex::new(None),
                performance_mode: Mutex::new(PerformanceMode::LowLatency),
                streams: Mutex::new(Vec::new()),
            }),
        }
    }

    // ─── Scripting ───

    /// Make `create_stream_builder` fail
    pub fn set_fail_builder(&self, fail: bool) {
        self.inner.fail_builder.store(fail, Ordering::SeqCst);
    }

    /// Make `open_stream` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Leave streams in `Starting` after a start request
    pub fn set_stall_start(&self, stall: bool) {
        self.inner.flags.stall_start.store(stall, Ordering::SeqCst);
    }

    /// Leave streams in `Stopping` after a stop request
    pub fn set_stall_stop(&self, stall: bool) {
        self.inner.flags.stall_stop.store(stall, Ordering::SeqCst);
    }

    /// Streams go straight to `Disconnected` when started
    pub fn set_disconnect_on_start(&self, disconnect: bool) {
        self.inner.flags.disconnect_on_start.store(disconnect, Ordering::SeqCst);
    }

    /// Cap the frames each stream accepts in total, `None` for unlimited
    ///
    /// Once a stream has taken `frames` frames, writes block for their
    /// timeout and return 0, like a device that stopped draining. Raising
    /// the limit wakes blocked writers.
    pub fn set_accept_limit(&self, frames: Option<usize>) {
        self.inner
            .flags
            .accept_limit
            .store(frames.unwrap_or(usize::MAX), Ordering::SeqCst);
        for stream in lock(&self.inner.streams).iter() {
            stream.changed.notify_all();
        }
    }

    /// Queue a burst size for the next opened stream
    pub fn push_burst_size(&self, frames: u32) {
        lock(&self.inner.burst_sizes).push_back(frames);
    }

    /// Grant a sample rate different from the requested one
    pub fn set_granted_sample_rate(&self, rate: Option<u32>) {
        *lock(&self.inner.granted_sample_rate) = rate;
    }

    pub fn set_performance_mode(&self, mode: PerformanceMode) {
        *lock(&self.inner.performance_mode) = mode;
    }

    // ─── Inspection ───

    /// Number of builders handed out
    pub fn builders_created(&self) -> usize {
        self.inner.builders_created.load(Ordering::SeqCst)
    }

    /// Most recently opened stream
    pub fn latest_stream(&self) -> Option<Arc<SimulatedStream>> {
        lock(&self.inner.streams).last().cloned()
    }

    pub fn stream(&self, id: u64) -> Option<Arc<SimulatedStream>> {
        lock(&self.inner.streams).iter().find(|s| s.id == id).cloned()
    }

    /// Number of streams opened and not yet closed
    pub fn open_stream_count(&self) -> usize {
        lock(&self.inner.streams)
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Simulate unplugging the device behind stream `id`
    ///
    /// Returns the callback thread, or `None` if the stream is unknown or closed.
    pub fn disconnect(&self, id: u64) -> Option<JoinHandle<()>> {
        let stream = self.stream(id)?;
        if stream.is_closed() {
            return None;
        }
        Some(stream.disconnect())
    }
}

impl AudioPlatform for SimulatedPlatform {
    fn create_stream_builder(&self) -> AudioResult<Box<dyn StreamBuilder>> {
        if self.inner.fail_builder.load(Ordering::SeqCst) {
            return Err(AudioError::BuilderUnavailable(
                "simulated builder failure".to_string(),
            ));
        }
        self.inner.builders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedBuilder {
            inner: Arc::clone(&self.inner),
            device: DeviceId::Unspecified,
            format: SampleFormat::I16,
            channel_count: 2,
            sample_rate: 48000,
            error_callback: None,
        }))
    }

    fn name(&self) -> &'static str {
        "Simulated"
    }
}

struct SimulatedBuilder {
    inner: Arc<SimInner>,
    device: DeviceId,
    format: SampleFormat,
    channel_count: u16,
    sample_rate: u32,
    error_callback: Option<ErrorCallback>,
}

impl StreamBuilder for SimulatedBuilder {
    fn set_device_id(&mut self, device: &DeviceId) {
        self.device = device.clone();
    }

    fn set_format(&mut self, format: SampleFormat) {
        self.format = format;
    }

    fn set_channel_count(&mut self, channels: u16) {
        self.channel_count = channels;
    }

    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    fn open_stream(self: Box<Self>) -> AudioResult<Arc<dyn PlatformStream>> {
        let SimulatedBuilder {
            inner,
            device,
            format,
            channel_count,
            sample_rate,
            error_callback,
        } = *self;
        if inner.fail_open.load(Ordering::SeqCst) {
            return Err(AudioError::StreamOpen("simulated open failure".to_string()));
        }

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let frames_per_burst = lock(&inner.burst_sizes)
            .pop_front()
            .unwrap_or(DEFAULT_SIM_BURST);
        let sample_rate = lock(&inner.granted_sample_rate).unwrap_or(sample_rate);
        let performance_mode = *lock(&inner.performance_mode);
        let capacity = frames_per_burst * CAPACITY_BURSTS;

        let stream = Arc::new(SimulatedStream {
            id,
            flags: Arc::clone(&inner.flags),
            device_name: format!("sim:{}", device),
            format,
            channel_count,
            sample_rate,
            frames_per_burst,
            performance_mode,
            capacity,
            buffer_size: AtomicU32::new(capacity),
            state: Mutex::new(StreamState::Open),
            changed: Condvar::new(),
            written: Mutex::new(Vec::new()),
            write_attempts: AtomicUsize::new(0),
            error_callback,
        });

        lock(&inner.streams).push(Arc::clone(&stream));
        log::debug!("[Sim] Opened stream {} ({} frames/burst)", id, frames_per_burst);
        Ok(stream)
    }
}

/// Stream opened by [`SimulatedPlatform`]
pub struct SimulatedStream {
    id: u64,
    flags: Arc<StreamScript>,
    device_name: String,
    format: SampleFormat,
    channel_count: u16,
    sample_rate: u32,
    frames_per_burst: u32,
    performance_mode: PerformanceMode,
    capacity: u32,
    buffer_size: AtomicU32,
    state: Mutex<StreamState>,
    changed: Condvar,
    written: Mutex<Vec<i16>>,
    write_attempts: AtomicUsize,
    error_callback: Option<ErrorCallback>,
}

impl SimulatedStream {
    pub fn is_closed(&self) -> bool {
        *lock(&self.state) == StreamState::Closed
    }

    /// All samples accepted by `write`, in order
    pub fn written_samples(&self) -> Vec<i16> {
        lock(&self.written).clone()
    }

    /// Number of `write` calls, including rejected and zero-frame ones
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
        self.changed.notify_all();
    }

    /// Move to `Disconnected` and raise the error callback from an audio thread
    pub fn disconnect(&self) -> JoinHandle<()> {
        self.set_state(StreamState::Disconnected);
        self.raise_error("device disconnected")
    }

    /// Raise the error callback without changing state
    pub fn raise_error(&self, message: &str) -> JoinHandle<()> {
        let event = StreamErrorEvent {
            stream_id: self.id,
            state: *lock(&self.state),
            message: message.to_string(),
        };
        let callback = self.error_callback.clone();
        thread::spawn(move || {
            if let Some(callback) = callback {
                callback(event);
            }
        })
    }
}

impl PlatformStream for SimulatedStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn channel_count(&self) -> u16 {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frames_per_burst(&self) -> u32 {
        self.frames_per_burst
    }

    fn performance_mode(&self) -> PerformanceMode {
        self.performance_mode
    }

    fn buffer_size_in_frames(&self) -> u32 {
        self.buffer_size.load(Ordering::SeqCst)
    }

    fn buffer_capacity_in_frames(&self) -> u32 {
        self.capacity
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> AudioResult<u32> {
        if self.is_closed() {
            return Err(AudioError::StreamClosed(self.id));
        }
        let applied = frames.clamp(1, self.capacity);
        self.buffer_size.store(applied, Ordering::SeqCst);
        Ok(applied)
    }

    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn request_start(&self) -> AudioResult<()> {
        let next = match self.state() {
            StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
            StreamState::Disconnected => {
                return Err(AudioError::Platform("stream disconnected".to_string()))
            }
            _ if self.flags.disconnect_on_start.load(Ordering::SeqCst) => StreamState::Disconnected,
            _ if self.flags.stall_start.load(Ordering::SeqCst) => StreamState::Starting,
            _ => StreamState::Started,
        };
        self.set_state(next);
        Ok(())
    }

    fn request_stop(&self) -> AudioResult<()> {
        let next = match self.state() {
            StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
            StreamState::Disconnected => {
                return Err(AudioError::Platform("stream disconnected".to_string()))
            }
            _ if self.flags.stall_stop.load(Ordering::SeqCst) => StreamState::Stopping,
            _ => StreamState::Stopped,
        };
        self.set_state(next);
        Ok(())
    }

    fn wait_for_state_change(&self, current: StreamState, timeout: Duration) -> AudioResult<StreamState> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while *state == current {
            let now = Instant::now();
            if now >= deadline {
                return Err(AudioError::StateTimeout {
                    operation: "state change",
                    state: current,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Ok(*state)
    }

    fn write(&self, samples: &[i16], timeout: Duration) -> AudioResult<usize> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let channels = self.channel_count.max(1) as usize;
        let deadline = Instant::now() + timeout;

        let mut state = lock(&self.state);
        loop {
            match *state {
                StreamState::Started => {}
                StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
                other => return Err(AudioError::Platform(format!("write while {}", other))),
            }

            let accepted = lock(&self.written).len() / channels;
            let room = self
                .flags
                .accept_limit
                .load(Ordering::SeqCst)
                .saturating_sub(accepted);
            if room > 0 {
                let frames = (samples.len() / channels).min(room);
                lock(&self.written).extend_from_slice(&samples[..frames * channels]);
                return Ok(frames);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn close(&self) -> AudioResult<()> {
        if self.is_closed() {
            return Err(AudioError::StreamClosed(self.id));
        }
        self.set_state(StreamState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(platform: &SimulatedPlatform) -> Arc<dyn PlatformStream> {
        platform.create_stream_builder().unwrap().open_stream().unwrap()
    }

    #[test]
    fn test_scripted_burst_sizes() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(96);
        let first = open(&platform);
        let second = open(&platform);
        assert_eq!(first.frames_per_burst(), 96);
        assert_eq!(second.frames_per_burst(), DEFAULT_SIM_BURST);
        assert_ne!(first.id(), second.id());
        assert_eq!(platform.open_stream_count(), 2);
    }

    #[test]
    fn test_write_requires_started() {
        let platform = SimulatedPlatform::new();
        let stream = open(&platform);
        assert!(stream.write(&[1, 2], Duration::ZERO).is_err());

        stream.request_start().unwrap();
        assert_eq!(stream.write(&[1, 2, 3, 4, 5], Duration::ZERO), Ok(2));
        assert_eq!(platform.latest_stream().unwrap().written_samples(), vec![1, 2, 3, 4]);

        stream.close().unwrap();
        assert_eq!(stream.write(&[1, 2], Duration::ZERO), Err(AudioError::StreamClosed(stream.id())));
    }

    #[test]
    fn test_full_stream_blocks_for_timeout() {
        let platform = SimulatedPlatform::new();
        platform.set_accept_limit(Some(3));
        let stream = open(&platform);
        stream.request_start().unwrap();

        assert_eq!(stream.write(&[1, 1, 2, 2, 3, 3, 4, 4], Duration::ZERO), Ok(3));

        let started = Instant::now();
        assert_eq!(stream.write(&[4, 4], Duration::from_millis(30)), Ok(0));
        assert!(started.elapsed() >= Duration::from_millis(30));

        platform.set_accept_limit(None);
        assert_eq!(stream.write(&[4, 4], Duration::ZERO), Ok(1));
        assert_eq!(platform.latest_stream().unwrap().write_attempts(), 3);
    }

    #[test]
    fn test_disconnect_raises_callback() {
        let platform = SimulatedPlatform::new();
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut builder = platform.create_stream_builder().unwrap();
        builder.set_error_callback(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        let stream = builder.open_stream().unwrap();

        platform.disconnect(stream.id()).unwrap().join().unwrap();
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.stream_id, stream.id());
        assert_eq!(event.state, StreamState::Disconnected);
        assert_eq!(stream.state(), StreamState::Disconnected);
    }
}
