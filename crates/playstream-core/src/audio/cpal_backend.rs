//! CPAL platform implementation
//!
//! CPAL is pull-based: the device thread asks for samples. The engine is
//! push-based: the writer thread blocks in `write`. The two meet in a
//! lock-free ring buffer.
//!
//! ```text
//! ┌──────────────────┐  write()   ┌─────────────────────┐  pop()  ┌─────────────────────┐
//! │  Writer Thread   │───────────►│  Sample Ring (SPSC) │────────►│  CPAL Audio Thread  │
//! │  (blocks ≤ 4     │            │  fill limited to    │         │  silence on underrun│
//! │   bursts)        │            │  buffer_size frames │         │                     │
//! └──────────────────┘            └─────────────────────┘         └─────────────────────┘
//! ```
//!
//! `cpal::Stream` is not `Send` on every host, so each stream lives on its
//! own owner thread which executes play/pause/close commands. Start and stop
//! requests return immediately; the owner thread resolves the transient
//! state, which is what `wait_for_state_change` observes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamError, SupportedBufferSize};
use crossbeam::channel::{self, Receiver, Sender};

use super::config::{DeviceId, PerformanceMode, SampleFormat};
use super::error::{AudioError, AudioResult};
use super::platform::{
    AudioPlatform, ErrorCallback, PlatformStream, StreamBuilder, StreamErrorEvent, StreamState,
};

/// Burst requested when the device reports a buffer size range
const LOW_LATENCY_BURST: u32 = 256;

/// Ring capacity in bursts
const RING_BURSTS: u32 = 8;

/// Poll interval while a write waits for ring space
const WRITE_POLL: Duration = Duration::from_millis(1);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Human-readable output device names on the default host
pub fn list_output_devices() -> AudioResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::Backend(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Platform backed by the default CPAL host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalPlatform;

impl CpalPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl AudioPlatform for CpalPlatform {
    fn create_stream_builder(&self) -> AudioResult<Box<dyn StreamBuilder>> {
        if cpal::available_hosts().is_empty() {
            return Err(AudioError::BuilderUnavailable("no audio host available".to_string()));
        }
        Ok(Box::new(CpalBuilder {
            request: OpenRequest {
                device: DeviceId::Unspecified,
                format: SampleFormat::I16,
                channel_count: 2,
                sample_rate: 48000,
            },
            error_callback: None,
        }))
    }

    fn name(&self) -> &'static str {
        "CPAL"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct OpenRequest {
    device: DeviceId,
    format: SampleFormat,
    channel_count: u16,
    sample_rate: u32,
}

struct CpalBuilder {
    request: OpenRequest,
    error_callback: Option<ErrorCallback>,
}

impl StreamBuilder for CpalBuilder {
    fn set_device_id(&mut self, device: &DeviceId) {
        self.request.device = device.clone();
    }

    fn set_format(&mut self, format: SampleFormat) {
        self.request.format = format;
    }

    fn set_channel_count(&mut self, channels: u16) {
        self.request.channel_count = channels;
    }

    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.request.sample_rate = sample_rate;
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    fn open_stream(self: Box<Self>) -> AudioResult<Arc<dyn PlatformStream>> {
        let CpalBuilder {
            request,
            error_callback,
        } = *self;
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SharedState::new(id, error_callback));

        let (ready_tx, ready_rx) = channel::bounded(1);
        let (command_tx, command_rx) = channel::unbounded();
        let owner_shared = Arc::clone(&shared);
        let owner_request = request.clone();

        let owner = thread::Builder::new()
            .name(format!("cpal-stream-{}", id))
            .spawn(move || run_owner(owner_request, owner_shared, command_rx, ready_tx))
            .map_err(|e| AudioError::StreamOpen(format!("Failed to spawn stream thread: {}", e)))?;

        let opened = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = owner.join();
                return Err(e);
            }
            Err(_) => {
                let _ = owner.join();
                return Err(AudioError::StreamOpen("stream thread exited during open".to_string()));
            }
        };

        shared.set_state(StreamState::Open);
        Ok(Arc::new(CpalStream {
            id,
            shared,
            format: opened.format,
            device_name: opened.device_name,
            channel_count: opened.channel_count,
            sample_rate: opened.sample_rate,
            frames_per_burst: opened.frames_per_burst,
            performance_mode: opened.performance_mode,
            capacity_frames: opened.capacity_frames,
            buffer_size: AtomicU32::new(opened.capacity_frames),
            producer: Mutex::new(opened.producer),
            commands: command_tx,
            owner: Mutex::new(Some(owner)),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stream owner thread
// ═══════════════════════════════════════════════════════════════════════════

enum OwnerCommand {
    Play,
    Pause,
    Close,
}

struct OpenedStream {
    device_name: String,
    /// Format the device runs at, samples are converted in the callback
    format: SampleFormat,
    channel_count: u16,
    sample_rate: u32,
    frames_per_burst: u32,
    performance_mode: PerformanceMode,
    capacity_frames: u32,
    producer: rtrb::Producer<i16>,
}

/// State shared by the stream handle, the owner thread and CPAL callbacks
struct SharedState {
    id: u64,
    state: Mutex<StreamState>,
    changed: Condvar,
    on_error: Option<ErrorCallback>,
}

impl SharedState {
    fn new(id: u64, on_error: Option<ErrorCallback>) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState::Uninitialized),
            changed: Condvar::new(),
            on_error,
        }
    }

    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
        self.changed.notify_all();
    }

    /// Called from the CPAL error callback
    fn report(&self, err: StreamError) {
        if matches!(err, StreamError::DeviceNotAvailable) {
            self.set_state(StreamState::Disconnected);
        }
        let event = StreamErrorEvent {
            stream_id: self.id,
            state: self.state(),
            message: err.to_string(),
        };
        log::warn!("[CPAL] Stream {} error: {}", self.id, event.message);
        if let Some(callback) = &self.on_error {
            callback(event);
        }
    }
}

fn run_owner(
    request: OpenRequest,
    shared: Arc<SharedState>,
    commands: Receiver<OwnerCommand>,
    ready: Sender<AudioResult<OpenedStream>>,
) {
    let (stream, opened) = match build_stream(&request, &shared) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(opened)).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            OwnerCommand::Play => {
                let next = match stream.play() {
                    Ok(()) => StreamState::Started,
                    Err(e) => {
                        log::error!("[CPAL] Stream {} failed to play: {}", shared.id, e);
                        StreamState::Stopped
                    }
                };
                if shared.state() == StreamState::Starting {
                    shared.set_state(next);
                }
            }
            OwnerCommand::Pause => {
                if let Err(e) = stream.pause() {
                    log::warn!("[CPAL] Stream {} failed to pause: {}", shared.id, e);
                }
                if shared.state() == StreamState::Stopping {
                    shared.set_state(StreamState::Stopped);
                }
            }
            OwnerCommand::Close => break,
        }
    }

    drop(stream);
    log::debug!("[CPAL] Stream {} released", shared.id);
}

fn find_device(host: &cpal::Host, device: &DeviceId) -> AudioResult<cpal::Device> {
    match device {
        DeviceId::Unspecified => host
            .default_output_device()
            .ok_or_else(|| AudioError::StreamOpen("no default output device".to_string())),
        DeviceId::Named(name) => host
            .output_devices()
            .map_err(|e| AudioError::StreamOpen(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::StreamOpen(format!("output device '{}' not found", name))),
    }
}

/// Pick a device configuration close to the request
///
/// Prefers the requested channel count and rate in 16-bit, then in float,
/// then falls back to the device default.
fn choose_config(
    device: &cpal::Device,
    request: &OpenRequest,
) -> AudioResult<cpal::SupportedStreamConfig> {
    let ranges: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::StreamOpen(e.to_string()))?
        .collect();

    let matches_request = |c: &&cpal::SupportedStreamConfigRange| {
        c.channels() == request.channel_count
            && request.sample_rate >= c.min_sample_rate().0
            && request.sample_rate <= c.max_sample_rate().0
    };

    let best = ranges
        .iter()
        .filter(matches_request)
        .find(|c| c.sample_format() == cpal::SampleFormat::I16)
        .or_else(|| {
            ranges
                .iter()
                .filter(matches_request)
                .find(|c| c.sample_format() == cpal::SampleFormat::F32)
        });

    match best {
        Some(range) => Ok(range
            .clone()
            .with_sample_rate(cpal::SampleRate(request.sample_rate))),
        None => {
            let fallback = device
                .default_output_config()
                .map_err(|e| AudioError::StreamOpen(e.to_string()))?;
            check_fallback_channels(request.channel_count, fallback.channels())?;
            log::warn!(
                "[CPAL] Device has no {}ch {}Hz config, using default {}ch {}Hz {:?}",
                request.channel_count,
                request.sample_rate,
                fallback.channels(),
                fallback.sample_rate().0,
                fallback.sample_format()
            );
            Ok(fallback)
        }
    }
}

/// The writer interleaves for the requested layout, so only the rate may differ
fn check_fallback_channels(requested: u16, device: u16) -> AudioResult<()> {
    if device != requested {
        return Err(AudioError::StreamOpen(format!(
            "device has no {}ch output config (default is {}ch)",
            requested, device
        )));
    }
    Ok(())
}

fn device_format(format: cpal::SampleFormat) -> AudioResult<SampleFormat> {
    match format {
        cpal::SampleFormat::I16 => Ok(SampleFormat::I16),
        cpal::SampleFormat::F32 => Ok(SampleFormat::F32),
        other => Err(AudioError::StreamOpen(format!("unsupported device sample format {:?}", other))),
    }
}

fn build_stream(
    request: &OpenRequest,
    shared: &Arc<SharedState>,
) -> AudioResult<(cpal::Stream, OpenedStream)> {
    let host = cpal::default_host();
    let device = find_device(&host, &request.device)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let supported = choose_config(&device, request)?;

    let (frames_per_burst, buffer_size, performance_mode) = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } => (
            LOW_LATENCY_BURST.clamp(*min, *max),
            cpal::BufferSize::Fixed(LOW_LATENCY_BURST.clamp(*min, *max)),
            PerformanceMode::LowLatency,
        ),
        SupportedBufferSize::Unknown => (LOW_LATENCY_BURST, cpal::BufferSize::Default, PerformanceMode::None),
    };

    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size,
    };

    let channels = config.channels as usize;
    let capacity_frames = frames_per_burst * RING_BURSTS;
    let (producer, consumer) = rtrb::RingBuffer::<i16>::new(capacity_frames as usize * channels);

    let format = device_format(supported.sample_format())?;
    let stream = match format {
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, shared),
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, shared),
    }?;

    log::info!(
        "[CPAL] Opened '{}' ({}ch {}Hz {}, burst {} frames)",
        device_name,
        config.channels,
        config.sample_rate.0,
        format,
        frames_per_burst
    );

    Ok((
        stream,
        OpenedStream {
            device_name,
            format,
            channel_count: config.channels,
            sample_rate: config.sample_rate.0,
            frames_per_burst,
            performance_mode,
            capacity_frames,
            producer,
        },
    ))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: rtrb::Consumer<i16>,
    shared: &Arc<SharedState>,
) -> AudioResult<cpal::Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let error_state = Arc::clone(shared);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    *out = match consumer.pop() {
                        Ok(sample) => T::from_sample(sample),
                        // Underrun: play silence
                        Err(_) => T::EQUILIBRIUM,
                    };
                }
            },
            move |err| error_state.report(err),
            None,
        )
        .map_err(|e| AudioError::StreamOpen(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Stream
// ═══════════════════════════════════════════════════════════════════════════

struct CpalStream {
    id: u64,
    shared: Arc<SharedState>,
    format: SampleFormat,
    device_name: String,
    channel_count: u16,
    sample_rate: u32,
    frames_per_burst: u32,
    performance_mode: PerformanceMode,
    capacity_frames: u32,
    /// Ring fill limit in frames
    buffer_size: AtomicU32,
    producer: Mutex<rtrb::Producer<i16>>,
    commands: Sender<OwnerCommand>,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl CpalStream {
    fn send(&self, command: OwnerCommand) -> AudioResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AudioError::StreamClosed(self.id))
    }

    /// Free space in samples, honouring the buffer size limit
    fn writable_samples(&self, producer: &rtrb::Producer<i16>) -> usize {
        let channels = self.channel_count.max(1) as usize;
        let limit = self.buffer_size.load(Ordering::Relaxed) as usize * channels;
        let queued = producer.buffer().capacity() - producer.slots();
        limit.saturating_sub(queued)
    }
}

impl PlatformStream for CpalStream {
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
        self.buffer_size.load(Ordering::Relaxed)
    }

    fn buffer_capacity_in_frames(&self) -> u32 {
        self.capacity_frames
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> AudioResult<u32> {
        if self.shared.state() == StreamState::Closed {
            return Err(AudioError::StreamClosed(self.id));
        }
        let applied = frames.clamp(1, self.capacity_frames);
        self.buffer_size.store(applied, Ordering::Relaxed);
        Ok(applied)
    }

    fn state(&self) -> StreamState {
        self.shared.state()
    }

    fn request_start(&self) -> AudioResult<()> {
        match self.shared.state() {
            StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
            StreamState::Disconnected => {
                return Err(AudioError::Platform("stream disconnected".to_string()))
            }
            _ => {}
        }
        self.shared.set_state(StreamState::Starting);
        self.send(OwnerCommand::Play)
    }

    fn request_stop(&self) -> AudioResult<()> {
        match self.shared.state() {
            StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
            StreamState::Disconnected => {
                return Err(AudioError::Platform("stream disconnected".to_string()))
            }
            _ => {}
        }
        self.shared.set_state(StreamState::Stopping);
        self.send(OwnerCommand::Pause)
    }

    fn wait_for_state_change(&self, current: StreamState, timeout: Duration) -> AudioResult<StreamState> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while *state == current {
            let now = Instant::now();
            if now >= deadline {
                return Err(AudioError::StateTimeout {
                    operation: "state change",
                    state: current,
                });
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Ok(*state)
    }

    fn write(&self, samples: &[i16], timeout: Duration) -> AudioResult<usize> {
        let channels = self.channel_count.max(1) as usize;
        let deadline = Instant::now() + timeout;
        let mut producer = lock(&self.producer);
        let mut offset = 0;
        let total = samples.len() - samples.len() % channels;

        while offset < total {
            match self.shared.state() {
                StreamState::Started => {}
                StreamState::Closed => return Err(AudioError::StreamClosed(self.id)),
                other => {
                    if offset > 0 {
                        break;
                    }
                    return Err(AudioError::Platform(format!("write while {}", other)));
                }
            }

            let writable = self.writable_samples(&producer).min(total - offset);
            let writable = writable - writable % channels;
            if writable > 0 {
                if let Ok(chunk) = producer.write_chunk_uninit(writable) {
                    offset += chunk.fill_from_iter(samples[offset..offset + writable].iter().copied());
                }
                continue;
            }

            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(WRITE_POLL);
        }

        Ok(offset / channels)
    }

    fn close(&self) -> AudioResult<()> {
        if self.shared.state() == StreamState::Closed {
            return Err(AudioError::StreamClosed(self.id));
        }
        self.shared.set_state(StreamState::Closing);
        let _ = self.send(OwnerCommand::Close);
        if let Some(owner) = lock(&self.owner).take() {
            if owner.join().is_err() {
                log::error!("[CPAL] Stream {} owner thread panicked", self.id);
            }
        }
        self.shared.set_state(StreamState::Closed);
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if self.shared.state() != StreamState::Closed {
            let _ = self.close();
        }
    }
}
