//! Buffer writer thread
//!
//! Pushes the most recently supplied audio buffer to the stream from a
//! dedicated thread, decoupled from the caller. There is no queue: a newer
//! `write_buffer` replaces the previous one (last write wins).
//!
//! The buffer stays in the slot after it is read. Each writer plays it once
//! when launched, and again every time it is replaced, so a buffer supplied
//! once is heard on every start and after every restart.
//!
//! Each buffer is written in burst-sized chunks, exactly as many frames as
//! it holds, with the stop signal checked between chunks. The lifecycle
//! controller always stops and joins the writer before it closes the
//! stream, so the writer never touches a closed stream.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::audio::{AudioError, AudioResult, PlatformStream, StreamProperties};

use super::counters::LifecycleCounters;

/// Lower bound on the idle poll so a zero burst never spins
const MIN_IDLE: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct Slot {
    samples: Option<Arc<[i16]>>,
    /// Bumped on every replace, 0 while empty
    generation: u64,
}

/// Slot holding the latest caller-supplied buffer
///
/// Shared by the caller (replace) and the writer thread (read) behind a lock
/// covering both operations.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    slot: Mutex<Slot>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending buffer, returning its generation
    pub fn replace(&self, samples: Arc<[i16]>) -> u64 {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.samples = Some(samples);
        slot.generation += 1;
        slot.generation
    }

    /// Latest buffer and its generation
    pub fn latest(&self) -> Option<(u64, Arc<[i16]>)> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.samples
            .as_ref()
            .map(|samples| (slot.generation, Arc::clone(samples)))
    }

    /// Latest buffer, if it was supplied after generation `seen`
    pub fn newer_than(&self, seen: u64) -> Option<(u64, Arc<[i16]>)> {
        self.latest().filter(|(generation, _)| *generation > seen)
    }
}

/// Handle to a running writer thread
///
/// Dropping the handle signals the thread to stop and waits for it.
pub struct BufferWriter {
    /// Dropped to signal shutdown
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stream_id: u64,
}

impl BufferWriter {
    /// Launch a writer for `stream`
    pub fn spawn(
        stream: Arc<dyn PlatformStream>,
        properties: StreamProperties,
        pending: Arc<PendingBuffer>,
        counters: Arc<LifecycleCounters>,
    ) -> AudioResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let stream_id = properties.stream_id;

        let handle = thread::Builder::new()
            .name(format!("stream-writer-{}", stream_id))
            .spawn(move || {
                let mut worker = WriterLoop {
                    stream,
                    properties,
                    pending,
                    counters,
                    stop_rx,
                };
                worker.run();
            })
            .map_err(|e| AudioError::Backend(format!("Failed to spawn writer thread: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            stream_id,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Signal the thread to exit and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            log::debug!("[Writer {}] Waiting for writer thread to stop...", self.stream_id);
            if handle.join().is_err() {
                log::error!("[Writer {}] Writer thread panicked", self.stream_id);
            }
        }
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WriterLoop {
    stream: Arc<dyn PlatformStream>,
    properties: StreamProperties,
    pending: Arc<PendingBuffer>,
    counters: Arc<LifecycleCounters>,
    stop_rx: Receiver<()>,
}

impl WriterLoop {
    fn run(&mut self) {
        let id = self.properties.stream_id;
        log::info!("[Writer {}] Writer thread started", id);

        let idle = self.properties.burst_duration().max(MIN_IDLE);
        let mut played = 0;

        loop {
            let samples = match self.pending.newer_than(played) {
                Some((generation, samples)) => {
                    played = generation;
                    samples
                }
                None => {
                    if self.wait_for_stop(idle) {
                        break;
                    }
                    continue;
                }
            };

            if self.write_all(&samples, idle) {
                break;
            }
        }

        log::info!("[Writer {}] Writer thread stopped", id);
    }

    /// Write every whole frame in `samples`
    ///
    /// Returns `true` if a stop was requested mid-buffer.
    fn write_all(&self, samples: &[i16], idle: Duration) -> bool {
        let id = self.properties.stream_id;
        let channels = self.properties.channel_count.max(1) as usize;
        let chunk = self.properties.frames_per_burst.max(1) as usize * channels;
        let timeout = self.properties.write_timeout();

        let usable = samples.len() - samples.len() % channels;
        if usable != samples.len() {
            log::warn!(
                "[Writer {}] Dropping {} trailing samples (not a whole frame)",
                id,
                samples.len() - usable
            );
        }

        let mut offset = 0;
        while offset < usable {
            if self.stop_requested() {
                return true;
            }

            let end = (offset + chunk).min(usable);
            match self.stream.write(&samples[offset..end], timeout) {
                Ok(0) => {
                    log::trace!("[Writer {}] Stream full, backing off", id);
                    if self.wait_for_stop(idle) {
                        return true;
                    }
                }
                Ok(frames) => {
                    offset += frames * channels;
                    self.counters.record_frames_written(frames);
                }
                Err(e) => {
                    log::warn!(
                        "[Writer {}] Write failed, discarding {} remaining frames: {}",
                        id,
                        (usable - offset) / channels,
                        e
                    );
                    return self.wait_for_stop(idle);
                }
            }
        }

        false
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Idle for up to `timeout`; returns `true` if a stop arrived
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        !matches!(self.stop_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sim::SimulatedPlatform;
    use crate::audio::{StreamFactory, StreamParameters};
    use std::time::Instant;

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

    fn started_stream(platform: &SimulatedPlatform) -> (Arc<dyn PlatformStream>, StreamProperties) {
        let factory = StreamFactory::new(Arc::new(platform.clone()), StreamParameters::playback());
        let handle = factory.create_playback_stream(Arc::new(|_| {})).unwrap();
        handle.start_stream().unwrap();
        (handle.platform_stream(), handle.properties())
    }

    fn spawn_writer(
        platform: &SimulatedPlatform,
        pending: &Arc<PendingBuffer>,
        counters: &Arc<LifecycleCounters>,
    ) -> (BufferWriter, StreamProperties) {
        let (stream, props) = started_stream(platform);
        let writer = BufferWriter::spawn(stream, props, Arc::clone(pending), Arc::clone(counters)).unwrap();
        (writer, props)
    }

    #[test]
    fn test_last_write_wins() {
        let pending = PendingBuffer::new();
        assert!(pending.latest().is_none());
        assert_eq!(pending.replace(Arc::from(vec![1i16, 1])), 1);
        assert_eq!(pending.replace(Arc::from(vec![2i16, 2])), 2);

        let (generation, samples) = pending.latest().unwrap();
        assert_eq!(generation, 2);
        assert_eq!(&samples[..], &[2i16, 2][..]);
    }

    #[test]
    fn test_reading_keeps_buffer() {
        let pending = PendingBuffer::new();
        pending.replace(Arc::from(vec![5i16; 4]));

        assert!(pending.newer_than(0).is_some());
        assert!(pending.newer_than(0).is_some());
        assert!(pending.newer_than(1).is_none());
        pending.replace(Arc::from(vec![6i16; 4]));
        assert_eq!(pending.newer_than(1).map(|(g, _)| g), Some(2));
    }

    #[test]
    fn test_writes_exact_frame_count() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(4);
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());

        // 10 frames plus one stray sample
        let samples: Vec<i16> = (0..21).collect();
        pending.replace(Arc::from(samples.clone()));

        let (writer, _) = spawn_writer(&platform, &pending, &counters);
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 10));
        // Played once per launch, not looped
        thread::sleep(Duration::from_millis(20));
        writer.stop();

        let written = platform.latest_stream().unwrap().written_samples();
        assert_eq!(written, samples[..20].to_vec());
    }

    #[test]
    fn test_picks_up_later_buffers() {
        let platform = SimulatedPlatform::new();
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());

        let (writer, _) = spawn_writer(&platform, &pending, &counters);
        pending.replace(Arc::from(vec![7i16; 8]));
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 4));
        pending.replace(Arc::from(vec![9i16; 4]));
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 6));
        writer.stop();

        let written = platform.latest_stream().unwrap().written_samples();
        assert_eq!(written, [vec![7i16; 8], vec![9i16; 4]].concat());
    }

    #[test]
    fn test_new_writer_replays_latest_buffer() {
        let platform = SimulatedPlatform::new();
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());
        pending.replace(Arc::from(vec![3i16; 12]));

        let (first, _) = spawn_writer(&platform, &pending, &counters);
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 6));
        first.stop();

        let (second, props) = spawn_writer(&platform, &pending, &counters);
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 12));
        second.stop();

        let replayed = platform.stream(props.stream_id).unwrap().written_samples();
        assert_eq!(replayed, vec![3i16; 12]);
    }

    #[test]
    fn test_full_stream_backs_off_and_resumes() {
        let platform = SimulatedPlatform::new();
        platform.push_burst_size(4);
        platform.set_accept_limit(Some(4));
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());
        let samples: Vec<i16> = (0..32).collect();
        pending.replace(Arc::from(samples.clone()));

        let (writer, props) = spawn_writer(&platform, &pending, &counters);
        let stream = platform.stream(props.stream_id).unwrap();
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 4));

        // Keeps retrying the same buffer without skipping ahead
        assert!(wait_until(Duration::from_secs(2), || stream.write_attempts() >= 4));
        assert_eq!(counters.frames_written(), 4);

        platform.set_accept_limit(None);
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 16));
        writer.stop();

        assert_eq!(stream.written_samples(), samples);
    }

    #[test]
    fn test_stop_mid_buffer_returns_quickly() {
        let platform = SimulatedPlatform::new();
        platform.set_accept_limit(Some(1000));
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());
        // Ten seconds of stereo audio
        pending.replace(Arc::from(vec![1i16; 48000 * 2 * 10]));

        let (writer, props) = spawn_writer(&platform, &pending, &counters);
        assert!(wait_until(Duration::from_secs(2), || counters.frames_written() == 1000));

        let started = Instant::now();
        writer.stop();
        let elapsed = started.elapsed();

        assert!(
            elapsed < props.write_timeout() + Duration::from_millis(250),
            "stop took {:?}",
            elapsed
        );
        assert_eq!(counters.frames_written(), 1000);
    }

    #[test]
    fn test_stop_joins_idle_writer() {
        let platform = SimulatedPlatform::new();
        let (writer, _) = spawn_writer(
            &platform,
            &Arc::new(PendingBuffer::new()),
            &Arc::new(LifecycleCounters::default()),
        );

        let started = Instant::now();
        writer.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_write_error_discards_buffer() {
        let platform = SimulatedPlatform::new();
        let factory = StreamFactory::new(Arc::new(platform.clone()), StreamParameters::playback());
        // Never started: every write is rejected
        let handle = factory.create_playback_stream(Arc::new(|_| {})).unwrap();
        let pending = Arc::new(PendingBuffer::new());
        let counters = Arc::new(LifecycleCounters::default());
        pending.replace(Arc::from(vec![1i16; 16]));

        let writer = BufferWriter::spawn(
            handle.platform_stream(),
            handle.properties(),
            Arc::clone(&pending),
            Arc::clone(&counters),
        )
        .unwrap();
        let stream = platform.latest_stream().unwrap();
        assert!(wait_until(Duration::from_secs(2), || stream.write_attempts() == 1));
        thread::sleep(Duration::from_millis(20));
        writer.stop();

        // Not retried until a new buffer arrives
        assert_eq!(stream.write_attempts(), 1);
        assert_eq!(counters.frames_written(), 0);
        assert!(stream.written_samples().is_empty());
    }
}
