//! Guarded stream restart
//!
//! Device-disconnect notifications arrive on a platform thread, possibly
//! more than one for the same unplug. The first one to claim the guard hands
//! the restart to a dedicated worker; any notification that arrives while the
//! guard is held is logged and dropped. The worker releases the guard once
//! the restart has finished, whatever its outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::audio::{AudioError, AudioResult, ErrorCallback, StreamErrorEvent, StreamState};

use super::counters::LifecycleCounters;

/// Commands for the restart worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RestartCommand {
    /// Replace the stream with this id
    Restart { stream_id: u64 },
    Shutdown,
}

/// What a restart attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Completed { old_stream: u64, new_stream: u64 },
    /// Stream was already stopped or replaced
    Skipped,
    Failed(AudioError),
}

/// Something whose stream can be torn down and reopened
pub(crate) trait RestartTarget: Send + Sync {
    fn restart_streams(&self, stream_id: u64) -> RestartOutcome;
}

// ═══════════════════════════════════════════════════════════════════════════
// Trigger
// ═══════════════════════════════════════════════════════════════════════════

/// Non-blocking entry point used from stream error callbacks
#[derive(Clone)]
pub struct RestartTrigger {
    /// Held from acceptance until the worker finishes the restart
    in_progress: Arc<AtomicBool>,
    tx: Sender<RestartCommand>,
    counters: Arc<LifecycleCounters>,
}

impl RestartTrigger {
    /// Error callback to register on every stream the engine opens
    pub fn error_callback(&self) -> ErrorCallback {
        let trigger = self.clone();
        Arc::new(move |event| trigger.on_stream_error(event))
    }

    /// Handle an asynchronous stream error
    ///
    /// Only a disconnect leads to a restart. Other errors are logged.
    pub fn on_stream_error(&self, event: StreamErrorEvent) {
        log::info!(
            "[Restart] Stream {} error ({}): {}",
            event.stream_id,
            event.state,
            event.message
        );
        if event.state == StreamState::Disconnected {
            self.request_restart(event.stream_id);
        }
    }

    /// Ask for a restart of `stream_id` without blocking
    ///
    /// Returns `false` if a restart is already in progress or the worker is gone.
    pub fn request_restart(&self, stream_id: u64) -> bool {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("[Restart] Restart stream operation already in progress - ignoring this request");
            self.counters.record_restart_dropped();
            return false;
        }

        if self.tx.send(RestartCommand::Restart { stream_id }).is_err() {
            log::error!("[Restart] Restart worker is not running, stream {} stays down", stream_id);
            self.in_progress.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_restarting(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════

/// Channel pair connecting a [`RestartTrigger`] to its worker
pub(crate) struct RestartChannel {
    pub trigger: RestartTrigger,
    rx: Receiver<RestartCommand>,
}

impl RestartChannel {
    pub fn new(counters: Arc<LifecycleCounters>) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            trigger: RestartTrigger {
                in_progress: Arc::new(AtomicBool::new(false)),
                tx,
                counters,
            },
            rx,
        }
    }
}

/// Thread that performs accepted restarts one at a time
pub(crate) struct RestartWorker {
    tx: Sender<RestartCommand>,
    handle: Option<JoinHandle<()>>,
}

impl RestartWorker {
    pub fn spawn(channel: RestartChannel, target: Arc<dyn RestartTarget>) -> AudioResult<Self> {
        let RestartChannel {
            trigger:
                RestartTrigger {
                    in_progress,
                    tx,
                    counters,
                },
            rx,
        } = channel;

        let handle = thread::Builder::new()
            .name("stream-restart".to_string())
            .spawn(move || {
                log::debug!("[Restart] Worker started");
                while let Ok(command) = rx.recv() {
                    match command {
                        RestartCommand::Restart { stream_id } => {
                            run_restart(target.as_ref(), &counters, stream_id);
                            in_progress.store(false, Ordering::Release);
                        }
                        RestartCommand::Shutdown => break,
                    }
                }
                log::debug!("[Restart] Worker stopped");
            })
            .map_err(|e| AudioError::Backend(format!("Failed to spawn restart worker: {}", e)))?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Finish any queued restart, then stop the thread
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(RestartCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[Restart] Worker thread panicked");
            }
        }
    }
}

impl Drop for RestartWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_restart(target: &dyn RestartTarget, counters: &LifecycleCounters, stream_id: u64) {
    log::info!("[Restart] Restarting stream {}", stream_id);
    match target.restart_streams(stream_id) {
        RestartOutcome::Completed { old_stream, new_stream } => {
            counters.record_restart_completed();
            log::info!("[Restart] Stream {} replaced by stream {}", old_stream, new_stream);
        }
        RestartOutcome::Skipped => {
            counters.record_restart_skipped();
            log::info!("[Restart] Stream {} is no longer active, nothing to restart", stream_id);
        }
        RestartOutcome::Failed(e) => {
            counters.record_restart_failed();
            log::error!("[Restart] Could not reopen playback after losing stream {}: {}", stream_id, e);
        }
    }
}
