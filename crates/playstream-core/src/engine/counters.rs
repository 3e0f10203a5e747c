//! Lifecycle counters readable without locks
//!
//! Written by the lifecycle, restart and writer threads; read by the host
//! for status display and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LifecycleCounters {
    streams_opened: AtomicU64,
    restarts_completed: AtomicU64,
    restarts_failed: AtomicU64,
    /// Disconnects that lost the guard race
    restarts_dropped: AtomicU64,
    /// Restarts for a stream that was already stopped or replaced
    restarts_skipped: AtomicU64,
    frames_written: AtomicU64,
}

/// Point-in-time copy of [`LifecycleCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub streams_opened: u64,
    pub restarts_completed: u64,
    pub restarts_failed: u64,
    pub restarts_dropped: u64,
    pub restarts_skipped: u64,
    pub frames_written: u64,
}

impl LifecycleCounters {
    pub fn streams_opened(&self) -> u64 {
        self.streams_opened.load(Ordering::Relaxed)
    }

    pub fn restarts_completed(&self) -> u64 {
        self.restarts_completed.load(Ordering::Relaxed)
    }

    pub fn restarts_failed(&self) -> u64 {
        self.restarts_failed.load(Ordering::Relaxed)
    }

    pub fn restarts_dropped(&self) -> u64 {
        self.restarts_dropped.load(Ordering::Relaxed)
    }

    pub fn restarts_skipped(&self) -> u64 {
        self.restarts_skipped.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            streams_opened: self.streams_opened(),
            restarts_completed: self.restarts_completed(),
            restarts_failed: self.restarts_failed(),
            restarts_dropped: self.restarts_dropped(),
            restarts_skipped: self.restarts_skipped(),
            frames_written: self.frames_written(),
        }
    }

    pub(crate) fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart_completed(&self) {
        self.restarts_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart_failed(&self) {
        self.restarts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart_dropped(&self) {
        self.restarts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart_skipped(&self) {
        self.restarts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frames_written(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
    }
}
