//! Owned wrapper around one platform stream
//!
//! Drives the two transitions the engine cares about and waits for the
//! platform to confirm each one, never longer than
//! [`STATE_TRANSITION_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use super::config::{StreamProperties, STATE_TRANSITION_TIMEOUT};
use super::error::{AudioError, AudioResult};
use super::platform::{PlatformStream, StreamState};

/// Exclusively owned handle to an open platform stream
pub struct StreamHandle {
    stream: Arc<dyn PlatformStream>,
    properties: StreamProperties,
}

impl StreamHandle {
    pub(crate) fn new(stream: Arc<dyn PlatformStream>, properties: StreamProperties) -> Self {
        Self { stream, properties }
    }

    pub fn id(&self) -> u64 {
        self.stream.id()
    }

    /// Properties granted when the stream was created
    pub fn properties(&self) -> StreamProperties {
        self.properties
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Shared reference for the buffer writer
    pub(crate) fn platform_stream(&self) -> Arc<dyn PlatformStream> {
        Arc::clone(&self.stream)
    }

    /// Request start and wait for `Starting` to resolve into `Started`
    pub fn start_stream(&self) -> AudioResult<()> {
        self.transition("start", StreamState::Starting, StreamState::Started, |s| {
            s.request_start()
        })
        .map_err(|e| {
            log::error!("[Stream {}] Error starting stream: {}", self.id(), e);
            e
        })
    }

    /// Request stop and wait for `Stopping` to resolve into `Stopped`
    pub fn stop_stream(&self) -> AudioResult<()> {
        self.transition("stop", StreamState::Stopping, StreamState::Stopped, |s| {
            s.request_stop()
        })
        .map_err(|e| {
            log::error!("[Stream {}] Error stopping stream: {}", self.id(), e);
            e
        })
    }

    /// Release platform resources
    ///
    /// The platform guarantees that any in-flight callback on this stream has
    /// finished before `close` returns, so no extra synchronization is needed
    /// with the callback thread.
    pub fn close_stream(self) -> AudioResult<()> {
        let id = self.id();
        self.stream.close().map_err(|e| {
            log::error!("[Stream {}] Error closing stream: {}", id, e);
            e
        })?;
        log::debug!("[Stream {}] Closed", id);
        Ok(())
    }

    fn transition(
        &self,
        operation: &'static str,
        transient: StreamState,
        target: StreamState,
        request: impl FnOnce(&dyn PlatformStream) -> AudioResult<()>,
    ) -> AudioResult<()> {
        request(self.stream.as_ref())?;
        let next = wait_for_transition(self.stream.as_ref(), operation, transient, STATE_TRANSITION_TIMEOUT)?;
        if next != target {
            return Err(AudioError::UnexpectedState {
                operation,
                expected: target,
                actual: next,
            });
        }
        log::debug!("[Stream {}] {} confirmed ({})", self.id(), operation, next);
        Ok(())
    }
}

/// Wait for `transient` to resolve, tagging a timeout with the operation name
fn wait_for_transition(
    stream: &dyn PlatformStream,
    operation: &'static str,
    transient: StreamState,
    timeout: Duration,
) -> AudioResult<StreamState> {
    stream
        .wait_for_state_change(transient, timeout)
        .map_err(|e| match e {
            AudioError::StateTimeout { state, .. } => AudioError::StateTimeout { operation, state },
            other => other,
        })
}
