//! Host-facing engine context
//!
//! Boundary surface for an embedding application: a lazily created engine
//! behind `init`/`start`/`stop`/`write_buffer`/`delete`. Every call other
//! than `init` on an uninitialised host is logged and rejected.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audio::{AudioError, AudioPlatform, AudioResult, StreamParameters, StreamProperties};
use crate::engine::{CounterSnapshot, StreamEngine};

pub struct EngineHost {
    platform: Arc<dyn AudioPlatform>,
    params: StreamParameters,
    engine: Mutex<Option<StreamEngine>>,
}

impl EngineHost {
    pub fn new(platform: Arc<dyn AudioPlatform>) -> Self {
        Self::with_parameters(platform, StreamParameters::playback())
    }

    pub fn with_parameters(platform: Arc<dyn AudioPlatform>, params: StreamParameters) -> Self {
        Self {
            platform,
            params,
            engine: Mutex::new(None),
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<StreamEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the engine if it does not exist yet
    ///
    /// Returns whether an engine is available afterwards.
    pub fn init(&self) -> bool {
        let mut engine = self.lock_engine();
        if engine.is_some() {
            return true;
        }
        match StreamEngine::with_parameters(Arc::clone(&self.platform), self.params.clone()) {
            Ok(created) => {
                log::info!("[EngineHost] Engine created on {} platform", created.platform_name());
                *engine = Some(created);
                true
            }
            Err(e) => {
                log::error!("[EngineHost] Could not create engine: {}", e);
                false
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_engine().is_some()
    }

    pub fn start(&self) -> AudioResult<StreamProperties> {
        self.with_engine("start", StreamEngine::start)
    }

    pub fn stop(&self) -> AudioResult<()> {
        self.with_engine("stop", StreamEngine::stop)
    }

    pub fn write_buffer(&self, samples: impl Into<Arc<[i16]>>) -> AudioResult<()> {
        let samples = samples.into();
        self.with_engine("write_buffer", move |engine| {
            engine.write_buffer(samples);
            Ok(())
        })
    }

    pub fn counters(&self) -> AudioResult<CounterSnapshot> {
        self.with_engine("counters", |engine| Ok(engine.counters().snapshot()))
    }

    pub fn stream_properties(&self) -> AudioResult<Option<StreamProperties>> {
        self.with_engine("stream_properties", |engine| Ok(engine.stream_properties()))
    }

    /// Destroy the engine, stopping and closing any open stream
    ///
    /// The host can be initialised again afterwards.
    pub fn delete(&self) -> AudioResult<()> {
        let engine = self.lock_engine().take();
        match engine {
            Some(engine) => {
                drop(engine);
                log::info!("[EngineHost] Engine deleted");
                Ok(())
            }
            None => {
                log::error!("[EngineHost] delete called before init");
                Err(AudioError::NotInitialized)
            }
        }
    }

    fn with_engine<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&StreamEngine) -> AudioResult<T>,
    ) -> AudioResult<T> {
        let engine = self.lock_engine();
        match engine.as_ref() {
            Some(engine) => f(engine),
            None => {
                log::error!("[EngineHost] {} called before init", operation);
                Err(AudioError::NotInitialized)
            }
        }
    }
}
