//! Tunnel Lifecycle Controller
//!
//! Owns the at-most-one engine handle and turns start/stop commands
//! into engine calls. It never writes connection state itself: the
//! engine reports state through its host callbacks, keeping the state
//! store the single authority.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = TunnelController::new(store.clone(), Arc::new(factory));
//!
//! controller.start(config_json).await?;
//! // ... engine reports Connecting / Connected on its own threads
//! controller.stop().await;
//! controller.stop().await; // no-op
//! ```
//!
//! A `Connected` report that arrives after `stop()` is still recorded;
//! suppressing late reports is left to the engine's own contract.

use crate::engine::{EngineFactory, StoreHost, TunnelEngine};
use crate::store::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("Tunnel engine failed to start: {0}")]
    EngineStartFailed(String),
}

/// The running engine instance
pub struct TunnelHandle {
    id: u64,
    engine: Box<dyn TunnelEngine>,
}

impl TunnelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Tunnel lifecycle controller
pub struct TunnelController {
    store: Arc<StateStore>,
    factory: Arc<dyn EngineFactory>,
    handle: Arc<Mutex<Option<TunnelHandle>>>,
    next_handle: AtomicU64,
}

impl TunnelController {
    /// Create a controller with no engine running
    pub fn new(store: Arc<StateStore>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            store,
            factory,
            handle: Arc::new(Mutex::new(None)),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Create a new engine handle bound to `payload` and start it
    ///
    /// Returns once the engine accepted the start request; connecting
    /// continues in the background and is reported through state changes.
    /// Dropping the returned future does not abandon the engine: the start
    /// runs to completion on its own task and the handle lands in the slot.
    pub async fn start(&self, payload: impl Into<String>) -> Result<(), StartError> {
        let slot = self.handle.clone();
        let store = self.store.clone();
        let factory = self.factory.clone();
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let payload = payload.into();

        tokio::spawn(start_engine(slot, store, factory, id, payload))
            .await
            .map_err(|e| {
                error!("Tunnel start task failed (handle {}): {}", id, e);
                StartError::EngineStartFailed(e.to_string())
            })?
    }

    /// Stop and discard the engine handle, if any
    ///
    /// Idempotent. Does not change connection state itself.
    pub async fn stop(&self) {
        let mut slot = self.handle.lock().await;
        let Some(handle) = slot.take() else {
            debug!("Stop requested with no tunnel handle");
            return;
        };

        let TunnelHandle { id, mut engine } = handle;
        info!("Stopping tunnel engine (handle {})", id);

        if let Err(e) = tokio::task::spawn_blocking(move || engine.stop()).await {
            error!("Tunnel engine stop panicked (handle {}): {}", id, e);
        }

        info!("Tunnel engine stopped (handle {})", id);
    }

    /// Check if a handle is active
    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Id of the active handle
    pub async fn handle_id(&self) -> Option<u64> {
        self.handle.lock().await.as_ref().map(TunnelHandle::id)
    }
}

async fn start_engine(
    slot: Arc<Mutex<Option<TunnelHandle>>>,
    store: Arc<StateStore>,
    factory: Arc<dyn EngineFactory>,
    id: u64,
    payload: String,
) -> Result<(), StartError> {
    let mut slot = slot.lock().await;
    if let Some(handle) = slot.as_ref() {
        warn!("Start requested while tunnel handle {} is active", handle.id);
        return Err(StartError::AlreadyRunning);
    }

    let host = Arc::new(StoreHost::new(store, payload));
    let mut engine = factory.create(host);

    info!("Starting tunnel engine (handle {})", id);

    // Engine start may block on I/O; keep it off the async workers
    let (engine, started) = tokio::task::spawn_blocking(move || {
        let started = engine.start();
        (engine, started)
    })
    .await
    .map_err(|e| {
        error!("Tunnel engine start panicked (handle {}): {}", id, e);
        StartError::EngineStartFailed(e.to_string())
    })?;

    if !started {
        error!("Tunnel engine rejected start (handle {})", id);
        drop(engine);
        return Err(StartError::EngineStartFailed(
            "engine rejected configuration or could not bind".to_string(),
        ));
    }

    *slot = Some(TunnelHandle { id, engine });
    info!("Tunnel engine started (handle {})", id);
    Ok(())
}
