//! Tunnel Coordinator
//!
//! Composition root: one state store, one observer registry and one
//! lifecycle controller sharing a configuration. A process builds one at
//! startup and calls [`TunnelCoordinator::shutdown`] on exit; tests build
//! as many isolated instances as they like.

use crate::bridge::{BridgeEvent, TunnelBridge};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::engine::EngineFactory;
use crate::lifecycle::{StartError, TunnelController};
use crate::observer::{ObserverRegistry, SubscriptionId};
use crate::proxy::ProxyConfiguration;
use crate::state::ConnectionState;
use crate::store::{StateStore, StoreSnapshot};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::{debug, info};

/// Coordinator construction errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn observer dispatcher: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Tunnel connection state coordinator
pub struct TunnelCoordinator {
    config: CoordinatorConfig,
    store: Arc<StateStore>,
    observers: Arc<ObserverRegistry>,
    controller: Arc<TunnelController>,
}

impl TunnelCoordinator {
    /// Build a coordinator in the `Disconnected` state
    pub fn new(
        config: CoordinatorConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let host = config.proxy_ip()?;

        let observers = Arc::new(ObserverRegistry::spawn(
            &config.dispatcher_thread_name,
            ConnectionState::Disconnected,
        )?);
        let store = Arc::new(StateStore::new(observers.clone(), config.proxy_kind, host));
        let controller = Arc::new(TunnelController::new(store.clone(), factory));

        info!(
            "Tunnel coordinator ready ({:?} proxy on {})",
            config.proxy_kind, host
        );

        Ok(Self {
            config,
            store,
            observers,
            controller,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// State store shared with the engine host
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.store.read_state()
    }

    /// Current state, ports and generation
    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    /// Blocking proxy configuration accessor (see [`StateStore::get_configuration`])
    pub fn get_configuration(&self) -> ProxyConfiguration {
        self.store.get_configuration()
    }

    /// Configuration for one destination; bypass hosts never block
    pub fn configuration_for_url(&self, url: &str) -> ProxyConfiguration {
        if self.config.bypasses(url) {
            debug!("Bypassing tunnel for {}", url);
            return ProxyConfiguration::Direct;
        }
        self.store.get_configuration()
    }

    /// Install the host's connection-pool reset hook
    pub fn set_reset_hook<F>(&self, hook: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.store.set_reset_hook(hook);
    }

    /// Register a state listener (current state is replayed first)
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Remove a state listener
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.unsubscribe(id);
    }

    /// Start the tunnel engine with `payload`
    pub async fn start(&self, payload: impl Into<String>) -> Result<(), StartError> {
        self.controller.start(payload).await
    }

    /// Stop the tunnel engine (idempotent)
    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    /// Command/event bridge emitting into `events`
    pub fn bridge(&self, events: Sender<BridgeEvent>) -> TunnelBridge {
        TunnelBridge::new(self.controller.clone(), self.observers.clone(), events)
    }

    /// Stop the engine and the observer dispatcher
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel coordinator");
        self.controller.stop().await;
        self.observers.shutdown();
    }
}
