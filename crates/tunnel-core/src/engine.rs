//! Tunnel engine interface
//!
//! The engine is an external collaborator. It is driven through
//! [`TunnelEngine`] and reports back through [`TunnelHost`] on threads of
//! its own choosing.

use crate::state::ConnectionState;
use crate::store::StateStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callbacks the engine invokes
pub trait TunnelHost: Send + Sync {
    /// Configuration payload the engine should start with
    fn config_payload(&self) -> Option<String>;

    /// Connection state changed
    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState);

    /// Local HTTP proxy is listening
    fn on_http_proxy_port(&self, port: u16);

    /// Local SOCKS proxy is listening
    fn on_socks_proxy_port(&self, port: u16);
}

/// One running (or startable) engine instance
pub trait TunnelEngine: Send {
    /// Start tunneling. `false` means the engine rejected its configuration
    /// or could not bind its listeners.
    fn start(&mut self) -> bool;

    /// Stop tunneling. Must tolerate being called on an engine that
    /// never started.
    fn stop(&mut self);
}

/// Creates engine instances bound to a host
pub trait EngineFactory: Send + Sync {
    fn create(&self, host: Arc<dyn TunnelHost>) -> Box<dyn TunnelEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(Arc<dyn TunnelHost>) -> Box<dyn TunnelEngine> + Send + Sync,
{
    fn create(&self, host: Arc<dyn TunnelHost>) -> Box<dyn TunnelEngine> {
        self(host)
    }
}

/// Host handed to one engine instance
///
/// Forwards every callback to the state store and carries the payload
/// that instance was started with.
pub struct StoreHost {
    store: Arc<StateStore>,
    payload: String,
}

impl StoreHost {
    pub fn new(store: Arc<StateStore>, payload: String) -> Self {
        Self { store, payload }
    }
}

impl TunnelHost for StoreHost {
    fn config_payload(&self) -> Option<String> {
        if self.payload.is_empty() {
            warn!("Tunnel engine asked for configuration, none set");
            return None;
        }
        Some(self.payload.clone())
    }

    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        debug!("Engine reported {} -> {}", old, new);
        self.store.report_state_change(new);
    }

    fn on_http_proxy_port(&self, port: u16) {
        self.store.report_http_port(port);
    }

    fn on_socks_proxy_port(&self, port: u16) {
        self.store.report_socks_port(port);
    }
}
