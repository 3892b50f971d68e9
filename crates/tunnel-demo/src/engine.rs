//! Simulated tunnel engine for the demo host.
//!
//! Accepts any JSON object as configuration and walks through the same
//! callbacks a real engine makes: Connecting, listener ports, Connected,
//! and Disconnected once stopped. The listener ports come from
//! `LocalHttpProxyPort` / `LocalSocksProxyPort` in the payload.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};
use tunnel_core::{ConnectionState, TunnelEngine, TunnelHost};

const DEFAULT_HTTP_PORT: u16 = 8118;
const DEFAULT_SOCKS_PORT: u16 = 1080;
const DEFAULT_CONNECT_DELAY_MS: u64 = 750;

/// Settings the simulation reads from the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settings {
    http_port: u16,
    socks_port: u16,
    connect_delay: Duration,
}

impl Settings {
    fn from_payload(payload: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(payload).ok()?;
        let object = value.as_object()?;

        let port = |key: &str, default: u16| {
            object
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0)
                .unwrap_or(default)
        };
        let delay = object
            .get("SimulatedConnectDelayMs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_CONNECT_DELAY_MS);

        Some(Self {
            http_port: port("LocalHttpProxyPort", DEFAULT_HTTP_PORT),
            socks_port: port("LocalSocksProxyPort", DEFAULT_SOCKS_PORT),
            connect_delay: Duration::from_millis(delay),
        })
    }
}

/// Engine instance driven by a background thread
pub struct SimulatedEngine {
    host: Arc<dyn TunnelHost>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedEngine {
    pub fn new(host: Arc<dyn TunnelHost>) -> Self {
        Self {
            host,
            stop_tx: None,
            worker: None,
        }
    }
}

/// Factory handed to the coordinator
pub fn simulated_factory(host: Arc<dyn TunnelHost>) -> Box<dyn TunnelEngine> {
    Box::new(SimulatedEngine::new(host))
}

impl TunnelEngine for SimulatedEngine {
    fn start(&mut self) -> bool {
        let Some(payload) = self.host.config_payload() else {
            return false;
        };
        let Some(settings) = Settings::from_payload(&payload) else {
            warn!("Simulated engine rejected configuration (not a JSON object)");
            return false;
        };

        let (stop_tx, stop_rx) = bounded(1);
        let host = self.host.clone();
        let worker = thread::Builder::new()
            .name("simulated-engine".to_string())
            .spawn(move || run_engine(host, settings, stop_rx));

        match worker {
            Ok(worker) => {
                self.stop_tx = Some(stop_tx);
                self.worker = Some(worker);
                true
            }
            Err(e) => {
                error!("Failed to spawn simulated engine thread: {}", e);
                false
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Simulated engine thread panicked");
            }
        }
    }
}

fn run_engine(host: Arc<dyn TunnelHost>, settings: Settings, stop_rx: Receiver<()>) {
    debug!("Simulated engine running with {:?}", settings);
    host.on_state_changed(ConnectionState::Disconnected, ConnectionState::Connecting);

    match stop_rx.recv_timeout(settings.connect_delay) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            host.on_state_changed(ConnectionState::Connecting, ConnectionState::Disconnected);
            return;
        }
    }

    host.on_http_proxy_port(settings.http_port);
    host.on_socks_proxy_port(settings.socks_port);
    host.on_state_changed(ConnectionState::Connecting, ConnectionState::Connected);

    // Stay connected until stopped
    let _ = stop_rx.recv();
    host.on_state_changed(ConnectionState::Connected, ConnectionState::Disconnected);
}
