//! Bridge Module
//!
//! Command/event surface for a UI living across a process (or language)
//! boundary. Commands and events are JSON objects:
//!
//! ```text
//! → {"command":"StartTunnel","config":"{...}"}     ← {"ok":true}
//! → {"command":"StopTunnel"}                        ← {"ok":true}
//! → {"command":"AddListener","event":"ConnectionStateChanged"}
//! → {"command":"RemoveListeners","count":1}
//! ← {"event":"ConnectionStateChanged","state":"CONNECTED"}
//! ```
//!
//! UI listeners are counted. The first one opens a single registry
//! subscription that forwards into the event sink; it is released only
//! when the count returns to zero.

use crate::lifecycle::TunnelController;
use crate::observer::{ObserverRegistry, SubscriptionId};
use crate::state::ConnectionState;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Name of the state event stream
pub const CONNECTION_STATE_EVENT: &str = "ConnectionStateChanged";

/// Command from the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum BridgeCommand {
    StartTunnel { config: String },
    StopTunnel,
    AddListener { event: String },
    RemoveListeners { count: u32 },
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Event pushed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BridgeEvent {
    ConnectionStateChanged { state: ConnectionState },
}

/// Bridge errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Malformed command: {0}")]
    Decode(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

#[derive(Default)]
struct ListenerState {
    count: u32,
    subscription: Option<SubscriptionId>,
}

/// UI bridge over the lifecycle controller and observer registry
pub struct TunnelBridge {
    controller: Arc<TunnelController>,
    observers: Arc<ObserverRegistry>,
    events: Sender<BridgeEvent>,
    listeners: Mutex<ListenerState>,
}

impl TunnelBridge {
    /// Create a bridge emitting events into `events`
    pub fn new(
        controller: Arc<TunnelController>,
        observers: Arc<ObserverRegistry>,
        events: Sender<BridgeEvent>,
    ) -> Self {
        Self {
            controller,
            observers,
            events,
            listeners: Mutex::new(ListenerState::default()),
        }
    }

    /// Execute a command
    pub async fn handle(&self, command: BridgeCommand) -> BridgeResponse {
        debug!("Bridge command: {:?}", command);
        match command {
            BridgeCommand::StartTunnel { config } => match self.controller.start(config).await {
                Ok(()) => BridgeResponse::ok(),
                Err(e) => BridgeResponse::failure(e),
            },
            BridgeCommand::StopTunnel => {
                self.controller.stop().await;
                BridgeResponse::ok()
            }
            BridgeCommand::AddListener { event } => match self.add_listener(&event) {
                Ok(()) => BridgeResponse::ok(),
                Err(e) => BridgeResponse::failure(e),
            },
            BridgeCommand::RemoveListeners { count } => {
                self.remove_listeners(count);
                BridgeResponse::ok()
            }
        }
    }

    /// Decode a JSON command, execute it and encode the reply
    pub async fn handle_json(&self, input: &str) -> String {
        let response = match serde_json::from_str::<BridgeCommand>(input) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!("Rejected bridge input: {}", e);
                BridgeResponse::failure(BridgeError::Decode(e.to_string()))
            }
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"encode failed"}"#.to_string())
    }

    /// Count one more UI listener for `event`
    pub fn add_listener(&self, event: &str) -> Result<(), BridgeError> {
        if event != CONNECTION_STATE_EVENT {
            return Err(BridgeError::UnknownEvent(event.to_string()));
        }

        let mut listeners = self.lock_listeners();
        listeners.count += 1;
        if listeners.subscription.is_none() {
            let events = self.events.clone();
            let id = self.observers.subscribe(move |state| {
                if events.send(BridgeEvent::ConnectionStateChanged { state }).is_err() {
                    debug!("Bridge event sink closed");
                }
            });
            info!("Bridge opened state subscription {}", id);
            listeners.subscription = Some(id);
        }
        Ok(())
    }

    /// Forget `count` UI listeners; the last one releases the subscription
    pub fn remove_listeners(&self, count: u32) {
        let mut listeners = self.lock_listeners();
        if count > listeners.count {
            warn!(
                "Removing {} listeners with only {} registered",
                count, listeners.count
            );
        }
        listeners.count = listeners.count.saturating_sub(count);
        if listeners.count == 0 {
            if let Some(id) = listeners.subscription.take() {
                self.observers.unsubscribe(id);
                info!("Bridge released state subscription {}", id);
            }
        }
    }

    /// Number of UI listeners currently counted
    pub fn listener_count(&self) -> u32 {
        self.lock_listeners().count
    }

    fn lock_listeners(&self) -> MutexGuard<'_, ListenerState> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TunnelBridge {
    fn drop(&mut self) {
        let subscription = self.lock_listeners().subscription.take();
        if let Some(id) = subscription {
            self.observers.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyKind, LOCALHOST};
    use crate::store::StateStore;
    use crate::test_support::FakeFactory;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    struct Fixture {
        store: Arc<StateStore>,
        observers: Arc<ObserverRegistry>,
        bridge: TunnelBridge,
        events: Receiver<BridgeEvent>,
    }

    fn fixture(factory: FakeFactory) -> Fixture {
        let observers =
            Arc::new(ObserverRegistry::spawn("test-observers", ConnectionState::Disconnected).unwrap());
        let store = Arc::new(StateStore::new(observers.clone(), ProxyKind::Socks, LOCALHOST));
        let controller = Arc::new(TunnelController::new(store.clone(), Arc::new(factory)));
        let (tx, events) = unbounded();
        let bridge = TunnelBridge::new(controller, observers.clone(), tx);
        Fixture {
            store,
            observers,
            bridge,
            events,
        }
    }

    fn next_state(events: &Receiver<BridgeEvent>) -> ConnectionState {
        let BridgeEvent::ConnectionStateChanged { state } =
            events.recv_timeout(Duration::from_secs(5)).unwrap();
        state
    }

    #[test]
    fn test_command_json() {
        let command: BridgeCommand =
            serde_json::from_str(r#"{"command":"StartTunnel","config":"{}"}"#).unwrap();
        assert_eq!(command, BridgeCommand::StartTunnel { config: "{}".into() });

        let event = BridgeEvent::ConnectionStateChanged {
            state: ConnectionState::WaitingForNetwork,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"ConnectionStateChanged","state":"WAITING_FOR_NETWORK"}"#
        );
    }

    #[test]
    fn test_listeners_share_one_subscription() {
        let f = fixture(FakeFactory::new(true, vec![]));

        f.bridge.add_listener(CONNECTION_STATE_EVENT).unwrap();
        f.bridge.add_listener(CONNECTION_STATE_EVENT).unwrap();
        assert_eq!(f.observers.subscriber_count(), 1);
        assert_eq!(next_state(&f.events), ConnectionState::Disconnected);

        f.bridge.remove_listeners(1);
        f.store.report_state_change(ConnectionState::Connecting);
        f.store.report_state_change(ConnectionState::WaitingForNetwork);
        f.store.report_state_change(ConnectionState::Disconnected);
        assert_eq!(next_state(&f.events), ConnectionState::Connecting);
        assert_eq!(next_state(&f.events), ConnectionState::WaitingForNetwork);
        assert_eq!(next_state(&f.events), ConnectionState::Disconnected);

        f.bridge.remove_listeners(1);
        assert_eq!(f.observers.subscriber_count(), 0);
        f.store.report_state_change(ConnectionState::Connecting);
        assert!(f.events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_repeated_mount_unmount() {
        let f = fixture(FakeFactory::new(true, vec![]));

        for _ in 0..5 {
            f.bridge.add_listener(CONNECTION_STATE_EVENT).unwrap();
            f.bridge.remove_listeners(1);
            f.bridge.remove_listeners(1);
        }

        assert_eq!(f.bridge.listener_count(), 0);
        assert_eq!(f.observers.subscriber_count(), 0);
        assert_eq!(f.events.try_iter().count(), 5);
    }

    #[test]
    fn test_unknown_event() {
        let f = fixture(FakeFactory::new(true, vec![]));

        let result = f.bridge.add_listener("NetworkActivity");

        assert_eq!(result, Err(BridgeError::UnknownEvent("NetworkActivity".into())));
        assert_eq!(f.bridge.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_json_start_stop() {
        let f = fixture(FakeFactory::connecting_then_connected(1080));

        let started = f.bridge.handle_json(r#"{"command":"StartTunnel","config":"{}"}"#).await;
        assert_eq!(started, r#"{"ok":true}"#);

        let again = f.bridge.handle_json(r#"{"command":"StartTunnel","config":"{}"}"#).await;
        let again: BridgeResponse = serde_json::from_str(&again).unwrap();
        assert!(!again.ok);
        assert_eq!(again.error.as_deref(), Some("Tunnel already running"));

        let stopped = f.bridge.handle_json(r#"{"command":"StopTunnel"}"#).await;
        assert_eq!(stopped, r#"{"ok":true}"#);
        assert_eq!(f.store.read_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_json_malformed() {
        let f = fixture(FakeFactory::new(true, vec![]));

        let reply = f.bridge.handle_json(r#"{"command":"Reboot"}"#).await;
        let reply: BridgeResponse = serde_json::from_str(&reply).unwrap();

        assert!(!reply.ok);
        assert!(reply.error.unwrap().starts_with("Malformed command"));
    }
}
