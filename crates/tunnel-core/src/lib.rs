//! Tunnel Core - Connection State Coordinator
//!
//! Owns the tunnel's connection state, derives the proxy configuration
//! the host networking layer must use, and fans state changes out to UI
//! observers. The tunnel engine itself is an external collaborator.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐ state / ports  ┌──────────────────────────────┐
//! │ Tunnel Engine  │───────────────▶│        State Store           │
//! │ (external)     │                │ state, ports, generation     │
//! └───────▲────────┘                │ config cache ── Condvar ─────┼──▶ get_configuration()
//!         │ start / stop            └──────────────┬───────────────┘    (networking threads)
//! ┌───────┴────────┐                               │ queued transitions
//! │   Lifecycle    │                ┌──────────────▼───────────────┐
//! │   Controller   │                │  Observer Registry           │──▶ listeners / bridge
//! └───────▲────────┘                │  (dispatcher thread)         │    (UI)
//!         │ StartTunnel / StopTunnel└──────────────────────────────┘
//! ┌───────┴────────┐
//! │  Tunnel Bridge │
//! └────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Connection state has one writer at a time; the cache is invalidated
//!   before a transition is observable
//! - `get_configuration()` never answers for a transient state, and
//!   returns the first terminal state reached after the call began
//! - Observers see every transition, in order, after one replay of the
//!   current state

mod bridge;
mod cache;
mod config;
mod coordinator;
mod engine;
mod lifecycle;
mod observer;
mod proxy;
mod state;
mod store;

#[cfg(test)]
mod test_support;

pub use bridge::{BridgeCommand, BridgeError, BridgeEvent, BridgeResponse, TunnelBridge, CONNECTION_STATE_EVENT};
pub use cache::ConfigCache;
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{CoordinatorError, TunnelCoordinator};
pub use engine::{EngineFactory, StoreHost, TunnelEngine, TunnelHost};
pub use lifecycle::{StartError, TunnelController, TunnelHandle};
pub use observer::{Listener, ObserverRegistry, SubscriptionId};
pub use proxy::{
    check_invariants, derive, derive_with, InvariantViolation, ProxyConfiguration, ProxyKind,
    LOCALHOST,
};
pub use state::{ConnectionState, ProxyFacts, UnknownState};
pub use store::{ResetHook, StateStore, StoreSnapshot};
