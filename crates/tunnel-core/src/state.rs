//! Connection state and proxy facts
//!
//! Both values are reported by the tunnel engine; nothing in this crate
//! computes a transition locally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Tunnel is not running (or has dropped)
    #[default]
    Disconnected,
    /// Engine is establishing the tunnel
    Connecting,
    /// Engine is waiting for network connectivity
    WaitingForNetwork,
    /// Tunnel is up and local proxies are listening
    Connected,
}

impl ConnectionState {
    /// All states, in declaration order
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::WaitingForNetwork,
        ConnectionState::Connected,
    ];

    /// Check if a proxy configuration can be derived for this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Disconnected)
    }

    /// Check if traffic should go through the tunnel
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Wire label used on the bridge event stream
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::WaitingForNetwork => "WAITING_FOR_NETWORK",
            ConnectionState::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ConnectionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Unrecognized state label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown connection state: {0}")]
pub struct UnknownState(pub String);

/// Local proxy listener ports reported by the engine
///
/// A port of `0` means the engine has not reported it yet. Ports are
/// updated independently of state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyFacts {
    /// Local HTTP proxy port
    pub http_proxy_port: u16,
    /// Local SOCKS proxy port
    pub socks_proxy_port: u16,
}

impl ProxyFacts {
    /// Facts with both ports known
    pub fn new(http_proxy_port: u16, socks_proxy_port: u16) -> Self {
        Self {
            http_proxy_port,
            socks_proxy_port,
        }
    }
}
