//! Proxy Configuration
//!
//! Maps `(ConnectionState, ProxyFacts)` to the configuration a network
//! client must use. The mapping is pure: same inputs, same output.
//!
//! | State | Configuration |
//! |-------|---------------|
//! | Disconnected | Direct |
//! | Connected | Local SOCKS (or HTTP) proxy |
//! | Connecting / WaitingForNetwork | none, caller must wait |

use crate::state::{ConnectionState, ProxyFacts};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default address of the engine's local listeners
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Which local listener connected traffic is routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Socks,
    Http,
}

/// How a network client should route its traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyConfiguration {
    /// No proxy
    Direct,
    /// Local SOCKS listener
    Socks(SocketAddr),
    /// Local HTTP listener
    Http(SocketAddr),
}

impl ProxyConfiguration {
    /// SOCKS proxy on the loopback interface
    pub fn local_socks(port: u16) -> Self {
        Self::Socks(SocketAddr::new(LOCALHOST, port))
    }

    /// Check if traffic bypasses the tunnel
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    /// Proxy listener address, if any
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Direct => None,
            Self::Socks(addr) | Self::Http(addr) => Some(*addr),
        }
    }

    /// Proxy URL for clients configured by string, `None` when direct
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            Self::Direct => None,
            Self::Socks(addr) => Some(format!("socks5://{}", addr)),
            Self::Http(addr) => Some(format!("http://{}", addr)),
        }
    }
}

impl fmt::Display for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy_url() {
            Some(url) => write!(f, "via {}", url),
            None => f.write_str("direct"),
        }
    }
}

/// The engine signalled `Connected` before reporting the listener port
/// the configuration needs.
///
/// This is a broken contract with the engine, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invariant violation: {state} reported with unknown {kind:?} proxy port")]
pub struct InvariantViolation {
    pub state: ConnectionState,
    pub kind: ProxyKind,
}

/// Check that `facts` are complete enough to derive a configuration for `state`
pub fn check_invariants(
    kind: ProxyKind,
    state: ConnectionState,
    facts: &ProxyFacts,
) -> Result<(), InvariantViolation> {
    let port = match kind {
        ProxyKind::Socks => facts.socks_proxy_port,
        ProxyKind::Http => facts.http_proxy_port,
    };
    if state.is_connected() && port == 0 {
        return Err(InvariantViolation { state, kind });
    }
    Ok(())
}

/// Derive the SOCKS-flavored configuration on 127.0.0.1
///
/// # Panics
///
/// Panics on `Connected` with an unknown SOCKS port (see [`InvariantViolation`]).
pub fn derive(state: ConnectionState, facts: &ProxyFacts) -> Option<ProxyConfiguration> {
    derive_with(ProxyKind::Socks, LOCALHOST, state, facts)
}

/// Derive a configuration for an arbitrary listener kind and host
///
/// # Panics
///
/// Panics on `Connected` with the required port unknown.
pub fn derive_with(
    kind: ProxyKind,
    host: IpAddr,
    state: ConnectionState,
    facts: &ProxyFacts,
) -> Option<ProxyConfiguration> {
    if let Err(violation) = check_invariants(kind, state, facts) {
        panic!("{}", violation);
    }

    match state {
        ConnectionState::Disconnected => Some(ProxyConfiguration::Direct),
        ConnectionState::Connected => Some(match kind {
            ProxyKind::Socks => {
                ProxyConfiguration::Socks(SocketAddr::new(host, facts.socks_proxy_port))
            }
            ProxyKind::Http => {
                ProxyConfiguration::Http(SocketAddr::new(host, facts.http_proxy_port))
            }
        }),
        ConnectionState::Connecting | ConnectionState::WaitingForNetwork => None,
    }
}
