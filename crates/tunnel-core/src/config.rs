//! Coordinator Configuration
//!
//! Host-side settings for the coordinator. The engine's own configuration
//! payload is opaque and never parsed here.
//!
//! ```toml
//! proxy_kind = "socks"
//! proxy_host = "127.0.0.1"
//! bypass_hosts = ["localhost", "127.0.0.1", "::1"]
//! dispatcher_thread_name = "tunnel-observers"
//! ```

use crate::proxy::ProxyKind;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use url::Url;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Local listener connected traffic goes through
    pub proxy_kind: ProxyKind,
    /// Address of the engine's local listeners
    pub proxy_host: String,
    /// Destinations that always connect directly
    pub bypass_hosts: Vec<String>,
    /// Name of the observer delivery thread
    pub dispatcher_thread_name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            proxy_kind: ProxyKind::Socks,
            proxy_host: "127.0.0.1".to_string(),
            bypass_hosts: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            dispatcher_thread_name: "tunnel-observers".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy_ip()?;
        if self.dispatcher_thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid("dispatcher_thread_name is empty".into()));
        }
        Ok(())
    }

    /// Listener address as an IP
    pub fn proxy_ip(&self) -> Result<IpAddr, ConfigError> {
        self.proxy_host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("proxy_host {:?} is not an IP address", self.proxy_host)))
    }

    /// Check if connections to `url` skip the tunnel
    ///
    /// Unparseable URLs never bypass.
    pub fn bypasses(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        // IPv6 hosts come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.bypass_hosts
            .iter()
            .any(|bypass| bypass.eq_ignore_ascii_case(host))
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
