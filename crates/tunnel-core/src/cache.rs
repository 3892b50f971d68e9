//! Configuration cache
//!
//! Memoizes the last derived configuration, tagged with the state
//! generation it was derived for. A lookup with any other generation
//! misses, so a value derived for a stale state is never served.

use crate::proxy::{derive_with, ProxyConfiguration, ProxyKind};
use crate::state::{ConnectionState, ProxyFacts};
use std::net::IpAddr;
use tracing::debug;

/// Generation-tagged memo of the derived configuration
///
/// Not synchronized on its own; it lives inside the state store's
/// critical section.
#[derive(Debug)]
pub struct ConfigCache {
    kind: ProxyKind,
    host: IpAddr,
    entry: Option<(u64, ProxyConfiguration)>,
    hits: u64,
    misses: u64,
}

impl ConfigCache {
    /// Create an empty cache deriving `kind` configurations on `host`
    pub fn new(kind: ProxyKind, host: IpAddr) -> Self {
        Self {
            kind,
            host,
            entry: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Memoized value for `generation`, if any
    pub fn get(&self, generation: u64) -> Option<ProxyConfiguration> {
        match self.entry {
            Some((cached, config)) if cached == generation => Some(config),
            _ => None,
        }
    }

    /// Return the memoized value or derive, memoize and return a new one
    ///
    /// Transient states derive `None`, which is never memoized.
    pub fn get_or_derive(
        &mut self,
        generation: u64,
        state: ConnectionState,
        facts: &ProxyFacts,
    ) -> Option<ProxyConfiguration> {
        if let Some(config) = self.get(generation) {
            self.hits += 1;
            return Some(config);
        }

        self.misses += 1;
        let config = self.derive(state, facts)?;
        debug!("Cached proxy configuration for generation {}: {}", generation, config);
        self.entry = Some((generation, config));
        Some(config)
    }

    /// Derive without touching the memo
    pub fn derive(&self, state: ConnectionState, facts: &ProxyFacts) -> Option<ProxyConfiguration> {
        derive_with(self.kind, self.host, state, facts)
    }

    /// Drop the memoized value
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Listener kind this cache derives for
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
