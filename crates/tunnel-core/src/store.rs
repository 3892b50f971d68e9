//! Connection State Store
//!
//! Single source of truth for the tunnel's connection state and the
//! listener ports the engine reports. Also hosts the blocking
//! configuration accessor, since both share one critical section.
//!
//! # Transition
//!
//! `report_state_change` performs, under the state lock:
//!
//! 1. replace the state and bump the transition generation
//! 2. invalidate the configuration cache
//! 3. queue the new state for observers
//! 4. wake every thread blocked in [`StateStore::get_configuration`]
//!
//! A woken thread re-acquires the same lock, so it always observes 1 and 2.
//! The host's connection-pool reset hook runs after the lock is released.

use crate::cache::ConfigCache;
use crate::observer::ObserverRegistry;
use crate::proxy::{check_invariants, ProxyConfiguration, ProxyKind};
use crate::state::{ConnectionState, ProxyFacts};
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info};

/// Host callback told to drop pooled connections after a state change
pub type ResetHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Consistent view of the store at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub state: ConnectionState,
    pub facts: ProxyFacts,
    /// Number of transitions reported so far
    pub generation: u64,
}

/// A terminal transition kept for accessors that were waiting when it happened
#[derive(Debug, Clone, Copy)]
struct TerminalRecord {
    generation: u64,
    state: ConnectionState,
    facts: ProxyFacts,
}

struct StoreInner {
    state: ConnectionState,
    facts: ProxyFacts,
    generation: u64,
    cache: ConfigCache,
    /// Blocked accessors, keyed by the generation they started waiting at
    waiters: BTreeMap<u64, usize>,
    terminal_log: VecDeque<TerminalRecord>,
}

impl StoreInner {
    fn first_terminal_after(&self, generation: u64) -> Option<TerminalRecord> {
        self.terminal_log
            .iter()
            .find(|record| record.generation > generation)
            .copied()
    }

    fn add_waiter(&mut self, generation: u64) {
        *self.waiters.entry(generation).or_insert(0) += 1;
    }

    fn release_waiter(&mut self, generation: u64) {
        if let Some(count) = self.waiters.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                self.waiters.remove(&generation);
            }
        }

        // Records at or below the oldest waiter's start can't be anyone's answer
        match self.waiters.keys().next().copied() {
            None => self.terminal_log.clear(),
            Some(oldest) => {
                while self
                    .terminal_log
                    .front()
                    .is_some_and(|record| record.generation <= oldest)
                {
                    self.terminal_log.pop_front();
                }
            }
        }
    }
}

/// Connection state store
pub struct StateStore {
    inner: Mutex<StoreInner>,
    transition: Condvar,
    observers: Arc<ObserverRegistry>,
    reset_hook: RwLock<Option<ResetHook>>,
}

impl StateStore {
    /// Create a store in the `Disconnected` state with no ports known
    pub fn new(observers: Arc<ObserverRegistry>, kind: ProxyKind, host: IpAddr) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                state: ConnectionState::Disconnected,
                facts: ProxyFacts::default(),
                generation: 0,
                cache: ConfigCache::new(kind, host),
                waiters: BTreeMap::new(),
                terminal_log: VecDeque::new(),
            }),
            transition: Condvar::new(),
            observers,
            reset_hook: RwLock::new(None),
        }
    }

    /// Record a state transition reported by the engine
    pub fn report_state_change(&self, new_state: ConnectionState) {
        let (old_state, generation) = {
            let mut inner = self.lock();
            let old_state = std::mem::replace(&mut inner.state, new_state);
            inner.generation += 1;
            inner.cache.invalidate();

            let kind = inner.cache.kind();
            if let Err(violation) = check_invariants(kind, new_state, &inner.facts) {
                error!("{} (engine contract broken)", violation);
            }

            if new_state.is_terminal() && !inner.waiters.is_empty() {
                let record = TerminalRecord {
                    generation: inner.generation,
                    state: new_state,
                    facts: inner.facts,
                };
                inner.terminal_log.push_back(record);
            }

            self.observers.publish(new_state);
            self.transition.notify_all();
            (old_state, inner.generation)
        };

        info!("Tunnel state {} -> {} (generation {})", old_state, new_state, generation);

        let hook = self
            .reset_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(new_state);
        }
    }

    /// Record the engine's local HTTP proxy port
    pub fn report_http_port(&self, port: u16) {
        let mut inner = self.lock();
        if inner.facts.http_proxy_port != port {
            inner.facts.http_proxy_port = port;
            inner.cache.invalidate();
        }
        debug!("HTTP proxy listening on port {}", port);
    }

    /// Record the engine's local SOCKS proxy port
    pub fn report_socks_port(&self, port: u16) {
        let mut inner = self.lock();
        if inner.facts.socks_proxy_port != port {
            inner.facts.socks_proxy_port = port;
            inner.cache.invalidate();
        }
        debug!("SOCKS proxy listening on port {}", port);
    }

    /// Current state
    pub fn read_state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Current state, ports and generation, read atomically
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            state: inner.state,
            facts: inner.facts,
            generation: inner.generation,
        }
    }

    /// Number of threads blocked in [`Self::get_configuration`]
    pub fn waiting(&self) -> usize {
        self.lock().waiters.values().sum()
    }

    /// (hits, misses) of the configuration cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.lock().cache.stats()
    }

    /// Install the host's connection-pool reset hook, replacing any previous one
    pub fn set_reset_hook<F>(&self, hook: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self
            .reset_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Remove the reset hook
    pub fn clear_reset_hook(&self) {
        *self
            .reset_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Proxy configuration for the current state, blocking while it is transient
    ///
    /// Never fails, only delays: the answer matches the first terminal state
    /// (`Connected` or `Disconnected`) reached after the call began. Meant
    /// for networking threads that cannot suspend cooperatively; do not
    /// call it from an async task.
    ///
    /// # Panics
    ///
    /// Panics if the engine reported `Connected` without the listener port
    /// the configuration needs.
    pub fn get_configuration(&self) -> ProxyConfiguration {
        let mut inner = self.lock();

        let (generation, state, facts) = (inner.generation, inner.state, inner.facts);
        if let Some(config) = inner.cache.get_or_derive(generation, state, &facts) {
            return config;
        }

        let start = generation;
        inner.add_waiter(start);
        debug!("Waiting for a terminal state (state {}, generation {})", state, start);

        loop {
            if let Some(record) = inner.first_terminal_after(start) {
                // Leave the waiter registry clean before surfacing a broken report
                let facts = if record.generation == inner.generation {
                    inner.facts
                } else {
                    record.facts
                };
                if let Err(violation) = check_invariants(inner.cache.kind(), record.state, &facts) {
                    inner.release_waiter(start);
                    drop(inner);
                    panic!("{}", violation);
                }

                let config = if record.generation == inner.generation {
                    let facts = inner.facts;
                    inner.cache.get_or_derive(record.generation, record.state, &facts)
                } else {
                    inner.cache.derive(record.state, &record.facts)
                };
                if let Some(config) = config {
                    inner.release_waiter(start);
                    debug!("Resolved configuration after generation {}: {}", start, config);
                    return config;
                }
            }
            inner = self
                .transition
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LOCALHOST;
    use crate::test_support::{wait_until, Recorder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn store() -> Arc<StateStore> {
        let observers =
            Arc::new(ObserverRegistry::spawn("test-observers", ConnectionState::Disconnected).unwrap());
        Arc::new(StateStore::new(observers, ProxyKind::Socks, LOCALHOST))
    }

    fn spawn_reader(store: &Arc<StateStore>) -> thread::JoinHandle<ProxyConfiguration> {
        let store = store.clone();
        thread::spawn(move || store.get_configuration())
    }

    #[test]
    fn test_initial_state_is_direct() {
        let store = store();

        assert_eq!(store.read_state(), ConnectionState::Disconnected);
        assert_eq!(store.get_configuration(), ProxyConfiguration::Direct);
        assert_eq!(store.get_configuration(), ProxyConfiguration::Direct);
        assert_eq!(store.cache_stats(), (1, 1));
    }

    #[test]
    fn test_blocked_reader_released_on_connect() {
        let store = store();
        store.report_state_change(ConnectionState::Connecting);

        let reader = spawn_reader(&store);
        assert!(wait_until(Duration::from_secs(5), || store.waiting() == 1));

        store.report_socks_port(1080);
        store.report_state_change(ConnectionState::Connected);

        let config = reader.join().unwrap();
        assert_eq!(config, ProxyConfiguration::local_socks(1080));
        assert_eq!(store.waiting(), 0);
    }

    #[test]
    fn test_connected_without_port_releases_waiter() {
        let store = store();
        store.report_state_change(ConnectionState::Connecting);

        let reader = spawn_reader(&store);
        assert!(wait_until(Duration::from_secs(5), || store.waiting() == 1));

        // SOCKS port never reported
        store.report_state_change(ConnectionState::Connected);

        assert!(reader.join().is_err());
        assert_eq!(store.waiting(), 0);

        for _ in 0..100 {
            store.report_state_change(ConnectionState::Disconnected);
            store.report_state_change(ConnectionState::Connecting);
        }
        assert!(store.lock().terminal_log.is_empty());
    }

    #[test]
    fn test_reader_keeps_waiting_through_transient_states() {
        let store = store();
        store.report_state_change(ConnectionState::Connecting);

        let reader = spawn_reader(&store);
        assert!(wait_until(Duration::from_secs(5), || store.waiting() == 1));

        store.report_state_change(ConnectionState::WaitingForNetwork);
        store.report_state_change(ConnectionState::Connecting);
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        store.report_state_change(ConnectionState::Disconnected);
        assert_eq!(reader.join().unwrap(), ProxyConfiguration::Direct);
    }

    #[test]
    fn test_reader_sees_first_terminal_state_under_churn() {
        let store = store();
        store.report_state_change(ConnectionState::Connecting);

        let reader = spawn_reader(&store);
        assert!(wait_until(Duration::from_secs(5), || store.waiting() == 1));

        // Connected is only current for an instant before churning away
        store.report_socks_port(1080);
        store.report_state_change(ConnectionState::Connected);
        store.report_state_change(ConnectionState::Connecting);
        store.report_socks_port(2080);
        store.report_state_change(ConnectionState::WaitingForNetwork);

        assert_eq!(reader.join().unwrap(), ProxyConfiguration::local_socks(1080));
        assert_eq!(store.waiting(), 0);
    }

    #[test]
    fn test_many_concurrent_readers() {
        let store = store();
        store.report_state_change(ConnectionState::Connecting);

        let readers: Vec<_> = (0..8).map(|_| spawn_reader(&store)).collect();
        assert!(wait_until(Duration::from_secs(5), || store.waiting() == 8));

        store.report_socks_port(1080);
        store.report_state_change(ConnectionState::Connected);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), ProxyConfiguration::local_socks(1080));
        }
    }

    #[test]
    fn test_cache_never_stale_after_transition() {
        let store = store();
        store.report_socks_port(1080);
        store.report_state_change(ConnectionState::Connected);
        assert_eq!(store.get_configuration(), ProxyConfiguration::local_socks(1080));

        store.report_state_change(ConnectionState::Disconnected);
        assert_eq!(store.get_configuration(), ProxyConfiguration::Direct);

        store.report_state_change(ConnectionState::Connected);
        store.report_socks_port(3080);
        assert_eq!(store.get_configuration(), ProxyConfiguration::local_socks(3080));
    }

    #[test]
    fn test_transition_notifies_observers_and_hook() {
        let store = store();
        let recorder = Recorder::new();
        store.observers.subscribe(recorder.listener());
        let resets = Arc::new(AtomicUsize::new(0));
        store.set_reset_hook({
            let resets = resets.clone();
            move |_| {
                resets.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.report_state_change(ConnectionState::Connecting);
        store.report_state_change(ConnectionState::Disconnected);
        recorder.wait_for(3, Duration::from_secs(5));

        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(store.snapshot().generation, 2);
        assert_eq!(
            recorder.states(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ]
        );

        store.clear_reset_hook();
        store.report_state_change(ConnectionState::Connecting);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observers_see_total_order_from_concurrent_reporters() {
        let store = store();
        let recorder = Recorder::new();
        store.observers.subscribe(recorder.listener());

        let reporters: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.report_state_change(ConnectionState::Connecting);
                        store.report_state_change(ConnectionState::WaitingForNetwork);
                    }
                })
            })
            .collect();
        for reporter in reporters {
            reporter.join().unwrap();
        }

        recorder.wait_for(201, Duration::from_secs(5));
        assert_eq!(recorder.states().len(), 201);
        assert_eq!(store.snapshot().generation, 200);
    }
}
