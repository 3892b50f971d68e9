//! Shared test fixtures: a recording listener and a scripted fake engine.

use crate::engine::{EngineFactory, TunnelEngine, TunnelHost};
use crate::state::ConnectionState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Collects every state a listener is handed
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<(Mutex<Vec<ConnectionState>>, Condvar)>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> Box<dyn FnMut(ConnectionState) + Send> {
        let inner = self.inner.clone();
        Box::new(move |state| {
            inner.0.lock().unwrap().push(state);
            inner.1.notify_all();
        })
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.inner.0.lock().unwrap().clone()
    }

    /// Block until at least `count` states arrived
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let guard = self.inner.0.lock().unwrap();
        let (guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |states| states.len() < count)
            .unwrap();
        guard.len() >= count
    }
}

/// Engine callback, as a script step
#[derive(Debug, Clone, Copy)]
pub enum Step {
    State(ConnectionState),
    HttpPort(u16),
    SocksPort(u16),
}

/// What every engine built by a [`FakeFactory`] does
#[derive(Clone)]
pub struct FakeFactory {
    pub start_ok: bool,
    pub script: Vec<Step>,
    pub report_on_stop: bool,
    /// How long `start` blocks before answering
    pub start_delay: Duration,
    pub created: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub payloads: Arc<Mutex<Vec<Option<String>>>>,
    pub hosts: Arc<Mutex<Vec<Arc<dyn TunnelHost>>>>,
}

impl FakeFactory {
    pub fn new(start_ok: bool, script: Vec<Step>) -> Self {
        Self {
            start_ok,
            script,
            report_on_stop: true,
            start_delay: Duration::ZERO,
            created: Arc::default(),
            stopped: Arc::default(),
            payloads: Arc::default(),
            hosts: Arc::default(),
        }
    }

    /// Connecting, ports, Connected
    pub fn connecting_then_connected(socks_port: u16) -> Self {
        Self::new(
            true,
            vec![
                Step::State(ConnectionState::Connecting),
                Step::HttpPort(8080),
                Step::SocksPort(socks_port),
                Step::State(ConnectionState::Connected),
            ],
        )
    }
}

impl EngineFactory for FakeFactory {
    fn create(&self, host: Arc<dyn TunnelHost>) -> Box<dyn TunnelEngine> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.hosts.lock().unwrap().push(host.clone());
        Box::new(FakeEngine {
            host,
            factory: self.clone(),
            state: ConnectionState::Disconnected,
            worker: None,
        })
    }
}

struct FakeEngine {
    host: Arc<dyn TunnelHost>,
    factory: FakeFactory,
    state: ConnectionState,
    worker: Option<thread::JoinHandle<ConnectionState>>,
}

impl TunnelEngine for FakeEngine {
    fn start(&mut self) -> bool {
        self.factory
            .payloads
            .lock()
            .unwrap()
            .push(self.host.config_payload());
        thread::sleep(self.factory.start_delay);
        if !self.factory.start_ok {
            return false;
        }

        let host = self.host.clone();
        let script = self.factory.script.clone();
        let mut state = self.state;
        self.worker = Some(thread::spawn(move || {
            for step in script {
                match step {
                    Step::State(new) => {
                        host.on_state_changed(state, new);
                        state = new;
                    }
                    Step::HttpPort(port) => host.on_http_proxy_port(port),
                    Step::SocksPort(port) => host.on_socks_proxy_port(port),
                }
            }
            state
        }));
        true
    }

    fn stop(&mut self) {
        self.factory.stopped.fetch_add(1, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            self.state = worker.join().unwrap();
        }
        if self.factory.report_on_stop && self.state != ConnectionState::Disconnected {
            self.host
                .on_state_changed(self.state, ConnectionState::Disconnected);
            self.state = ConnectionState::Disconnected;
        }
    }
}
