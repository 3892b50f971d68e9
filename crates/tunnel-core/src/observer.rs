//! Observer Registry
//!
//! Streams connection state changes to any number of listeners.
//!
//! # Delivery
//!
//! ```text
//!  engine thread                         dispatcher thread
//! ┌──────────────────┐   unbounded     ┌──────────────────────┐
//! │ report_state_..  │── Transition ──▶│ listeners (owned)    │──▶ listener(state)
//! │ (state lock held)│                 │ current state        │
//! └──────────────────┘                 └──────────────────────┘
//!  UI thread                 ▲
//!   subscribe / unsubscribe ─┘ (acked)
//! ```
//!
//! Transitions are enqueued inside the state store's critical section, so
//! queue order is transition order. Listener code runs only on the
//! dispatcher thread and never under the state lock: a slow listener
//! delays later deliveries, not state mutation. Subscriptions travel
//! through the same queue, which gives every listener the exact
//! transition sequence from its subscribe point on: one replay of the
//! then-current state, then every later transition, no gaps, no duplicates.

use crate::state::ConnectionState;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

/// State change callback
pub type Listener = Box<dyn FnMut(ConnectionState) + Send + 'static>;

/// Handle returned by [`ObserverRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscription({})", self.0)
    }
}

/// Messages consumed by the dispatcher thread
enum DispatchMessage {
    Transition(ConnectionState),
    Subscribe {
        id: SubscriptionId,
        listener: Listener,
        ack: Option<Sender<()>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        ack: Option<Sender<()>>,
    },
    Shutdown,
}

/// A registered listener and the last state it was handed
struct Observer {
    listener: Listener,
    last_notified: Option<ConnectionState>,
}

impl Observer {
    /// Deliver `state`, returning `false` if the listener panicked
    fn notify(&mut self, id: SubscriptionId, state: ConnectionState) -> bool {
        if self.last_notified == Some(state) {
            debug!("{} notified of repeated state {}", id, state);
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.listener)(state)));
        match result {
            Ok(()) => {
                self.last_notified = Some(state);
                true
            }
            Err(panic_info) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("{} listener panicked, removing it: {}", id, message);
                false
            }
        }
    }
}

/// Observer registry with a dedicated delivery thread
pub struct ObserverRegistry {
    tx: Sender<DispatchMessage>,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
    dispatcher_id: ThreadId,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverRegistry {
    /// Spawn the dispatcher thread; `initial` is replayed to the first subscribers
    pub fn spawn(thread_name: &str, initial: ConnectionState) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(0));

        let handle = thread::Builder::new().name(thread_name.to_string()).spawn({
            let active = active.clone();
            move || {
                debug!("Observer dispatcher started");
                run_dispatch_loop(rx, initial, active);
                debug!("Observer dispatcher stopped");
            }
        })?;

        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            active,
            dispatcher_id: handle.thread().id(),
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Register a listener; the current state is delivered before this returns
    ///
    /// Called from inside a listener, the replay is queued instead (waiting
    /// on the dispatcher from the dispatcher would never complete).
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (ack, done) = self.ack_pair();
        let sent = self.send(DispatchMessage::Subscribe {
            id,
            listener: Box::new(listener),
            ack,
        });
        if sent && wait_ack(done) {
            info!("{} registered", id);
        } else {
            warn!("{} dropped, observer dispatcher is shut down", id);
        }
        id
    }

    /// Remove a listener; unknown or already removed ids are ignored
    ///
    /// No callback for `id` starts after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let (ack, done) = self.ack_pair();
        self.send(DispatchMessage::Unsubscribe { id, ack });
        wait_ack(done);
    }

    /// Queue a transition for delivery (called by the state store under its lock)
    pub(crate) fn publish(&self, state: ConnectionState) {
        self.send(DispatchMessage::Transition(state));
    }

    /// Number of registered listeners as last seen by the dispatcher
    pub fn subscriber_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the dispatcher; queued transitions are delivered first
    pub fn shutdown(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.send(DispatchMessage::Shutdown);
        if self.on_dispatcher() {
            warn!("Observer registry shut down from a listener, not joining");
            return;
        }
        if handle.join().is_err() {
            error!("Observer dispatcher thread panicked");
        }
    }

    fn on_dispatcher(&self) -> bool {
        thread::current().id() == self.dispatcher_id
    }

    fn ack_pair(&self) -> (Option<Sender<()>>, Option<Receiver<()>>) {
        if self.on_dispatcher() {
            (None, None)
        } else {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        }
    }

    fn send(&self, msg: DispatchMessage) -> bool {
        if self.tx.send(msg).is_err() {
            debug!("Observer dispatcher gone, message dropped");
            return false;
        }
        true
    }
}

impl Drop for ObserverRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// False when the dispatcher exited without handling the message
fn wait_ack(done: Option<Receiver<()>>) -> bool {
    match done {
        Some(done) => done.recv().is_ok(),
        None => true,
    }
}

fn run_dispatch_loop(
    rx: Receiver<DispatchMessage>,
    initial: ConnectionState,
    active: Arc<AtomicUsize>,
) {
    let mut current = initial;
    let mut observers: BTreeMap<SubscriptionId, Observer> = BTreeMap::new();

    while let Ok(msg) = rx.recv() {
        match msg {
            DispatchMessage::Transition(state) => {
                current = state;
                observers.retain(|id, observer| observer.notify(*id, state));
            }
            DispatchMessage::Subscribe { id, listener, ack } => {
                let mut observer = Observer {
                    listener,
                    last_notified: None,
                };
                if observer.notify(id, current) {
                    observers.insert(id, observer);
                }
                active.store(observers.len(), Ordering::Release);
                ack_done(ack);
            }
            DispatchMessage::Unsubscribe { id, ack } => {
                if observers.remove(&id).is_some() {
                    info!("{} removed", id);
                } else {
                    debug!("{} not registered, ignoring unsubscribe", id);
                }
                active.store(observers.len(), Ordering::Release);
                ack_done(ack);
            }
            DispatchMessage::Shutdown => break,
        }
        active.store(observers.len(), Ordering::Release);
    }
    active.store(0, Ordering::Release);
}

fn ack_done(ack: Option<Sender<()>>) {
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}
