//! Connection state publication.
//!
//! Two audiences need state changes: tasks that *wait* for a particular
//! state (ack timers gate on OPEN) and components that must observe every
//! transition (the resubscribe coordinator, the user-facing callback).
//! The bus serves the first through a `watch` channel and the second
//! through a synchronously invoked listener list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Lifecycle states of the hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    Challenging,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Reconnecting,
    Error,
}

/// Network reachability reported by the application (e.g. from a mobile
/// platform's connectivity callbacks). While `Disconnected`, reconnect
/// timers stay unarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalConnectivityState {
    Connected,
    Disconnected,
}

pub(crate) type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

pub(crate) struct StateBus {
    tx: watch::Sender<ConnectionState>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_id: AtomicU64,
}

impl StateBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Closed);
        StateBus {
            tx,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publish a new state and notify listeners in registration order.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
        // Snapshot under the lock, invoke outside it: listeners may
        // register or remove listeners from within the callback.
        let snapshot: Vec<StateListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(state);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn add_listener(&self, listener: StateListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }
}
