//! A thread-safe listener registry keyed by event name.
//!
//! Listeners are stored behind `Arc` and addressed by a registration id,
//! so removal does not require the listener type to be comparable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub(crate) struct Emitter<L: ?Sized> {
    listeners: Mutex<HashMap<String, Vec<(u64, Arc<L>)>>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Emitter<L> {
    pub fn new() -> Self {
        Emitter {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on(&self, event: &str, listener: Arc<L>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one registration. The event key is dropped with its last
    /// listener so `events()` only reports live subscriptions.
    pub fn off(&self, event: &str, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(lid, _)| *lid != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    pub fn listeners(&self, event: &str) -> Vec<Arc<L>> {
        self.listeners
            .lock()
            .get(event)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listeners
            .lock()
            .get(event)
            .is_some_and(|entries| !entries.is_empty())
    }

    pub fn events(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }
}
