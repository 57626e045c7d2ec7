//! The acknowledgement timeout registry.
//!
//! Every outgoing request arms an entry keyed `(topic, action, name)`.
//! The entry is cleared by the matching ack (or response); if the
//! deadline passes first, the registered listener runs or a runtime
//! error is reported. Arming an already-armed key is a no-op, so at most
//! one entry per key is ever live.
//!
//! Deadlines never fire while the connection is not OPEN: each entry's
//! timer task sleeps the timeout and then, if need be, waits on the
//! state channel: an entry that became overdue during a disconnect
//! fires the moment the connection re-opens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use hublink_protocol::{Action, Message, Topic};

use crate::error::{ErrorEvent, ErrorSink};
use crate::state::{ConnectionState, StateBus};

/// Invoked instead of the error report when the arming component wants
/// the timeout routed back to itself.
pub(crate) type TimeoutListener =
    Arc<dyn Fn(Topic, Action, &ErrorEvent, &str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AckKey {
    topic: Topic,
    action: Action,
    name: String,
}

struct AckEntry {
    token: u64,
    event: ErrorEvent,
    listener: Option<TimeoutListener>,
    timer: JoinHandle<()>,
}

pub(crate) struct AckRegistry {
    inner: Arc<AckInner>,
}

struct AckInner {
    entries: Mutex<HashMap<AckKey, AckEntry>>,
    state: Arc<StateBus>,
    errors: Arc<ErrorSink>,
    next_token: AtomicU64,
}

impl Clone for AckRegistry {
    fn clone(&self) -> Self {
        AckRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl AckRegistry {
    pub fn new(state: Arc<StateBus>, errors: Arc<ErrorSink>) -> Self {
        AckRegistry {
            inner: Arc::new(AckInner {
                entries: Mutex::new(HashMap::new()),
                state,
                errors,
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Arm an ack deadline that reports `ACK_TIMEOUT` on expiry.
    pub fn add(&self, topic: Topic, action: Action, name: &str, timeout: Duration) {
        self.add_entry(topic, action, name, ErrorEvent::AckTimeout, None, timeout);
    }

    /// Arm a deadline with an explicit timeout event.
    pub fn add_for_event(
        &self,
        topic: Topic,
        action: Action,
        name: &str,
        event: ErrorEvent,
        timeout: Duration,
    ) {
        self.add_entry(topic, action, name, event, None, timeout);
    }

    /// Arm a deadline whose expiry is routed to `listener` instead of the
    /// runtime error sink.
    pub fn add_with_listener(
        &self,
        topic: Topic,
        action: Action,
        name: &str,
        event: ErrorEvent,
        listener: TimeoutListener,
        timeout: Duration,
    ) {
        self.add_entry(topic, action, name, event, Some(listener), timeout);
    }

    fn add_entry(
        &self,
        topic: Topic,
        action: Action,
        name: &str,
        event: ErrorEvent,
        listener: Option<TimeoutListener>,
        timeout: Duration,
    ) {
        let key = AckKey {
            topic,
            action,
            name: name.to_string(),
        };
        let mut entries = self.inner.entries.lock();
        if entries.contains_key(&key) {
            return;
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            AckInner::fire(weak, task_key, token).await;
        });

        entries.insert(
            key,
            AckEntry {
                token,
                event,
                listener,
                timer,
            },
        );
    }

    /// Clear an armed entry; returns whether one existed.
    pub fn clear(&self, topic: Topic, action: Action, name: &str) -> bool {
        let key = AckKey {
            topic,
            action,
            name: name.to_string(),
        };
        match self.inner.entries.lock().remove(&key) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Clear the entry addressed by an inbound message. For ACK messages
    /// the key is `(topic, data[0], data[1])`, otherwise
    /// `(topic, action, data[0])`. A miss means the server acknowledged
    /// something we never asked for and is reported as
    /// `UNSOLICITED_MESSAGE` with the raw message.
    pub fn clear_message(&self, message: &Message) {
        let key = if message.action == Action::Ack {
            let action = message
                .field(0)
                .and_then(|code| code.parse::<Action>().ok());
            match (action, message.field(1)) {
                (Some(action), Some(name)) => Some((message.topic, action, name)),
                _ => None,
            }
        } else {
            message
                .field(0)
                .map(|name| (message.topic, message.action, name))
        };

        let cleared = match key {
            Some((topic, action, name)) => self.clear(topic, action, name),
            None => false,
        };
        if !cleared {
            self.inner.errors.report(
                Some(message.topic),
                ErrorEvent::UnsolicitedMessage,
                &message.raw,
            );
        }
    }

    /// Cancel every armed deadline. Used on deliberate close.
    pub fn clear_all(&self) {
        let mut entries = self.inner.entries.lock();
        for (_, entry) in entries.drain() {
            entry.timer.abort();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

impl AckInner {
    async fn fire(weak: Weak<AckInner>, key: AckKey, token: u64) {
        // Gate on OPEN without holding anything: the registry may be
        // dropped or the entry cleared while we wait. Subscribing before
        // the check keeps a transition between check and wait from being
        // missed.
        loop {
            let Some(inner) = weak.upgrade() else { return };
            let mut rx = inner.state.subscribe();
            if *rx.borrow() == ConnectionState::Open {
                break;
            }
            drop(inner);
            if rx.changed().await.is_err() {
                return;
            }
        }

        let Some(inner) = weak.upgrade() else { return };
        let entry = {
            let mut entries = inner.entries.lock();
            match entries.get(&key) {
                Some(entry) if entry.token == token => entries.remove(&key),
                _ => None,
            }
        };
        let Some(entry) = entry else { return };

        let message = match entry.event {
            ErrorEvent::AckTimeout => format!(
                "No ACK message received in time for {} {}",
                key.action.name(),
                key.name
            ),
            _ => format!(
                "No message received in time for {} {}",
                key.action.name(),
                key.name
            ),
        };
        match entry.listener {
            Some(listener) => listener(key.topic, key.action, &entry.event, &key.name),
            None => inner
                .errors
                .report(Some(key.topic), entry.event, &message),
        }
    }
}
