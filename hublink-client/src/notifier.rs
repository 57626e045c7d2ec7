//! One-shot request multiplexing.
//!
//! Snapshot, has, presence queries and record writes-with-ack all follow
//! the same shape: send a request, wait for exactly one response keyed by
//! a name (or version), time out otherwise. The notifier coalesces
//! concurrent requests for the same key into one wire message, fans the
//! response out to every waiter, and replays pending simple requests
//! after a reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use hublink_protocol::{Action, Topic};

use crate::connection::MessageSender;
use crate::context::ClientContext;
use crate::error::{ClientError, ErrorEvent};
use crate::resubscribe::ResubscribeNotifier;

pub(crate) type NotifyResult = Result<Option<Value>, ClientError>;

enum PendingKind {
    /// Sent as `topic|action|key`; replayed on reconnect.
    Simple,
    /// Sent with a caller-supplied action and payload; not replayed.
    Custom,
}

struct PendingEntry {
    kind: PendingKind,
    waiters: Vec<oneshot::Sender<NotifyResult>>,
}

pub(crate) struct SingleNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    topic: Topic,
    action: Action,
    timeout: Duration,
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    requests: Mutex<HashMap<String, PendingEntry>>,
    resub: Mutex<Option<ResubscribeNotifier>>,
}

impl SingleNotifier {
    pub fn new(
        ctx: Arc<ClientContext>,
        connection: Arc<dyn MessageSender>,
        topic: Topic,
        action: Action,
        timeout: Duration,
    ) -> Self {
        let inner = Arc::new(NotifierInner {
            topic,
            action,
            timeout,
            ctx,
            connection,
            requests: Mutex::new(HashMap::new()),
            resub: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.resend_pending();
                }
            }),
        );
        *inner.resub.lock() = Some(resub);

        SingleNotifier { inner }
    }

    pub fn has_request(&self, name: &str) -> bool {
        self.inner.requests.lock().contains_key(name)
    }

    /// Request `name`; concurrent requests for the same key share one
    /// wire message. The receiver resolves with the response, an error,
    /// or the armed response timeout.
    pub fn request(&self, name: &str) -> oneshot::Receiver<NotifyResult> {
        let (tx, rx) = oneshot::channel();
        {
            let mut requests = self.inner.requests.lock();
            let entry = requests.entry(name.to_string()).or_insert_with(|| {
                self.inner
                    .connection
                    .send(self.inner.topic, self.inner.action, &[name]);
                PendingEntry {
                    kind: PendingKind::Simple,
                    waiters: Vec::new(),
                }
            });
            entry.waiters.push(tx);
        }
        self.arm_deadline(name);
        rx
    }

    /// Request with a caller-built action and payload, keyed by `key`.
    pub fn request_with(
        &self,
        key: &str,
        action: Action,
        data: &[&str],
    ) -> oneshot::Receiver<NotifyResult> {
        let (tx, rx) = oneshot::channel();
        {
            let mut requests = self.inner.requests.lock();
            let entry = requests.entry(key.to_string()).or_insert_with(|| {
                self.inner.connection.send(self.inner.topic, action, data);
                PendingEntry {
                    kind: PendingKind::Custom,
                    waiters: Vec::new(),
                }
            });
            entry.waiters.push(tx);
        }
        self.arm_deadline(key);
        rx
    }

    fn arm_deadline(&self, name: &str) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.ctx.acks.add_with_listener(
            self.inner.topic,
            self.inner.action,
            name,
            ErrorEvent::ResponseTimeout,
            Arc::new(move |_topic, _action, _event, name| {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(
                        name,
                        Err(ClientError::Timeout(format!(
                            "Response for {name} timed out"
                        ))),
                    );
                }
            }),
            self.inner.timeout,
        );
    }

    /// Resolve a key: every waiter gets the result, the deadline is
    /// cleared, the entry removed. Returns whether a request was pending.
    pub fn receive(&self, name: &str, result: NotifyResult) -> bool {
        self.inner.receive(name, result)
    }

    /// Batch form: one message resolving several keys at once, all with
    /// the same outcome (used by write acknowledgements).
    pub fn receive_batch(&self, keys: &[String], error: Option<ClientError>) {
        for key in keys {
            let result = match &error {
                Some(e) => Err(e.clone()),
                None => Ok(None),
            };
            self.inner.receive(key, result);
        }
    }

    /// Drop every pending request; waiters resolve with `IsClosed`.
    pub fn destroy(&self) {
        self.inner.requests.lock().clear();
        self.inner.resub.lock().take();
    }
}

impl NotifierInner {
    fn receive(&self, name: &str, result: NotifyResult) -> bool {
        let Some(entry) = self.requests.lock().remove(name) else {
            return false;
        };
        self.ctx.acks.clear(self.topic, self.action, name);
        for waiter in entry.waiters {
            let _ = waiter.send(result.clone());
        }
        true
    }

    fn resend_pending(&self) {
        let requests = self.requests.lock();
        for (name, entry) in requests.iter() {
            if matches!(entry.kind, PendingKind::Simple) {
                self.connection.send(self.topic, self.action, &[name]);
            }
        }
    }
}

/// Await a notifier receiver, mapping a dropped sender to `IsClosed`.
pub(crate) async fn await_response(
    rx: oneshot::Receiver<NotifyResult>,
) -> NotifyResult {
    rx.await.unwrap_or(Err(ClientError::IsClosed))
}
