//! Presence: who else is connected.
//!
//! Subscribing yields login/logout notifications for peer clients;
//! `get_all` queries the currently connected usernames. One wire
//! subscription serves any number of local listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use hublink_protocol::{Action, Message, Topic};

use crate::connection::{MessageHandler, MessageSender};
use crate::context::ClientContext;
use crate::error::{ClientError, ErrorEvent};
use crate::notifier::{await_response, SingleNotifier};
use crate::resubscribe::ResubscribeNotifier;

/// Peer login/logout notifications.
pub trait PresenceListener: Send + Sync {
    fn on_client_login(&self, username: &str);
    fn on_client_logout(&self, username: &str);
}

#[derive(Clone)]
pub struct PresenceHandler {
    inner: Arc<PresenceHandlerInner>,
}

struct PresenceHandlerInner {
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    listeners: Mutex<Vec<(u64, Arc<dyn PresenceListener>)>>,
    notifier: SingleNotifier,
    resub: Mutex<Option<ResubscribeNotifier>>,
    next_id: AtomicU64,
}

impl PresenceHandler {
    pub(crate) fn new(ctx: Arc<ClientContext>, connection: Arc<dyn MessageSender>) -> Self {
        let notifier = SingleNotifier::new(
            Arc::clone(&ctx),
            Arc::clone(&connection),
            Topic::Presence,
            Action::Query,
            ctx.config.subscription_timeout,
        );
        let inner = Arc::new(PresenceHandlerInner {
            ctx,
            connection,
            listeners: Mutex::new(Vec::new()),
            notifier,
            resub: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.listeners.lock().is_empty() {
                    inner.connection.send(
                        Topic::Presence,
                        Action::Subscribe,
                        &[Action::Subscribe.as_str()],
                    );
                }
            }),
        );
        *inner.resub.lock() = Some(resub);

        PresenceHandler { inner }
    }

    /// The usernames of all currently connected peer clients.
    pub async fn get_all(&self) -> Result<Vec<String>, ClientError> {
        let rx = self.inner.notifier.request(Action::Query.as_str());
        let value = await_response(rx).await?;
        let names = match value {
            Some(Value::Array(entries)) => entries
                .into_iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Ok(names)
    }

    /// Subscribe to peer logins/logouts; returns the registration id.
    pub fn subscribe(&self, listener: Arc<dyn PresenceListener>) -> u64 {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock();
        if listeners.is_empty() {
            inner.ctx.acks.add(
                Topic::Presence,
                Action::Subscribe,
                Action::Subscribe.as_str(),
                inner.ctx.config.subscription_timeout,
            );
            inner.connection.send(
                Topic::Presence,
                Action::Subscribe,
                &[Action::Subscribe.as_str()],
            );
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        if before > 0 && listeners.is_empty() {
            inner.ctx.acks.add(
                Topic::Presence,
                Action::Unsubscribe,
                Action::Unsubscribe.as_str(),
                inner.ctx.config.subscription_timeout,
            );
            inner.connection.send(
                Topic::Presence,
                Action::Unsubscribe,
                &[Action::Unsubscribe.as_str()],
            );
        }
    }

    pub(crate) fn shutdown(&self) {
        self.inner.notifier.destroy();
    }
}

impl MessageHandler for PresenceHandler {
    fn handle(&self, message: Message) {
        let inner = &self.inner;

        if message.action == Action::Error
            && message.field(0) == Some(ErrorEvent::MessageDenied.as_str())
        {
            // The denied request will never be answered, so disarm
            // whatever deadline it left behind.
            inner
                .ctx
                .acks
                .clear(Topic::Presence, Action::Subscribe, Action::Subscribe.as_str());
            inner.ctx.acks.clear(
                Topic::Presence,
                Action::Unsubscribe,
                Action::Unsubscribe.as_str(),
            );
            inner
                .ctx
                .acks
                .clear(Topic::Presence, Action::Query, Action::Query.as_str());
            inner.ctx.errors.report(
                Some(Topic::Presence),
                ErrorEvent::MessageDenied,
                message.field(1).unwrap_or_default(),
            );
            return;
        }

        match message.action {
            Action::Ack => inner.ctx.acks.clear_message(&message),
            Action::PresenceJoin => {
                if let Some(username) = message.field(0) {
                    inner.broadcast(true, username);
                }
            }
            Action::PresenceLeave => {
                if let Some(username) = message.field(0) {
                    inner.broadcast(false, username);
                }
            }
            Action::Query => {
                let names = Value::Array(
                    message
                        .data
                        .iter()
                        .map(|name| Value::String(name.clone()))
                        .collect(),
                );
                inner
                    .notifier
                    .receive(Action::Query.as_str(), Ok(Some(names)));
            }
            _ => inner.ctx.errors.report(
                Some(Topic::Presence),
                ErrorEvent::UnsolicitedMessage,
                message.action.name(),
            ),
        }
    }
}

impl PresenceHandlerInner {
    fn broadcast(&self, login: bool, username: &str) {
        let listeners: Vec<Arc<dyn PresenceListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if login {
                listener.on_client_login(username);
            } else {
                listener.on_client_logout(username);
            }
        }
    }
}
