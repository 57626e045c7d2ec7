//! Fire-and-forget publish/subscribe.
//!
//! Subscriptions are reference counted per event name: the wire SUBSCRIBE
//! goes out when the local listener set becomes non-empty, the
//! UNSUBSCRIBE when it empties again. Emitting fans out to the hub and to
//! local listeners alike.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use hublink_protocol::{from_typed, to_typed, Action, Message, Topic};

use crate::connection::{MessageHandler, MessageSender};
use crate::context::ClientContext;
use crate::emitter::Emitter;
use crate::error::ErrorEvent;
use crate::listener::{Listener, ListenListener};
use crate::resubscribe::ResubscribeNotifier;

/// Event subscriber: `(event_name, data)`.
pub type EventSubscriber = dyn Fn(&str, Option<&Value>) + Send + Sync;

#[derive(Clone)]
pub struct EventHandler {
    inner: Arc<EventHandlerInner>,
}

struct EventHandlerInner {
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    emitter: Emitter<EventSubscriber>,
    listeners: Mutex<HashMap<String, Listener>>,
    subscriptions: Mutex<Vec<String>>,
    resub: Mutex<Option<ResubscribeNotifier>>,
}

impl EventHandler {
    pub(crate) fn new(ctx: Arc<ClientContext>, connection: Arc<dyn MessageSender>) -> Self {
        let inner = Arc::new(EventHandlerInner {
            ctx,
            connection,
            emitter: Emitter::new(),
            listeners: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            resub: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                for name in inner.subscriptions.lock().iter() {
                    inner
                        .connection
                        .send(Topic::Event, Action::Subscribe, &[name]);
                }
            }),
        );
        *inner.resub.lock() = Some(resub);

        EventHandler { inner }
    }

    /// Subscribe to an event; the id addresses this registration in
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, event_name: &str, listener: F) -> u64
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if !inner.emitter.has_listeners(event_name) {
            inner.subscriptions.lock().push(event_name.to_string());
            inner.ctx.acks.add(
                Topic::Event,
                Action::Subscribe,
                event_name,
                inner.ctx.config.subscription_timeout,
            );
            inner
                .connection
                .send(Topic::Event, Action::Subscribe, &[event_name]);
        }
        inner.emitter.on(event_name, Arc::new(listener))
    }

    pub fn unsubscribe(&self, event_name: &str, id: u64) {
        let inner = &self.inner;
        if !inner.emitter.off(event_name, id) {
            return;
        }
        if !inner.emitter.has_listeners(event_name) {
            inner.subscriptions.lock().retain(|name| name != event_name);
            inner.ctx.acks.add(
                Topic::Event,
                Action::Unsubscribe,
                event_name,
                inner.ctx.config.subscription_timeout,
            );
            inner
                .connection
                .send(Topic::Event, Action::Unsubscribe, &[event_name]);
        }
    }

    /// Publish to all subscribers, remote and local.
    pub fn emit(&self, event_name: &str, data: Option<&Value>) {
        let inner = &self.inner;
        match data {
            Some(value) => inner.connection.send(
                Topic::Event,
                Action::Event,
                &[event_name, &to_typed(value)],
            ),
            None => inner
                .connection
                .send(Topic::Event, Action::Event, &[event_name]),
        }
        inner.broadcast(event_name, data);
    }

    /// Offer to provide events matching `pattern`.
    pub fn listen(&self, pattern: &str, callback: Arc<dyn ListenListener>) {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock();
        if listeners.contains_key(pattern) {
            inner
                .ctx
                .errors
                .report(Some(Topic::Event), ErrorEvent::ListenerExists, pattern);
            return;
        }
        let listener = Listener::new(
            Topic::Event,
            pattern,
            callback,
            Arc::clone(&inner.ctx),
            Arc::clone(&inner.connection),
        );
        listener.start();
        listeners.insert(pattern.to_string(), listener);
    }

    pub fn unlisten(&self, pattern: &str) {
        let inner = &self.inner;
        let removed = inner.listeners.lock().remove(pattern);
        match removed {
            Some(listener) => {
                inner.ctx.acks.add(
                    Topic::Event,
                    Action::Unlisten,
                    pattern,
                    inner.ctx.config.subscription_timeout,
                );
                listener.destroy();
            }
            None => inner
                .ctx
                .errors
                .report(Some(Topic::Event), ErrorEvent::NotListening, pattern),
        }
    }
}

impl MessageHandler for EventHandler {
    fn handle(&self, message: Message) {
        let inner = &self.inner;
        let event_name = if message.action == Action::Ack {
            message.field(1)
        } else {
            message.field(0)
        };
        let Some(event_name) = event_name else {
            inner.ctx.errors.report(
                Some(Topic::Event),
                ErrorEvent::MessageParseError,
                &message.raw,
            );
            return;
        };

        if message.action == Action::Event {
            let data = match message.field(1) {
                Some(field) => match from_typed(field) {
                    Ok(typed) => typed.into_value(),
                    Err(e) => {
                        inner.ctx.errors.report(
                            Some(Topic::Event),
                            ErrorEvent::MessageParseError,
                            &e.to_string(),
                        );
                        return;
                    }
                },
                None => None,
            };
            inner.broadcast(event_name, data.as_ref());
            return;
        }

        let pattern_listener = {
            let listeners = inner.listeners.lock();
            listeners.contains_key(event_name)
        };
        if pattern_listener {
            let listeners = inner.listeners.lock();
            if let Some(listener) = listeners.get(event_name) {
                listener.on_message(&message);
            }
            return;
        }

        match message.action {
            Action::Ack => inner.ctx.acks.clear_message(&message),
            Action::Error => inner.ctx.errors.report(
                Some(Topic::Event),
                ErrorEvent::from_name(event_name),
                message.field(1).unwrap_or_default(),
            ),
            _ => inner.ctx.errors.report(
                Some(Topic::Event),
                ErrorEvent::UnsolicitedMessage,
                event_name,
            ),
        }
    }
}

impl EventHandlerInner {
    fn broadcast(&self, event_name: &str, data: Option<&Value>) {
        for listener in self.emitter.listeners(event_name) {
            listener(event_name, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::connection::testing::{wire, wire_message, MockConnection};
    use crate::error::testing::ErrorLog;
    use crate::state::ConnectionState;
    use serde_json::json;

    fn handler() -> (EventHandler, Arc<MockConnection>, Arc<ClientContext>) {
        let ctx = ClientContext::new(ClientConfig::default());
        ctx.state.set(ConnectionState::Open);
        let connection = MockConnection::new();
        let handler = EventHandler::new(Arc::clone(&ctx), connection.clone());
        (handler, connection, ctx)
    }

    fn recorded() -> (
        Arc<Mutex<Vec<(String, Option<Value>)>>>,
        impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let listener = move |name: &str, data: Option<&Value>| {
            seen2.lock().push((name.to_string(), data.cloned()));
        };
        (seen, listener)
    }

    #[tokio::test]
    async fn test_first_subscribe_sends_wire_subscribe() {
        let (handler, connection, _ctx) = handler();
        let (_, listener) = recorded();
        handler.subscribe("weather", listener);
        assert_eq!(connection.sent(), vec![wire("E|S|weather+")]);

        // A second local listener multiplexes, no further wire traffic.
        let (_, listener) = recorded();
        handler.subscribe("weather", listener);
        assert_eq!(connection.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_sends_wire_unsubscribe() {
        let (handler, connection, _ctx) = handler();
        let (_, l1) = recorded();
        let (_, l2) = recorded();
        let id1 = handler.subscribe("weather", l1);
        let id2 = handler.subscribe("weather", l2);

        handler.unsubscribe("weather", id1);
        assert_eq!(connection.sent_count(), 1);

        handler.unsubscribe("weather", id2);
        assert_eq!(connection.last_sent(), Some(wire("E|US|weather+")));
    }

    #[tokio::test]
    async fn test_emit_reaches_wire_and_local_listeners() {
        let (handler, connection, _ctx) = handler();
        let (seen, listener) = recorded();
        handler.subscribe("news", listener);

        handler.emit("news", Some(&json!("headline")));
        assert_eq!(connection.last_sent(), Some(wire("E|EVT|news|Sheadline+")));
        assert_eq!(
            *seen.lock(),
            vec![("news".to_string(), Some(json!("headline")))]
        );
    }

    #[tokio::test]
    async fn test_inbound_event_broadcast() {
        let (handler, _connection, _ctx) = handler();
        let (seen, listener) = recorded();
        handler.subscribe("news", listener);

        handler.handle(wire_message("E|EVT|news|N7"));
        assert_eq!(*seen.lock(), vec![("news".to_string(), Some(json!(7)))]);
    }

    #[tokio::test]
    async fn test_inbound_event_without_payload() {
        let (handler, _connection, _ctx) = handler();
        let (seen, listener) = recorded();
        handler.subscribe("tick", listener);

        handler.handle(wire_message("E|EVT|tick"));
        assert_eq!(*seen.lock(), vec![("tick".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_subscribe_ack_clears_deadline() {
        let (handler, _connection, ctx) = handler();
        let (_, listener) = recorded();
        handler.subscribe("weather", listener);
        assert_eq!(ctx.acks.len(), 1);

        handler.handle(wire_message("E|A|S|weather"));
        assert_eq!(ctx.acks.len(), 0);
    }

    #[tokio::test]
    async fn test_server_error_reported() {
        let (handler, _connection, ctx) = handler();
        let log = ErrorLog::install(&ctx.errors);
        handler.handle(wire_message("E|E|MESSAGE_DENIED|weather"));
        assert!(log.contains(&ErrorEvent::MessageDenied, "weather"));
    }

    #[tokio::test]
    async fn test_unsolicited_message_reported() {
        let (handler, _connection, ctx) = handler();
        let log = ErrorLog::install(&ctx.errors);
        handler.handle(wire_message("E|EVT|unknownEvent|N1"));
        // broadcast to nobody is fine, not an error
        assert_eq!(log.len(), 0);

        handler.handle(wire_message("E|SF|pattern|subscription"));
        assert!(log.contains(&ErrorEvent::UnsolicitedMessage, "pattern"));
    }

    #[tokio::test]
    async fn test_resubscribe_replays_subscriptions() {
        let (handler, connection, ctx) = handler();
        let (_, l1) = recorded();
        let (_, l2) = recorded();
        handler.subscribe("a", l1);
        handler.subscribe("b", l2);
        assert_eq!(connection.sent_count(), 2);

        ctx.state.set(ConnectionState::Reconnecting);
        ctx.state.set(ConnectionState::Open);
        assert_eq!(connection.sent_count(), 4);
        let sent = connection.sent();
        assert!(sent.contains(&wire("E|S|a+")));
        assert!(sent[2..].contains(&wire("E|S|b+")));
    }

    struct AcceptAll;

    impl ListenListener for AcceptAll {
        fn on_subscription_for_pattern_added(&self, _subscription: &str) -> bool {
            true
        }

        fn on_subscription_for_pattern_removed(&self, _subscription: &str) {}
    }

    #[tokio::test]
    async fn test_listen_routes_pattern_messages() {
        let (handler, connection, _ctx) = handler();
        handler.listen("weather/.*", Arc::new(AcceptAll));
        assert_eq!(connection.last_sent(), Some(wire("E|L|weather/.*+")));

        handler.handle(wire_message("E|SF|weather/.*|weather/berlin"));
        assert_eq!(
            connection.last_sent(),
            Some(wire("E|LA|weather/.*|weather/berlin+"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_listen_reports_listener_exists() {
        let (handler, _connection, ctx) = handler();
        let log = ErrorLog::install(&ctx.errors);
        handler.listen("weather/.*", Arc::new(AcceptAll));
        handler.listen("weather/.*", Arc::new(AcceptAll));
        assert!(log.contains(&ErrorEvent::ListenerExists, "weather/.*"));
    }

    #[tokio::test]
    async fn test_unlisten_unknown_pattern_reports_not_listening() {
        let (handler, _connection, ctx) = handler();
        let log = ErrorLog::install(&ctx.errors);
        handler.unlisten("weather/.*");
        assert!(log.contains(&ErrorEvent::NotListening, "weather/.*"));
    }

    #[tokio::test]
    async fn test_unlisten_sends_unlisten() {
        let (handler, connection, _ctx) = handler();
        handler.listen("weather/.*", Arc::new(AcceptAll));
        handler.unlisten("weather/.*");
        assert_eq!(connection.last_sent(), Some(wire("E|UL|weather/.*+")));
    }
}
