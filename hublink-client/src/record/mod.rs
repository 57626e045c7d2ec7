//! The record domain: versioned documents, lists and the proxy record.
//!
//! [`RecordHandler`] owns the name→record cache and demultiplexes every
//! RECORD message to the right record; snapshot and has queries that need
//! no subscription run through single-notifiers instead.

pub mod anonymous;
pub mod list;
pub mod merge;
pub(crate) mod path;
#[allow(clippy::module_inception)]
pub mod record;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use hublink_protocol::{from_typed, Action, Message, Topic};

use crate::connection::{MessageHandler, MessageSender};
use crate::context::ClientContext;
use crate::error::{ClientError, ErrorEvent};
use crate::listener::{ListenListener, Listener};
use crate::notifier::{await_response, SingleNotifier};

use anonymous::AnonymousRecord;
use list::List;
use record::Record;

#[derive(Clone)]
pub struct RecordHandler {
    inner: Arc<RecordHandlerInner>,
}

struct RecordHandlerInner {
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    records: Mutex<HashMap<String, Record>>,
    lists: Mutex<HashMap<String, List>>,
    listeners: Mutex<HashMap<String, Listener>>,
    has_registry: SingleNotifier,
    snapshot_registry: SingleNotifier,
}

impl RecordHandler {
    pub(crate) fn new(ctx: Arc<ClientContext>, connection: Arc<dyn MessageSender>) -> Self {
        let has_registry = SingleNotifier::new(
            Arc::clone(&ctx),
            Arc::clone(&connection),
            Topic::Record,
            Action::Has,
            ctx.config.record_read_timeout,
        );
        let snapshot_registry = SingleNotifier::new(
            Arc::clone(&ctx),
            Arc::clone(&connection),
            Topic::Record,
            Action::Snapshot,
            ctx.config.record_read_timeout,
        );
        RecordHandler {
            inner: Arc::new(RecordHandlerInner {
                ctx,
                connection,
                records: Mutex::new(HashMap::new()),
                lists: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                has_registry,
                snapshot_registry,
            }),
        }
    }

    /// Get (or lazily create) the record `name`. Every call takes a
    /// reference that must be released with [`Record::discard`].
    pub fn get_record(&self, name: &str) -> Record {
        let inner = &self.inner;
        let record = {
            let mut records = inner.records.lock();
            if let Some(record) = records.get(name) {
                record.increment_usage();
                return record.clone();
            }
            let record = Record::new(name, Arc::clone(&inner.ctx), Arc::clone(&inner.connection));
            let weak: Weak<RecordHandlerInner> = Arc::downgrade(inner);
            record.add_destroy_pending_listener(move |record_name| {
                if let Some(inner) = weak.upgrade() {
                    inner.records.lock().remove(record_name);
                    inner.lists.lock().remove(record_name);
                }
            });
            records.insert(name.to_string(), record.clone());
            record
        };
        record.start();
        record
    }

    /// Get the record `name` as a list.
    pub fn get_list(&self, name: &str) -> List {
        let record = self.get_record(name);
        let mut lists = self.inner.lists.lock();
        lists
            .entry(name.to_string())
            .or_insert_with(|| List::new(record))
            .clone()
    }

    /// A proxy record that can be pointed at different names over time.
    pub fn get_anonymous_record(&self) -> AnonymousRecord {
        AnonymousRecord::new(self.clone())
    }

    /// One-shot read of `name` without subscribing. A loaded local copy
    /// answers immediately; otherwise the hub is queried.
    pub async fn snapshot(&self, name: &str) -> Result<Value, ClientError> {
        let cached = {
            let records = self.inner.records.lock();
            records.get(name).filter(|r| r.is_ready()).map(Record::get)
        };
        if let Some(data) = cached {
            return Ok(data);
        }
        let rx = self.inner.snapshot_registry.request(name);
        let value = await_response(rx).await?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Whether `name` exists on the hub (or is already loaded locally).
    pub async fn has(&self, name: &str) -> Result<bool, ClientError> {
        let cached = {
            let records = self.inner.records.lock();
            records.get(name).map(|r| r.is_ready()).unwrap_or(false)
        };
        if cached {
            return Ok(true);
        }
        let rx = self.inner.has_registry.request(name);
        let value = await_response(rx).await?;
        Ok(matches!(value, Some(Value::Bool(true))))
    }

    /// Offer to provide records matching `pattern`.
    pub fn listen(&self, pattern: &str, callback: Arc<dyn ListenListener>) {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock();
        if listeners.contains_key(pattern) {
            inner
                .ctx
                .errors
                .report(Some(Topic::Record), ErrorEvent::ListenerExists, pattern);
            return;
        }
        let listener = Listener::new(
            Topic::Record,
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
                    Topic::Record,
                    Action::Unlisten,
                    pattern,
                    inner.ctx.config.subscription_timeout,
                );
                listener.destroy();
            }
            None => inner
                .ctx
                .errors
                .report(Some(Topic::Record), ErrorEvent::NotListening, pattern),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.inner.has_registry.destroy();
        self.inner.snapshot_registry.destroy();
        for record in self.inner.records.lock().values() {
            record.abort_pending();
        }
    }

    fn record_for(&self, name: &str) -> Option<Record> {
        self.inner.records.lock().get(name).cloned()
    }
}

impl MessageHandler for RecordHandler {
    fn handle(&self, message: Message) {
        let inner = &self.inner;

        if message.action == Action::Error {
            match message.field(0) {
                Some(code) if code == Action::Snapshot.as_str() => {
                    if let Some(name) = message.field(1) {
                        let error = message.field(2).unwrap_or("SNAPSHOT_FAILED");
                        inner.snapshot_registry.receive(
                            name,
                            Err(ClientError::Server {
                                event: ErrorEvent::from_name(error),
                                message: name.to_string(),
                            }),
                        );
                    }
                    return;
                }
                Some(code) if code == Action::Has.as_str() => {
                    if let Some(name) = message.field(1) {
                        let error = message.field(2).unwrap_or("HAS_FAILED");
                        inner.has_registry.receive(
                            name,
                            Err(ClientError::Server {
                                event: ErrorEvent::from_name(error),
                                message: name.to_string(),
                            }),
                        );
                    }
                    return;
                }
                Some(code)
                    if code == ErrorEvent::VersionExists.as_str()
                        || code == ErrorEvent::MessageDenied.as_str() =>
                {
                    // Routed to the record below.
                }
                Some(code) => {
                    inner.ctx.errors.report(
                        Some(Topic::Record),
                        ErrorEvent::from_name(code),
                        message.field(1).unwrap_or_default(),
                    );
                    return;
                }
                None => return,
            }
        }

        let name = match message.action {
            Action::Ack => message.field(1),
            Action::Error => message.field(1),
            _ => message.field(0),
        };
        let Some(name) = name else {
            inner.ctx.errors.report(
                Some(Topic::Record),
                ErrorEvent::MessageParseError,
                &message.raw,
            );
            return;
        };

        // Pattern listeners share the topic; their messages carry the
        // pattern where records carry their name.
        {
            let listeners = inner.listeners.lock();
            if let Some(listener) = listeners.get(name) {
                listener.on_message(&message);
                return;
            }
        }

        if let Some(record) = self.record_for(name) {
            record.on_message(&message);
            return;
        }

        match message.action {
            Action::Read if inner.snapshot_registry.has_request(name) => {
                let data = message
                    .field(2)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
                inner.snapshot_registry.receive(name, Ok(data));
            }
            Action::Has if inner.has_registry.has_request(name) => {
                let value = message
                    .field(1)
                    .and_then(|field| from_typed(field).ok())
                    .and_then(|typed| typed.into_value());
                inner.has_registry.receive(name, Ok(value));
            }
            Action::Ack => inner.ctx.acks.clear_message(&message),
            Action::SubscriptionHasProvider => {}
            _ => inner.ctx.errors.report(
                Some(Topic::Record),
                ErrorEvent::UnsolicitedMessage,
                name,
            ),
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
    use std::time::Duration;
    use tokio::time::sleep;

    fn handler() -> (RecordHandler, Arc<MockConnection>, Arc<ClientContext>) {
        let mut config = ClientConfig::default();
        config.subscription_timeout = Duration::from_millis(50);
        config.record_read_ack_timeout = Duration::from_millis(50);
        config.record_read_timeout = Duration::from_millis(100);
        let ctx = ClientContext::new(config);
        ctx.state.set(ConnectionState::Open);
        let connection = MockConnection::new();
        let handler = RecordHandler::new(Arc::clone(&ctx), connection.clone());
        (handler, connection, ctx)
    }

    #[tokio::test]
    async fn test_get_record_sends_createorread_once() {
        let (handler, connection, _ctx) = handler();
        let first = handler.get_record("recordA");
        let second = handler.get_record("recordA");

        assert_eq!(connection.sent(), vec![wire("R|CR|recordA+")]);
        assert_eq!(first.name(), second.name());
    }

    #[tokio::test]
    async fn test_messages_route_to_the_record() {
        let (handler, _connection, _ctx) = handler();
        let record = handler.get_record("recordA");

        handler.handle(wire_message("R|A|S|recordA"));
        handler.handle(wire_message("R|R|recordA|0|{\"name\":\"sam\"}"));
        assert!(record.is_ready());
        assert_eq!(record.get(), json!({"name": "sam"}));
    }

    #[tokio::test]
    async fn test_two_references_one_unsubscribe() {
        let (handler, connection, _ctx) = handler();
        let first = handler.get_record("x");
        let second = handler.get_record("x");
        handler.handle(wire_message("R|A|S|x"));
        handler.handle(wire_message("R|R|x|0|{}"));

        first.discard().unwrap();
        assert_ne!(connection.last_sent(), Some(wire("R|US|x+")));

        second.discard().unwrap();
        assert_eq!(connection.last_sent(), Some(wire("R|US|x+")));
    }

    #[tokio::test]
    async fn test_discarded_record_leaves_the_cache() {
        let (handler, connection, _ctx) = handler();
        let record = handler.get_record("x");
        handler.handle(wire_message("R|A|S|x"));
        handler.handle(wire_message("R|R|x|0|{}"));
        record.discard().unwrap();

        // The next acquisition is a fresh record and a fresh read.
        let again = handler.get_record("x");
        assert!(!again.is_destroyed());
        assert_eq!(
            connection
                .sent()
                .iter()
                .filter(|f| **f == wire("R|CR|x+"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_loaded_record_answers_locally() {
        let (handler, connection, _ctx) = handler();
        let _record = handler.get_record("recordA");
        handler.handle(wire_message("R|A|S|recordA"));
        handler.handle(wire_message("R|R|recordA|0|{\"name\":\"sam\"}"));
        let sent_before = connection.sent_count();

        let data = handler.snapshot("recordA").await.unwrap();
        assert_eq!(data, json!({"name": "sam"}));
        assert_eq!(connection.sent_count(), sent_before);
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_record_queries_hub() {
        let (handler, connection, _ctx) = handler();
        let requester = handler.clone();
        let request = tokio::spawn(async move { requester.snapshot("weather").await });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.last_sent(), Some(wire("R|SN|weather+")));

        handler.handle(wire_message("R|R|weather|12|{\"temp\":21}"));
        assert_eq!(request.await.unwrap().unwrap(), json!({"temp": 21}));
    }

    #[tokio::test]
    async fn test_snapshot_error_fails_the_request() {
        let (handler, _connection, _ctx) = handler();
        let requester = handler.clone();
        let request = tokio::spawn(async move { requester.snapshot("weather").await });
        sleep(Duration::from_millis(20)).await;

        handler.handle(wire_message("R|E|SN|weather|RECORD_NOT_FOUND"));
        assert!(matches!(
            request.await.unwrap(),
            Err(ClientError::Server { .. })
        ));
    }

    #[tokio::test]
    async fn test_has_known_and_unknown() {
        let (handler, connection, _ctx) = handler();
        let requester = handler.clone();
        let request = tokio::spawn(async move { requester.has("weather").await });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.last_sent(), Some(wire("R|H|weather+")));

        handler.handle(wire_message("R|H|weather|T"));
        assert!(request.await.unwrap().unwrap());

        let requester = handler.clone();
        let request = tokio::spawn(async move { requester.has("nothere").await });
        sleep(Duration::from_millis(20)).await;
        handler.handle(wire_message("R|H|nothere|F"));
        assert!(!request.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_has_answers_locally_for_loaded_record() {
        let (handler, connection, _ctx) = handler();
        let _record = handler.get_record("recordA");
        handler.handle(wire_message("R|A|S|recordA"));
        handler.handle(wire_message("R|R|recordA|0|{}"));
        let sent_before = connection.sent_count();

        assert!(handler.has("recordA").await.unwrap());
        assert_eq!(connection.sent_count(), sent_before);
    }

    #[tokio::test]
    async fn test_unsolicited_update_reported() {
        let (handler, _connection, ctx) = handler();
        let log = ErrorLog::install(&ctx.errors);
        handler.handle(wire_message("R|U|ghost|2|{}"));
        assert!(log.contains(&ErrorEvent::UnsolicitedMessage, "ghost"));
    }

    #[tokio::test]
    async fn test_get_list_returns_shared_instance() {
        let (handler, _connection, _ctx) = handler();
        let first = handler.get_list("someList");
        handler.handle(wire_message("R|R|someList|1|[\"a\"]"));
        let second = handler.get_list("someList");
        assert_eq!(first.entries(), second.entries());
        assert_eq!(first.entries(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_anonymous_record_moves_subscriptions() {
        let (handler, connection, _ctx) = handler();
        let anonymous = handler.get_anonymous_record();
        assert!(anonymous.get().is_none());
        assert!(anonymous.name().is_none());
        assert!(matches!(
            anonymous.set_path("lastname", json!("Schrader")),
            Err(ClientError::AnonymousRecordUninitialized)
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        anonymous.subscribe_path("firstname", move |_record, _path, value| {
            seen2.lock().push(value.cloned());
        });

        anonymous.set_name("firstRecordName").unwrap();
        assert_eq!(
            connection.last_sent(),
            Some(wire("R|CR|firstRecordName+"))
        );
        handler.handle(wire_message(
            "R|R|firstRecordName|1|{\"firstname\":\"Wolfram\"}",
        ));
        assert_eq!(anonymous.name(), Some("firstRecordName".to_string()));
        assert_eq!(*seen.lock(), vec![Some(json!("Wolfram"))]);

        // Another record changing does not touch the proxy.
        let _other = handler.get_record("secondRecordName");
        handler.handle(wire_message(
            "R|R|secondRecordName|2|{\"firstname\":\"Egon\",\"lastname\":\"Kowalski\"}",
        ));
        assert_eq!(seen.lock().len(), 1);

        // Retargeting fires with the new record's differing value.
        anonymous.set_name("secondRecordName").unwrap();
        assert_eq!(*seen.lock(), vec![Some(json!("Wolfram")), Some(json!("Egon"))]);

        // And proxies writes through to the bound record.
        let second = handler.get_record("secondRecordName");
        anonymous.set_path("lastname", json!("Schrader")).unwrap();
        assert_eq!(second.get_path("lastname"), Some(json!("Schrader")));
    }
}
