//! Remote procedure calls through the hub.
//!
//! Two roles share this handler. A *provider* registers named procedures
//! and answers inbound requests through an [`RpcResponse`]. A *caller*
//! invokes [`RpcHandler::make`], which resolves when the response, an
//! error, or the response deadline arrives. Requests and responses are
//! matched by a correlation id from the client's monotonic counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use hublink_protocol::{from_typed, to_typed, Action, Message, Topic};

use crate::connection::{MessageHandler, MessageSender};
use crate::context::ClientContext;
use crate::error::{ClientError, ErrorEvent};
use crate::resubscribe::ResubscribeNotifier;

/// Provider callback: `(rpc_name, request_data, response)`.
pub type RpcProvider = dyn Fn(&str, Option<&Value>, RpcResponse) + Send + Sync;

#[derive(Clone)]
pub struct RpcHandler {
    inner: Arc<RpcHandlerInner>,
}

struct RpcHandlerInner {
    ctx: Arc<ClientContext>,
    connection: Arc<dyn MessageSender>,
    providers: Mutex<HashMap<String, Arc<RpcProvider>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, ClientError>>>>,
    resub: Mutex<Option<ResubscribeNotifier>>,
}

impl RpcHandler {
    pub(crate) fn new(ctx: Arc<ClientContext>, connection: Arc<dyn MessageSender>) -> Self {
        let inner = Arc::new(RpcHandlerInner {
            ctx,
            connection,
            providers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            resub: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let resub = ResubscribeNotifier::new(
            Arc::clone(&inner.ctx.state),
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                for name in inner.providers.lock().keys() {
                    inner
                        .connection
                        .send(Topic::Rpc, Action::Subscribe, &[name]);
                }
            }),
        );
        *inner.resub.lock() = Some(resub);

        RpcHandler { inner }
    }

    /// Register this client as a provider for `name`.
    pub fn provide<F>(&self, name: &str, provider: F)
    where
        F: Fn(&str, Option<&Value>, RpcResponse) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let fresh = inner
            .providers
            .lock()
            .insert(name.to_string(), Arc::new(provider))
            .is_none();
        if fresh {
            inner.ctx.acks.add(
                Topic::Rpc,
                Action::Subscribe,
                name,
                inner.ctx.config.subscription_timeout,
            );
            inner
                .connection
                .send(Topic::Rpc, Action::Subscribe, &[name]);
        }
    }

    pub fn unprovide(&self, name: &str) {
        let inner = &self.inner;
        if inner.providers.lock().remove(name).is_some() {
            inner.ctx.acks.add(
                Topic::Rpc,
                Action::Unsubscribe,
                name,
                inner.ctx.config.subscription_timeout,
            );
            inner
                .connection
                .send(Topic::Rpc, Action::Unsubscribe, &[name]);
        }
    }

    /// Invoke a remote procedure and wait for its outcome.
    pub async fn make(&self, name: &str, data: Option<&Value>) -> Result<Value, ClientError> {
        let inner = &self.inner;
        let correlation_id = inner.ctx.next_uid();

        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(correlation_id.clone(), tx);

        inner.ctx.acks.add_for_event(
            Topic::Rpc,
            Action::Request,
            &correlation_id,
            ErrorEvent::AckTimeout,
            inner.ctx.config.rpc_ack_timeout,
        );
        let weak = Arc::downgrade(inner);
        inner.ctx.acks.add_with_listener(
            Topic::Rpc,
            Action::Response,
            &correlation_id,
            ErrorEvent::ResponseTimeout,
            Arc::new(move |_topic, _action, event, cid| {
                if let Some(inner) = weak.upgrade() {
                    inner.complete(cid, Err(ClientError::Rpc(event.to_string())));
                }
            }),
            inner.ctx.config.rpc_response_timeout,
        );

        let typed = data.map(to_typed).unwrap_or_else(|| "U".to_string());
        inner.connection.send(
            Topic::Rpc,
            Action::Request,
            &[name, &correlation_id, &typed],
        );

        rx.await.unwrap_or(Err(ClientError::IsClosed))
    }

    /// Abort every in-flight call with `IsClosed`. Used on client close.
    pub(crate) fn abort_pending(&self) {
        self.inner.pending.lock().clear();
    }
}

impl MessageHandler for RpcHandler {
    fn handle(&self, message: Message) {
        let inner = &self.inner;
        match message.action {
            Action::Request => {
                let (Some(name), Some(cid)) = (message.field(0), message.field(1)) else {
                    return;
                };
                let data = message
                    .field(2)
                    .and_then(|field| from_typed(field).ok())
                    .and_then(|typed| typed.into_value());
                let provider = inner.providers.lock().get(name).cloned();
                match provider {
                    Some(provider) => {
                        let response = RpcResponse::new(
                            Arc::clone(&inner.connection),
                            name,
                            cid,
                        );
                        provider(name, data.as_ref(), response);
                    }
                    None => {
                        inner
                            .connection
                            .send(Topic::Rpc, Action::Rejection, &[name, cid]);
                    }
                }
            }
            Action::Ack => {
                // Request acks are keyed by correlation id, subscription
                // acks by name.
                if message.field(0) == Some(Action::Request.as_str()) {
                    if let Some(cid) = message.field(2) {
                        inner.ctx.acks.clear(Topic::Rpc, Action::Request, cid);
                    }
                } else {
                    inner.ctx.acks.clear_message(&message);
                }
            }
            Action::Response => {
                let (Some(_name), Some(cid)) = (message.field(0), message.field(1)) else {
                    return;
                };
                let value = message
                    .field(2)
                    .and_then(|field| from_typed(field).ok())
                    .and_then(|typed| typed.into_value())
                    .unwrap_or(Value::Null);
                inner.complete(cid, Ok(value));
            }
            Action::Error => {
                // data: [error_message, name, correlation_id]
                let (Some(error), Some(cid)) = (message.field(0), message.field(2)) else {
                    return;
                };
                inner.complete(cid, Err(ClientError::Rpc(error.to_string())));
            }
            _ => inner.ctx.errors.report(
                Some(Topic::Rpc),
                ErrorEvent::UnsolicitedMessage,
                message.action.name(),
            ),
        }
    }
}

impl RpcHandlerInner {
    fn complete(&self, correlation_id: &str, result: Result<Value, ClientError>) {
        let Some(tx) = self.pending.lock().remove(correlation_id) else {
            return;
        };
        self.ctx
            .acks
            .clear(Topic::Rpc, Action::Request, correlation_id);
        self.ctx
            .acks
            .clear(Topic::Rpc, Action::Response, correlation_id);
        let _ = tx.send(result);
    }
}

/// Handed to a provider for answering one request. Construction sends the
/// receipt ack; exactly one of `send`, `reject` or `error` completes it.
pub struct RpcResponse {
    connection: Arc<dyn MessageSender>,
    name: String,
    correlation_id: String,
    acknowledged: AtomicBool,
    complete: AtomicBool,
}

impl RpcResponse {
    fn new(connection: Arc<dyn MessageSender>, name: &str, correlation_id: &str) -> Self {
        let response = RpcResponse {
            connection,
            name: name.to_string(),
            correlation_id: correlation_id.to_string(),
            acknowledged: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        };
        response.ack();
        response
    }

    /// Acknowledge receipt. Idempotent; already sent on construction.
    pub fn ack(&self) {
        if self.acknowledged.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.send(
            Topic::Rpc,
            Action::Ack,
            &[
                Action::Request.as_str(),
                &self.name,
                &self.correlation_id,
            ],
        );
    }

    /// Answer the request with `data`.
    pub fn send(&self, data: &Value) -> Result<(), ClientError> {
        if self.complete.swap(true, Ordering::SeqCst) {
            return Err(ClientError::RpcAlreadyCompleted(self.name.clone()));
        }
        self.connection.send(
            Topic::Rpc,
            Action::Response,
            &[&self.name, &self.correlation_id, &to_typed(data)],
        );
        Ok(())
    }

    /// Decline the request so the hub can route it to another provider.
    pub fn reject(&self) {
        self.complete.store(true, Ordering::SeqCst);
        self.acknowledged.store(true, Ordering::SeqCst);
        self.connection.send(
            Topic::Rpc,
            Action::Rejection,
            &[&self.name, &self.correlation_id],
        );
    }

    /// Fail the request with an error message.
    pub fn error(&self, error_message: &str) {
        self.complete.store(true, Ordering::SeqCst);
        self.acknowledged.store(true, Ordering::SeqCst);
        self.connection.send(
            Topic::Rpc,
            Action::Error,
            &[error_message, &self.name, &self.correlation_id],
        );
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

    fn handler_with_config(
        config: ClientConfig,
    ) -> (RpcHandler, Arc<MockConnection>, Arc<ClientContext>) {
        let ctx = ClientContext::new(config);
        ctx.state.set(ConnectionState::Open);
        let connection = MockConnection::new();
        let handler = RpcHandler::new(Arc::clone(&ctx), connection.clone());
        (handler, connection, ctx)
    }

    fn handler() -> (RpcHandler, Arc<MockConnection>, Arc<ClientContext>) {
        handler_with_config(ClientConfig::default())
    }

    fn add_two(handler: &RpcHandler) {
        handler.provide("addTwo", |_name, data, response| {
            let data = data.unwrap();
            let sum = data["numA"].as_f64().unwrap() + data["numB"].as_f64().unwrap();
            let _ = response.send(&json!(sum));
        });
    }

    #[tokio::test]
    async fn test_provide_sends_subscribe() {
        let (handler, connection, _ctx) = handler();
        add_two(&handler);
        assert_eq!(connection.last_sent(), Some(wire("P|S|addTwo+")));
    }

    #[tokio::test]
    async fn test_provider_answers_request() {
        let (handler, connection, _ctx) = handler();
        add_two(&handler);

        handler.handle(wire_message("P|REQ|addTwo|123|O{\"numA\":7,\"numB\":3}"));
        let sent = connection.sent();
        // ack first, then the response
        assert_eq!(sent[sent.len() - 2], wire("P|A|REQ|addTwo|123+"));
        assert_eq!(sent[sent.len() - 1], wire("P|RES|addTwo|123|N10.0+"));
    }

    #[tokio::test]
    async fn test_no_provider_sends_rejection() {
        let (handler, connection, _ctx) = handler();
        handler.handle(wire_message("P|REQ|doesNotExist|123|O{\"numA\":7}"));
        assert_eq!(
            connection.last_sent(),
            Some(wire("P|REJ|doesNotExist|123+"))
        );
    }

    #[tokio::test]
    async fn test_unprovide_sends_unsubscribe() {
        let (handler, connection, _ctx) = handler();
        add_two(&handler);
        handler.unprovide("addTwo");
        assert_eq!(connection.last_sent(), Some(wire("P|US|addTwo+")));

        handler.handle(wire_message("P|REQ|addTwo|123|O{\"numA\":7,\"numB\":3}"));
        assert_eq!(connection.last_sent(), Some(wire("P|REJ|addTwo|123+")));
    }

    #[tokio::test]
    async fn test_provide_ack_timeout_reported() {
        let mut config = ClientConfig::default();
        config.subscription_timeout = Duration::from_millis(20);
        let (handler, _connection, ctx) = handler_with_config(config);
        let log = ErrorLog::install(&ctx.errors);
        add_two(&handler);

        sleep(Duration::from_millis(100)).await;
        assert!(log.contains(
            &ErrorEvent::AckTimeout,
            "No ACK message received in time for SUBSCRIBE addTwo"
        ));
    }

    #[tokio::test]
    async fn test_successful_make() {
        let (handler, connection, _ctx) = handler();
        let caller = handler.clone();
        let call = tokio::spawn(async move {
            caller.make("addTwo", Some(&json!({"numA": 3, "numB": 8}))).await
        });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(
            connection.last_sent(),
            Some(wire("P|REQ|addTwo|1|O{\"numA\":3,\"numB\":8}+"))
        );

        handler.handle(wire_message("P|A|REQ|addTwo|1"));
        handler.handle(wire_message("P|RES|addTwo|1|N11"));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!(11));
    }

    #[tokio::test]
    async fn test_make_with_remote_error() {
        let (handler, _connection, _ctx) = handler();
        let caller = handler.clone();
        let call = tokio::spawn(async move {
            caller.make("addTwo", Some(&json!({"numA": 3, "numB": 8}))).await
        });

        sleep(Duration::from_millis(20)).await;
        handler.handle(wire_message("P|E|NO_PROVIDER|addTwo|1"));

        let result = call.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Rpc(ref message)) if message == "NO_PROVIDER"
        ));
    }

    #[tokio::test]
    async fn test_make_without_ack_reports_ack_timeout() {
        let mut config = ClientConfig::default();
        config.rpc_ack_timeout = Duration::from_millis(20);
        config.rpc_response_timeout = Duration::from_millis(200);
        let (handler, _connection, ctx) = handler_with_config(config);
        let log = ErrorLog::install(&ctx.errors);

        let caller = handler.clone();
        let _call = tokio::spawn(async move { caller.make("addTwo", None).await });

        sleep(Duration::from_millis(100)).await;
        assert!(log.contains(
            &ErrorEvent::AckTimeout,
            "No ACK message received in time for REQUEST 1"
        ));
    }

    #[tokio::test]
    async fn test_make_without_response_fails_with_response_timeout() {
        let mut config = ClientConfig::default();
        config.rpc_ack_timeout = Duration::from_millis(10);
        config.rpc_response_timeout = Duration::from_millis(30);
        let (handler, _connection, _ctx) = handler_with_config(config);

        let result = handler.make("addTwo", Some(&json!({}))).await;
        assert!(matches!(
            result,
            Err(ClientError::Rpc(ref message)) if message == "RESPONSE_TIMEOUT"
        ));
    }

    #[tokio::test]
    async fn test_correlation_ids_increment() {
        let (handler, connection, _ctx) = handler();
        let c1 = handler.clone();
        let c2 = handler.clone();
        tokio::spawn(async move { c1.make("a", None).await });
        tokio::spawn(async move { c2.make("b", None).await });
        sleep(Duration::from_millis(30)).await;

        let sent = connection.sent();
        let cids: Vec<String> = sent
            .iter()
            .map(|frame| frame.split('\u{1f}').nth(3).unwrap().to_string())
            .collect();
        assert!(cids.contains(&"1".to_string()));
        assert!(cids.contains(&"2".to_string()));
    }

    #[tokio::test]
    async fn test_double_send_fails() {
        let (_handler, connection, _ctx) = handler();
        let response = RpcResponse::new(connection.clone(), "addTwo", "9");
        response.send(&json!(1)).unwrap();
        let second = response.send(&json!(2));
        assert!(matches!(
            second,
            Err(ClientError::RpcAlreadyCompleted(ref name)) if name == "addTwo"
        ));
    }

    #[tokio::test]
    async fn test_response_error_and_reject_traces() {
        let (_handler, connection, _ctx) = handler();

        let response = RpcResponse::new(connection.clone(), "addTwo", "9");
        response.reject();
        assert_eq!(connection.last_sent(), Some(wire("P|REJ|addTwo|9+")));

        let response = RpcResponse::new(connection.clone(), "addTwo", "10");
        response.error("broken");
        assert_eq!(connection.last_sent(), Some(wire("P|E|broken|addTwo|10+")));
    }

    #[tokio::test]
    async fn test_resubscribe_replays_providers() {
        let (handler, connection, ctx) = handler();
        add_two(&handler);
        assert_eq!(connection.sent_count(), 1);

        ctx.state.set(ConnectionState::Reconnecting);
        ctx.state.set(ConnectionState::Open);
        assert_eq!(connection.sent(), vec![wire("P|S|addTwo+"), wire("P|S|addTwo+")]);
    }
}
