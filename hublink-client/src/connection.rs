//! The hub connection.
//!
//! Owns the endpoint, walks the handshake (challenge → auth → open),
//! buffers outbound frames while not OPEN, reconnects with linear
//! backoff, and routes inbound messages: CONNECTION and AUTH are handled
//! inline on the connection task, EVENT / RPC / RECORD / PRESENCE each go
//! to their own serial dispatcher so topics progress independently while
//! every topic stays ordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use hublink_protocol::{codec, from_typed, Action, Message, Topic};

use crate::context::ClientContext;
use crate::endpoint::{parse_url, Endpoint, EndpointFactory, TransportEvent};
use crate::error::{ClientError, ErrorEvent};
use crate::state::{ConnectionState, GlobalConnectivityState};

/// Outcome of a login attempt.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub logged_in: bool,
    pub error_event: Option<ErrorEvent>,
    pub data: Option<Value>,
}

impl LoginResult {
    fn success(data: Option<Value>) -> Self {
        LoginResult {
            logged_in: true,
            error_event: None,
            data,
        }
    }

    fn failure(event: ErrorEvent, data: Option<Value>) -> Self {
        LoginResult {
            logged_in: false,
            error_event: Some(event),
            data,
        }
    }
}

/// Anything that can put protocol messages on the wire. The connection
/// implements it; handler tests substitute a recorder.
pub(crate) trait MessageSender: Send + Sync {
    fn send_frame(&self, frame: String);

    fn send(&self, topic: Topic, action: Action, data: &[&str]) {
        self.send_frame(codec::build(topic, action, data));
    }
}

/// One per topic dispatcher; handlers are driven serially per topic.
pub(crate) trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message);
}

struct DispatchSenders {
    event: mpsc::UnboundedSender<Message>,
    rpc: mpsc::UnboundedSender<Message>,
    record: mpsc::UnboundedSender<Message>,
    presence: mpsc::UnboundedSender<Message>,
}

struct ReconnectState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

struct AuthState {
    params: Option<Value>,
    pending: Vec<oneshot::Sender<LoginResult>>,
}

pub(crate) struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ConnectionInner {
    ctx: Arc<ClientContext>,
    original_url: String,
    url: Mutex<String>,
    factory: Box<dyn EndpointFactory>,
    endpoint: Mutex<Option<Arc<dyn Endpoint>>>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    buffer: Mutex<Vec<String>>,
    deliberate_close: AtomicBool,
    redirecting: AtomicBool,
    challenge_denied: AtomicBool,
    too_many_auth_attempts: AtomicBool,
    reconnect: Mutex<ReconnectState>,
    connectivity: Mutex<GlobalConnectivityState>,
    auth: Mutex<AuthState>,
    dispatch: Mutex<Option<DispatchSenders>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(url: &str, ctx: Arc<ClientContext>, factory: Box<dyn EndpointFactory>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Connection {
            inner: Arc::new(ConnectionInner {
                ctx,
                original_url: url.to_string(),
                url: Mutex::new(url.to_string()),
                factory,
                endpoint: Mutex::new(None),
                transport_tx,
                transport_rx: Mutex::new(Some(transport_rx)),
                buffer: Mutex::new(Vec::new()),
                deliberate_close: AtomicBool::new(false),
                redirecting: AtomicBool::new(false),
                challenge_denied: AtomicBool::new(false),
                too_many_auth_attempts: AtomicBool::new(false),
                reconnect: Mutex::new(ReconnectState {
                    attempts: 0,
                    timer: None,
                }),
                connectivity: Mutex::new(GlobalConnectivityState::Connected),
                auth: Mutex::new(AuthState {
                    params: None,
                    pending: Vec::new(),
                }),
                dispatch: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wire up the per-topic dispatchers, start the connection task and
    /// open the endpoint.
    pub fn start(
        &self,
        event: Arc<dyn MessageHandler>,
        rpc: Arc<dyn MessageHandler>,
        record: Arc<dyn MessageHandler>,
        presence: Arc<dyn MessageHandler>,
    ) {
        let senders = DispatchSenders {
            event: spawn_dispatcher(event),
            rpc: spawn_dispatcher(rpc),
            record: spawn_dispatcher(record),
            presence: spawn_dispatcher(presence),
        };
        *self.inner.dispatch.lock() = Some(senders);

        let Some(rx) = self.inner.transport_rx.lock().take() else {
            log::warn!("connection already started");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(run_transport_loop(weak, rx));
        self.inner.tasks.lock().push(task);

        self.inner.create_endpoint();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.ctx.state.get()
    }

    /// Store credentials and send them as soon as the handshake allows.
    /// The returned channel resolves with the auth outcome.
    pub fn authenticate(&self, params: Option<Value>) -> oneshot::Receiver<LoginResult> {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;

        if inner.too_many_auth_attempts.load(Ordering::SeqCst)
            || inner.challenge_denied.load(Ordering::SeqCst)
        {
            let message = "The client's connection was closed";
            inner
                .ctx
                .errors
                .report(Some(Topic::Error), ErrorEvent::IsClosed, message);
            let _ = tx.send(LoginResult::failure(
                ErrorEvent::IsClosed,
                Some(Value::String(message.to_string())),
            ));
            return rx;
        }

        {
            let mut auth = inner.auth.lock();
            auth.params = Some(params.unwrap_or_else(|| json!({})));
            auth.pending.push(tx);
        }
        if inner.ctx.state.get() == ConnectionState::AwaitingAuthentication {
            inner.send_auth_message();
        }
        rx
    }

    pub fn close(&self, force: bool) {
        let inner = &self.inner;
        inner.deliberate_close.store(true, Ordering::SeqCst);
        inner.cancel_reconnect_timer();

        let endpoint = inner.endpoint.lock().clone();
        match endpoint {
            Some(endpoint) if force => {
                endpoint.force_close();
                inner.set_state(ConnectionState::Closed);
            }
            Some(endpoint) => endpoint.close(),
            None => inner.set_state(ConnectionState::Closed),
        }
    }

    /// Application-reported network reachability. `Disconnected` parks the
    /// connection; `Connected` revives it from CLOSED or ERROR.
    pub fn set_global_connectivity_state(&self, connectivity: GlobalConnectivityState) {
        let inner = &self.inner;
        *inner.connectivity.lock() = connectivity;

        match connectivity {
            GlobalConnectivityState::Connected => {
                let state = inner.ctx.state.get();
                if state == ConnectionState::Closed || state == ConnectionState::Error {
                    inner.try_reconnect();
                }
            }
            GlobalConnectivityState::Disconnected => {
                inner.cancel_reconnect_timer();
                inner.reconnect.lock().attempts = 0;
                if let Some(endpoint) = inner.endpoint.lock().as_ref() {
                    endpoint.force_close();
                }
                inner.set_state(ConnectionState::Closed);
            }
        }
    }
}

impl MessageSender for Connection {
    fn send_frame(&self, frame: String) {
        self.inner.send_frame(frame);
    }
}

fn spawn_dispatcher(handler: Arc<dyn MessageHandler>) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            handler.handle(message);
        }
    });
    tx
}

async fn run_transport_loop(
    weak: Weak<ConnectionInner>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            TransportEvent::Open => inner.on_open(),
            TransportEvent::Frame(frame) => inner.on_frame(&frame),
            TransportEvent::Error(reason) => inner.on_transport_error(&reason),
            TransportEvent::Closed => inner.on_close(),
        }
    }
}

impl ConnectionInner {
    fn send_frame(&self, frame: String) {
        if self.ctx.state.get() != ConnectionState::Open {
            self.buffer.lock().push(frame);
        } else {
            self.endpoint_send(frame);
        }
    }

    fn endpoint_send(&self, frame: String) {
        match self.endpoint.lock().as_ref() {
            Some(endpoint) => endpoint.send(frame),
            None => log::warn!("dropping frame, no endpoint"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("connection state -> {:?}", state);
        self.ctx.state.set(state);

        if state == ConnectionState::AwaitingAuthentication
            && self.auth.lock().params.is_some()
        {
            self.send_auth_message();
        }
    }

    fn send_auth_message(&self) {
        let params = self
            .auth
            .lock()
            .params
            .clone()
            .unwrap_or_else(|| json!({}));
        self.set_state(ConnectionState::Authenticating);
        self.endpoint_send(codec::build(
            Topic::Auth,
            Action::Request,
            &[&params.to_string()],
        ));
    }

    fn create_endpoint(&self) {
        let raw = self.url.lock().clone();
        let url = match parse_url(&raw, &self.ctx.config.path) {
            Ok(url) => url,
            Err(e) => {
                self.ctx.errors.report(
                    None,
                    ErrorEvent::ConnectionError,
                    &e.to_string(),
                );
                self.set_state(ConnectionState::Closed);
                return;
            }
        };
        let endpoint = self.factory.create(&url, self.transport_tx.clone());
        endpoint.open();
        *self.endpoint.lock() = Some(endpoint);
    }

    fn on_open(&self) {
        self.set_state(ConnectionState::AwaitingConnection);
    }

    fn on_frame(&self, frame: &str) {
        for parsed in codec::decode(frame) {
            match parsed {
                Ok(message) => self.route(message),
                Err(e) => self.ctx.errors.report(
                    Some(Topic::Error),
                    ErrorEvent::MessageParseError,
                    &e.to_string(),
                ),
            }
        }
    }

    fn route(&self, message: Message) {
        match message.topic {
            Topic::Connection => self.handle_connection_message(&message),
            Topic::Auth => self.handle_auth_message(&message),
            Topic::Event | Topic::Rpc | Topic::Record | Topic::Presence => {
                let dispatch = self.dispatch.lock();
                let Some(senders) = dispatch.as_ref() else { return };
                let sender = match message.topic {
                    Topic::Event => &senders.event,
                    Topic::Rpc => &senders.rpc,
                    Topic::Record => &senders.record,
                    _ => &senders.presence,
                };
                let _ = sender.send(message);
            }
            Topic::Error => self.ctx.errors.report(
                Some(Topic::Error),
                ErrorEvent::UnsolicitedMessage,
                message.action.name(),
            ),
        }
    }

    fn handle_connection_message(&self, message: &Message) {
        match message.action {
            Action::Ping => {
                self.endpoint_send(codec::build(Topic::Connection, Action::Pong, &[]));
            }
            Action::Ack => self.set_state(ConnectionState::AwaitingAuthentication),
            Action::Challenge => {
                self.set_state(ConnectionState::Challenging);
                self.endpoint_send(codec::build(
                    Topic::Connection,
                    Action::ChallengeResponse,
                    &[&self.original_url],
                ));
            }
            Action::Rejection => {
                self.challenge_denied.store(true, Ordering::SeqCst);
                self.deliberate_close.store(true, Ordering::SeqCst);
                self.cancel_reconnect_timer();
                if let Some(endpoint) = self.endpoint.lock().as_ref() {
                    endpoint.close();
                }
            }
            Action::Redirect => {
                let Some(target) = message.field(0) else { return };
                *self.url.lock() = target.to_string();
                self.redirecting.store(true, Ordering::SeqCst);
                let endpoint = self.endpoint.lock().take();
                if let Some(endpoint) = endpoint {
                    endpoint.close();
                }
            }
            _ => {}
        }
    }

    fn handle_auth_message(&self, message: &Message) {
        match message.action {
            Action::Error => {
                let event_name = message.field(0).unwrap_or_default();
                if event_name == ErrorEvent::TooManyAuthAttempts.as_str() {
                    self.deliberate_close.store(true, Ordering::SeqCst);
                    self.too_many_auth_attempts.store(true, Ordering::SeqCst);
                    if let Some(endpoint) = self.endpoint.lock().as_ref() {
                        endpoint.close();
                    }
                } else {
                    self.auth.lock().params = None;
                    self.set_state(ConnectionState::AwaitingAuthentication);
                }

                let data = message
                    .field(1)
                    .and_then(|field| from_typed(field).ok())
                    .and_then(|typed| typed.into_value());
                self.complete_logins(LoginResult::failure(
                    ErrorEvent::from_name(event_name),
                    data,
                ));
            }
            Action::Ack => {
                self.set_state(ConnectionState::Open);
                self.flush_buffer();

                let data = message
                    .field(0)
                    .and_then(|field| from_typed(field).ok())
                    .and_then(|typed| typed.into_value());
                self.complete_logins(LoginResult::success(data));
            }
            _ => {}
        }
    }

    fn complete_logins(&self, result: LoginResult) {
        let pending = std::mem::take(&mut self.auth.lock().pending);
        for tx in pending {
            let _ = tx.send(result.clone());
        }
    }

    fn flush_buffer(&self) {
        let frames = std::mem::take(&mut *self.buffer.lock());
        for frame in frames {
            self.endpoint_send(frame);
        }
    }

    fn on_transport_error(&self, reason: &str) {
        self.set_state(ConnectionState::Error);
        self.ctx
            .errors
            .report(None, ErrorEvent::ConnectionError, reason);
    }

    fn on_close(self: &Arc<Self>) {
        if self.redirecting.swap(false, Ordering::SeqCst) {
            self.create_endpoint();
            return;
        }

        if self.deliberate_close.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Closed);
            return;
        }

        self.set_state(ConnectionState::Error);

        let on_original_url = *self.url.lock() == self.original_url;
        if on_original_url {
            self.try_reconnect();
        } else {
            // A redirected endpoint went away; fall back to the url we
            // were given originally.
            *self.url.lock() = self.original_url.clone();
            self.create_endpoint();
        }
    }

    fn try_reconnect(self: &Arc<Self>) {
        let config = &self.ctx.config;
        {
            let reconnect = self.reconnect.lock();
            if reconnect.timer.is_some() {
                return;
            }
            if reconnect.attempts >= config.max_reconnect_attempts {
                drop(reconnect);
                log::warn!(
                    "giving up after {} reconnect attempts",
                    config.max_reconnect_attempts
                );
                self.reconnect.lock().attempts = 0;
                self.deliberate_close.store(true, Ordering::SeqCst);
                if let Some(endpoint) = self.endpoint.lock().as_ref() {
                    endpoint.force_close();
                }
                self.set_state(ConnectionState::Closed);
                return;
            }
        }

        if *self.connectivity.lock() != GlobalConnectivityState::Connected {
            return;
        }

        self.set_state(ConnectionState::Reconnecting);

        let mut reconnect = self.reconnect.lock();
        if reconnect.timer.is_some() {
            return;
        }
        let interval = config
            .reconnect_interval_increment
            .saturating_mul(reconnect.attempts)
            .min(config.max_reconnect_interval);
        reconnect.attempts += 1;
        log::info!(
            "reconnect attempt {} in {:?}",
            reconnect.attempts,
            interval
        );

        let weak = Arc::downgrade(self);
        reconnect.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.reconnect.lock().timer = None;
            let endpoint = inner.endpoint.lock().clone();
            match endpoint {
                Some(endpoint) => endpoint.open(),
                None => inner.create_endpoint(),
            }
        }));
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(timer) = self.reconnect.lock().timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(timer) = self.reconnect.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records outbound frames; handler tests assert on the traffic the
    /// way the wire would see it.
    #[derive(Default)]
    pub struct MockConnection {
        frames: Mutex<Vec<String>>,
    }

    impl MockConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(MockConnection::default())
        }

        pub fn sent(&self) -> Vec<String> {
            self.frames.lock().clone()
        }

        pub fn last_sent(&self) -> Option<String> {
            self.frames.lock().last().cloned()
        }

        pub fn sent_count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl MessageSender for MockConnection {
        fn send_frame(&self, frame: String) {
            self.frames.lock().push(frame);
        }
    }

    /// Build a wire string from the readable notation used in tests:
    /// `|` for the unit separator, `+` for the record separator.
    pub fn wire(human: &str) -> String {
        human.replace('|', "\u{1f}").replace('+', "\u{1e}")
    }

    /// Parse a message written in the readable notation.
    pub fn wire_message(human: &str) -> Message {
        codec::decode_one(&wire(human)).expect("invalid test message")
    }
}
