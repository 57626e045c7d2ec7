//! Transport endpoints.
//!
//! The connection treats its transport as a leaf that accepts frames and
//! reports lifecycle events through a channel. The production endpoint is
//! a WebSocket (tokio-tungstenite, split into a reader loop and a writer
//! task); [`MockEndpoint`] drives the same channel from test code.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::error::ClientError;

/// Events an endpoint reports to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is established and frames may flow.
    Open,
    /// An inbound text frame.
    Frame(String),
    /// The transport failed; a close follows.
    Error(String),
    /// The transport ended. Not emitted after `force_close`.
    Closed,
}

/// An ordered text-frame transport.
///
/// `open` may be called again after the transport ended to establish a
/// fresh connection to the same url (the reconnect path relies on this).
pub trait Endpoint: Send + Sync {
    fn open(&self);
    fn send(&self, frame: String);
    /// Close gracefully; the endpoint reports `Closed` when done.
    fn close(&self);
    /// Tear down immediately and silently; no further events.
    fn force_close(&self);
}

/// Creates endpoints; injected so tests can substitute a mock transport.
pub trait EndpointFactory: Send + Sync {
    fn create(
        &self,
        url: &Url,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Endpoint>;
}

/// Normalize an endpoint url: imply the `ws` scheme, reject http(s), and
/// append the configured default path when none is given.
pub(crate) fn parse_url(raw: &str, default_path: &str) -> Result<Url, ClientError> {
    if raw.starts_with("http:") || raw.starts_with("https:") {
        return Err(ClientError::InvalidUrl(
            raw.to_string(),
            "http/https is not supported, use ws or wss".to_string(),
        ));
    }
    let normalized = if let Some(rest) = raw.strip_prefix("//") {
        format!("ws://{rest}")
    } else if !raw.starts_with("ws:") && !raw.starts_with("wss:") {
        format!("ws://{raw}")
    } else {
        raw.to_string()
    };
    let mut url = Url::parse(&normalized)
        .map_err(|e| ClientError::InvalidUrl(raw.to_string(), e.to_string()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(default_path);
    }
    Ok(url)
}

enum WriterCommand {
    Frame(String),
    Close,
}

/// WebSocket endpoint.
pub struct WsEndpoint {
    url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    writer: Arc<Mutex<Option<mpsc::UnboundedSender<WriterCommand>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsEndpoint {
    pub fn new(url: Url, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        WsEndpoint {
            url,
            events,
            writer: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Endpoint for WsEndpoint {
    fn open(&self) {
        let url = self.url.clone();
        let events = self.events.clone();
        let writer_slot = Arc::clone(&self.writer);

        let task = tokio::spawn(async move {
            let stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            };
            let (mut sink, mut reader) = stream.split();

            let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
            *writer_slot.lock() = Some(writer_tx);
            let _ = events.send(TransportEvent::Open);

            let writer_task = tokio::spawn(async move {
                while let Some(command) = writer_rx.recv().await {
                    match command {
                        WriterCommand::Frame(frame) => {
                            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        WriterCommand::Close => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            while let Some(inbound) = reader.next().await {
                match inbound {
                    Ok(WsMessage::Text(text)) => {
                        let _ = events.send(TransportEvent::Frame(text.to_string()));
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            *writer_slot.lock() = None;
            writer_task.abort();
            let _ = events.send(TransportEvent::Closed);
        });
        self.tasks.lock().push(task);
    }

    fn send(&self, frame: String) {
        let writer = self.writer.lock();
        match writer.as_ref() {
            Some(writer) => {
                let _ = writer.send(WriterCommand::Frame(frame));
            }
            None => log::warn!("dropping frame, websocket not established"),
        }
    }

    fn close(&self) {
        if let Some(writer) = self.writer.lock().as_ref() {
            let _ = writer.send(WriterCommand::Close);
        }
    }

    fn force_close(&self) {
        *self.writer.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// The default factory: one [`WsEndpoint`] per url.
pub struct WsEndpointFactory;

impl EndpointFactory for WsEndpointFactory {
    fn create(
        &self,
        url: &Url,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Endpoint> {
        Arc::new(WsEndpoint::new(url.clone(), events))
    }
}

/// An endpoint driven by hand. Frames sent by the client are recorded;
/// the test feeds transport events back through the same channel the
/// connection reads.
pub struct MockEndpoint {
    pub url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<String>>,
    open_calls: Mutex<usize>,
}

impl MockEndpoint {
    /// Every frame the client sent, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn last_sent(&self) -> Option<String> {
        self.sent.lock().last().cloned()
    }

    /// How many times the connection (re)opened this endpoint.
    pub fn open_calls(&self) -> usize {
        *self.open_calls.lock()
    }

    pub fn emit_open(&self) {
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn emit_frame(&self, frame: &str) {
        let _ = self.events.send(TransportEvent::Frame(frame.to_string()));
    }

    pub fn emit_error(&self, error: &str) {
        let _ = self.events.send(TransportEvent::Error(error.to_string()));
    }

    pub fn emit_closed(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Endpoint for MockEndpoint {
    fn open(&self) {
        *self.open_calls.lock() += 1;
    }

    fn send(&self, frame: String) {
        self.sent.lock().push(frame);
    }

    fn close(&self) {}

    fn force_close(&self) {}
}

/// Factory that records every [`MockEndpoint`] it hands out so tests can
/// reach the one currently driving the connection.
#[derive(Default)]
pub struct MockEndpointFactory {
    endpoints: Mutex<Vec<Arc<MockEndpoint>>>,
}

impl MockEndpointFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEndpointFactory::default())
    }

    pub fn latest(&self) -> Option<Arc<MockEndpoint>> {
        self.endpoints.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.endpoints.lock().len()
    }
}

impl EndpointFactory for Arc<MockEndpointFactory> {
    fn create(
        &self,
        url: &Url,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Endpoint> {
        let endpoint = Arc::new(MockEndpoint {
            url: url.clone(),
            events,
            sent: Mutex::new(Vec::new()),
            open_calls: Mutex::new(0),
        });
        self.endpoints.lock().push(Arc::clone(&endpoint));
        endpoint
    }
}
