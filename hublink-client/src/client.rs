//! The client façade.
//!
//! Owns the connection, the shared context and the four domain handlers,
//! and surfaces the small API applications program against. Creating a
//! client starts connecting immediately; `login` completes the handshake
//! once the hub asks for credentials.

use std::sync::Arc;

use serde_json::Value;

use hublink_protocol::Topic;

use crate::config::ClientConfig;
use crate::connection::{Connection, LoginResult, MessageSender};
use crate::context::ClientContext;
use crate::endpoint::{parse_url, EndpointFactory, WsEndpointFactory};
use crate::error::{ClientError, ErrorEvent};
use crate::events::EventHandler;
use crate::presence::PresenceHandler;
use crate::record::RecordHandler;
use crate::rpc::RpcHandler;
use crate::state::{ConnectionState, GlobalConnectivityState};

/// Cloning is cheap and yields a handle to the same client.
#[derive(Clone)]
pub struct Client {
    /// Publish/subscribe events.
    pub event: EventHandler,
    /// Remote procedure calls.
    pub rpc: RpcHandler,
    /// Versioned records, lists and anonymous records.
    pub record: RecordHandler,
    /// Peer presence.
    pub presence: PresenceHandler,
    ctx: Arc<ClientContext>,
    connection: Connection,
}

impl Client {
    /// Connect to a hub with default configuration.
    ///
    /// Must be called within a tokio runtime; the client spawns its
    /// dispatcher tasks on it.
    pub fn new(url: &str) -> Result<Client, ClientError> {
        Client::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Client, ClientError> {
        Client::with_endpoint_factory(url, config, Box::new(WsEndpointFactory))
    }

    /// Construct with a custom transport. Tests drive the client through
    /// a [`crate::endpoint::MockEndpointFactory`].
    pub fn with_endpoint_factory(
        url: &str,
        config: ClientConfig,
        factory: Box<dyn EndpointFactory>,
    ) -> Result<Client, ClientError> {
        // Fail fast on a url the connection could never open.
        parse_url(url, &config.path)?;

        let ctx = ClientContext::new(config);
        let connection = Connection::new(url, Arc::clone(&ctx), factory);
        let sender: Arc<dyn MessageSender> = Arc::new(connection.clone());

        let event = EventHandler::new(Arc::clone(&ctx), Arc::clone(&sender));
        let rpc = RpcHandler::new(Arc::clone(&ctx), Arc::clone(&sender));
        let record = RecordHandler::new(Arc::clone(&ctx), Arc::clone(&sender));
        let presence = PresenceHandler::new(Arc::clone(&ctx), Arc::clone(&sender));

        connection.start(
            Arc::new(event.clone()),
            Arc::new(rpc.clone()),
            Arc::new(record.clone()),
            Arc::new(presence.clone()),
        );

        Ok(Client {
            event,
            rpc,
            record,
            presence,
            ctx,
            connection,
        })
    }

    /// Authenticate against the hub. Resolves once the hub accepted or
    /// rejected the credentials.
    pub async fn login(&self, params: Option<Value>) -> LoginResult {
        let rx = self.connection.authenticate(params);
        rx.await.unwrap_or(LoginResult {
            logged_in: false,
            error_event: Some(ErrorEvent::IsClosed),
            data: None,
        })
    }

    /// Close deliberately: cancel timers, wake pending calls with
    /// `IsClosed`, drop the endpoint.
    pub fn close(&self) {
        self.connection.close(true);
        self.ctx.acks.clear_all();
        self.rpc.abort_pending();
        self.presence.shutdown();
        self.record.shutdown();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Observe every connection state transition. Returns a listener id
    /// for [`remove_connection_state_listener`](Self::remove_connection_state_listener).
    pub fn on_connection_state_changed<F>(&self, listener: F) -> u64
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.ctx.state.add_listener(Arc::new(listener))
    }

    pub fn remove_connection_state_listener(&self, id: u64) {
        self.ctx.state.remove_listener(id);
    }

    /// Install the sink for server- and timer-originated errors.
    pub fn set_runtime_error_handler<F>(&self, handler: F)
    where
        F: Fn(Option<Topic>, &ErrorEvent, &str) + Send + Sync + 'static,
    {
        self.ctx.errors.set_handler(Some(Box::new(handler)));
    }

    /// Report network reachability, e.g. from platform connectivity
    /// callbacks. `Disconnected` parks reconnection entirely.
    pub fn set_global_connectivity_state(&self, state: GlobalConnectivityState) {
        self.connection.set_global_connectivity_state(state);
    }

    /// A client-unique monotonically increasing id.
    pub fn uid(&self) -> String {
        self.ctx.next_uid()
    }
}
