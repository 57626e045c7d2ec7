//! Error events, user-facing errors and the runtime error sink.
//!
//! Failures reach the application on two routes. Errors provoked by the
//! caller's own invocation come back as `Result::Err`. Errors that
//! originate on the server or from a timer have no caller to return to;
//! those flow through the runtime error sink, an application-installed
//! callback of `(topic, event, message)`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use hublink_protocol::Topic;

use crate::state::{ConnectionState, StateBus};

/// Asynchronous error events, as they appear on the wire and in runtime
/// error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    ConnectionError,
    MessageParseError,
    UnsolicitedMessage,
    AckTimeout,
    ResponseTimeout,
    DeleteTimeout,
    VersionExists,
    NotSubscribed,
    ListenerExists,
    NotListening,
    MessageDenied,
    NotAuthenticated,
    TooManyAuthAttempts,
    IsClosed,
    /// An event name this client version does not know. Kept verbatim so
    /// servers can evolve without breaking older clients.
    Other(String),
}

impl ErrorEvent {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorEvent::ConnectionError => "CONNECTION_ERROR",
            ErrorEvent::MessageParseError => "MESSAGE_PARSE_ERROR",
            ErrorEvent::UnsolicitedMessage => "UNSOLICITED_MESSAGE",
            ErrorEvent::AckTimeout => "ACK_TIMEOUT",
            ErrorEvent::ResponseTimeout => "RESPONSE_TIMEOUT",
            ErrorEvent::DeleteTimeout => "DELETE_TIMEOUT",
            ErrorEvent::VersionExists => "VERSION_EXISTS",
            ErrorEvent::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorEvent::ListenerExists => "LISTENER_EXISTS",
            ErrorEvent::NotListening => "NOT_LISTENING",
            ErrorEvent::MessageDenied => "MESSAGE_DENIED",
            ErrorEvent::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorEvent::TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
            ErrorEvent::IsClosed => "IS_CLOSED",
            ErrorEvent::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> ErrorEvent {
        match name {
            "CONNECTION_ERROR" => ErrorEvent::ConnectionError,
            "MESSAGE_PARSE_ERROR" => ErrorEvent::MessageParseError,
            "UNSOLICITED_MESSAGE" => ErrorEvent::UnsolicitedMessage,
            "ACK_TIMEOUT" => ErrorEvent::AckTimeout,
            "RESPONSE_TIMEOUT" => ErrorEvent::ResponseTimeout,
            "DELETE_TIMEOUT" => ErrorEvent::DeleteTimeout,
            "VERSION_EXISTS" => ErrorEvent::VersionExists,
            "NOT_SUBSCRIBED" => ErrorEvent::NotSubscribed,
            "LISTENER_EXISTS" => ErrorEvent::ListenerExists,
            "NOT_LISTENING" => ErrorEvent::NotListening,
            "MESSAGE_DENIED" => ErrorEvent::MessageDenied,
            "NOT_AUTHENTICATED" => ErrorEvent::NotAuthenticated,
            "TOO_MANY_AUTH_ATTEMPTS" => ErrorEvent::TooManyAuthAttempts,
            "IS_CLOSED" => ErrorEvent::IsClosed,
            other => ErrorEvent::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned from user-initiated calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("The client's connection was closed")]
    IsClosed,

    #[error("record {0} has been destroyed, can't perform {1}")]
    RecordDestroyed(String, &'static str),

    #[error("anonymous record has no name, call set_name first")]
    AnonymousRecordUninitialized,

    #[error("Rpc {0} already completed")]
    RpcAlreadyCompleted(String),

    #[error("{0}")]
    Timeout(String),

    #[error("invalid url {0}: {1}")]
    InvalidUrl(String, String),

    #[error("{event}: {message}")]
    Server { event: ErrorEvent, message: String },

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("write rejected: {0}")]
    Write(String),
}

pub(crate) type RuntimeErrorHandler =
    dyn Fn(Option<Topic>, &ErrorEvent, &str) + Send + Sync;

/// The runtime error sink.
///
/// Reports are remapped the way the operator would diagnose them: a
/// request timeout while the connection still awaits authentication
/// almost always means the application never logged in, so it surfaces
/// as `NOT_AUTHENTICATED` instead of the raw timeout.
pub(crate) struct ErrorSink {
    state: Arc<StateBus>,
    handler: RwLock<Option<Box<RuntimeErrorHandler>>>,
}

impl ErrorSink {
    pub fn new(state: Arc<StateBus>) -> Self {
        ErrorSink {
            state,
            handler: RwLock::new(None),
        }
    }

    pub fn set_handler(&self, handler: Option<Box<RuntimeErrorHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn report(&self, topic: Option<Topic>, event: ErrorEvent, message: &str) {
        if matches!(event, ErrorEvent::AckTimeout | ErrorEvent::ResponseTimeout)
            && self.state.get() == ConnectionState::AwaitingAuthentication
        {
            self.report(
                Some(Topic::Error),
                ErrorEvent::NotAuthenticated,
                "Your message timed out because you're not authenticated. Have you called login()?",
            );
            return;
        }

        let handler = self.handler.read();
        match handler.as_ref() {
            Some(handler) => handler(topic, &event, message),
            None => log::error!(
                "unhandled runtime error on {:?}: {} {}",
                topic,
                event,
                message
            ),
        }
    }
}
