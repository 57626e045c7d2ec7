use thiserror::Error;

/// Errors raised while decoding frames or typed values.
///
/// A parse error condemns a single message, never the connection: the
/// decoder keeps going with the remaining messages in the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message too short: {0:?}")]
    TooShort(String),

    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("empty typed value")]
    EmptyTyped,

    #[error("unknown type prefix {0:?}")]
    UnknownTypePrefix(char),

    #[error("invalid number payload {0:?}")]
    InvalidNumber(String),

    #[error("invalid json payload: {0}")]
    InvalidJson(String),
}
