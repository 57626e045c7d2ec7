//! Topics, actions and the parsed message representation.

use std::fmt;
use std::str::FromStr;

use crate::codec;
use crate::error::ParseError;

/// The seven message topics. Every message belongs to exactly one; the
/// client routes inbound messages to a per-topic dispatcher by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connection lifecycle: challenge, ping/pong, redirects.
    Connection,
    /// Authentication exchange.
    Auth,
    /// Generic errors that belong to no other topic.
    Error,
    /// Fire-and-forget publish/subscribe events.
    Event,
    /// Versioned, replicated JSON documents.
    Record,
    /// Request/response calls routed through the hub.
    Rpc,
    /// Peer login/logout notifications.
    Presence,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Connection => "C",
            Topic::Auth => "A",
            Topic::Error => "X",
            Topic::Event => "E",
            Topic::Record => "R",
            Topic::Rpc => "P",
            Topic::Presence => "U",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "C" => Topic::Connection,
            "A" => Topic::Auth,
            "X" => Topic::Error,
            "E" => Topic::Event,
            "R" => Topic::Record,
            "P" => Topic::Rpc,
            "U" => Topic::Presence,
            other => return Err(ParseError::UnknownTopic(other.to_string())),
        })
    }
}

macro_rules! actions {
    ($($variant:ident => $code:literal, $name:literal),+ $(,)?) => {
        /// Protocol actions with their wire codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Action {
            $($variant,)+
        }

        impl Action {
            /// The one-to-four letter wire code.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Action::$variant => $code,)+
                }
            }

            /// The spelled-out action name, used in diagnostics.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Action::$variant => $name,)+
                }
            }
        }

        impl FromStr for Action {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(match s {
                    $($code => Action::$variant,)+
                    other => return Err(ParseError::UnknownAction(other.to_string())),
                })
            }
        }
    };
}

actions! {
    Ack => "A", "ACK",
    Error => "E", "ERROR",
    Event => "EVT", "EVENT",
    Subscribe => "S", "SUBSCRIBE",
    Unsubscribe => "US", "UNSUBSCRIBE",
    Listen => "L", "LISTEN",
    Unlisten => "UL", "UNLISTEN",
    ListenAccept => "LA", "LISTEN_ACCEPT",
    ListenReject => "LR", "LISTEN_REJECT",
    SubscriptionHasProvider => "SP", "SUBSCRIPTION_HAS_PROVIDER",
    SubscriptionForPatternFound => "SF", "SUBSCRIPTION_FOR_PATTERN_FOUND",
    SubscriptionForPatternRemoved => "SR", "SUBSCRIPTION_FOR_PATTERN_REMOVED",
    Query => "Q", "QUERY",
    PresenceJoin => "PNJ", "PRESENCE_JOIN",
    PresenceLeave => "PNL", "PRESENCE_LEAVE",
    CreateOrRead => "CR", "CREATEORREAD",
    Read => "R", "READ",
    Update => "U", "UPDATE",
    Patch => "P", "PATCH",
    Delete => "D", "DELETE",
    Snapshot => "SN", "SNAPSHOT",
    Has => "H", "HAS",
    WriteAcknowledgement => "WA", "WRITE_ACKNOWLEDGEMENT",
    VersionExists => "VE", "VERSION_EXISTS",
    Ping => "PI", "PING",
    Pong => "PO", "PONG",
    Challenge => "CH", "CHALLENGE",
    ChallengeResponse => "CHR", "CHALLENGE_RESPONSE",
    Redirect => "RED", "REDIRECT",
    Rejection => "REJ", "REJECTION",
    Request => "REQ", "REQUEST",
    Response => "RES", "RESPONSE",
    TooManyAuthAttempts => "TMAA", "TOO_MANY_AUTH_ATTEMPTS",
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded protocol message.
///
/// `raw` keeps the original encoded text (without the trailing record
/// separator); unsolicited-message reports quote it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
    pub raw: String,
}

impl Message {
    /// Build a message from its parts, deriving `raw` from the encoding.
    pub fn new<S: Into<String>>(topic: Topic, action: Action, data: Vec<S>) -> Self {
        let data: Vec<String> = data.into_iter().map(Into::into).collect();
        let raw = codec::build_raw(
            topic,
            action,
            &data.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        Message {
            topic,
            action,
            data,
            raw,
        }
    }

    /// Field accessor that tolerates short payloads.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.data.get(index).map(String::as_str)
    }
}
