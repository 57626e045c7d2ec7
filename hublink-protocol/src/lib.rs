//! # hublink-protocol — framed text wire protocol
//!
//! The hub speaks a framed text protocol over any ordered text transport.
//! A frame carries one or more messages; each message is a topic letter,
//! an action letter and a sequence of text fields:
//!
//! ```text
//! ┌───────┬────┬────────┬────┬────────┬─────┬────────┬────┐
//! │ TOPIC │ US │ ACTION │ US │ FIELD₁ │ ... │ FIELDₙ │ RS │
//! └───────┴────┴────────┴────┴────────┴─────┴────────┴────┘
//! US = 0x1F (unit separator), RS = 0x1E (record separator)
//! ```
//!
//! Payload fields that carry values are *typed*: a one-letter prefix
//! followed by the payload (`S` string, `N` number, `O` JSON document,
//! `T`/`F` booleans, `L` null, `U` undefined).
//!
//! ## Modules
//!
//! - [`message`] — [`Topic`], [`Action`] and [`Message`]
//! - [`codec`] — frame encoding and decoding
//! - [`typed`] — typed value encoding and decoding
//! - [`error`] — [`ParseError`]

pub mod codec;
pub mod error;
pub mod message;
pub mod typed;

pub use codec::{build, build_raw, decode, encode};
pub use error::ParseError;
pub use message::{Action, Message, Topic};
pub use typed::{from_typed, to_typed, TypedValue};

/// Unit separator: delimits topic, action and data fields inside a message.
pub const PART_SEPARATOR: char = '\u{1f}';

/// Record separator: terminates each message inside a frame.
pub const MESSAGE_SEPARATOR: char = '\u{1e}';
