//! Frame encoding and decoding.
//!
//! A frame may concatenate any number of messages; the decoder yields a
//! result per message so a single malformed message can be reported
//! without dropping its neighbours. An empty trailing segment (the text
//! after the final record separator) is ignored.

use crate::error::ParseError;
use crate::message::{Action, Message, Topic};
use crate::{MESSAGE_SEPARATOR, PART_SEPARATOR};

/// Encode one message body without the trailing record separator.
pub fn build_raw(topic: Topic, action: Action, data: &[&str]) -> String {
    let mut out = String::with_capacity(
        4 + data.iter().map(|d| d.len() + 1).sum::<usize>() + action.as_str().len(),
    );
    out.push_str(topic.as_str());
    out.push(PART_SEPARATOR);
    out.push_str(action.as_str());
    for field in data {
        out.push(PART_SEPARATOR);
        out.push_str(field);
    }
    out
}

/// Encode one complete wire message, record separator included.
pub fn build(topic: Topic, action: Action, data: &[&str]) -> String {
    let mut out = build_raw(topic, action, data);
    out.push(MESSAGE_SEPARATOR);
    out
}

/// Encode a parsed [`Message`] back to its wire form.
pub fn encode(message: &Message) -> String {
    let mut out = message.raw.clone();
    out.push(MESSAGE_SEPARATOR);
    out
}

/// Decode a frame into its messages.
pub fn decode(frame: &str) -> Vec<Result<Message, ParseError>> {
    frame
        .split(MESSAGE_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(decode_one)
        .collect()
}

/// Decode a single message body (no record separator).
pub fn decode_one(raw: &str) -> Result<Message, ParseError> {
    let mut parts = raw.split(PART_SEPARATOR);
    let topic = parts
        .next()
        .ok_or_else(|| ParseError::TooShort(raw.to_string()))?;
    let action = parts
        .next()
        .ok_or_else(|| ParseError::TooShort(raw.to_string()))?;
    if action.is_empty() {
        return Err(ParseError::TooShort(raw.to_string()));
    }
    let topic: Topic = topic.parse()?;
    let action: Action = action.parse()?;
    Ok(Message {
        topic,
        action,
        data: parts.map(str::to_string).collect(),
        raw: raw.to_string(),
    })
}
