//! Wire framing for the realtime push protocol.
//!
//! This crate owns the text representation exchanged with the push service.
//! Every message, in either direction, is a JSON array of exactly three
//! elements:
//!
//! - outbound: `[ackId | null, type, payload]`
//! - inbound: `[category, tag, payload]`, where `category` is one of
//!   `system`, `protocol` or `publish`. For `publish` the tag slot carries the
//!   server-supplied topic list and the payload is `[subscriptionId, body]`.
//!
//! Payloads stay flexible (`serde_json::Value`); interpreting them is the
//! caller's business.

use serde::Serialize;
use serde_json::Value;

/// Inbound category for server housekeeping messages.
pub const CATEGORY_SYSTEM: &str = "system";
/// Inbound category for protocol-level messages (acks).
pub const CATEGORY_PROTOCOL: &str = "protocol";
/// Inbound category for subscription publishes.
pub const CATEGORY_PUBLISH: &str = "publish";

/// Error returned by the encode/decode functions.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The inbound text is not valid JSON.
    #[error("server->client message not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    /// The inbound JSON value is not an array.
    #[error("server->client message framing error: not an array")]
    NotArray,
    /// The inbound array does not have exactly three elements.
    #[error("server->client message framing error: {0} elements, expected 3")]
    Arity(usize),
    /// An outbound payload could not be represented as JSON.
    #[error("not possible to JSON encode message payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Message types the client is allowed to originate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Credential handshake, sent once per connection.
    Authenticate,
    /// Register a server-mirrored subscription: payload `[id, path]`.
    Subscribe,
    /// Drop server-mirrored subscriptions: payload `[ids...]`.
    Unsubscribe,
}

impl ClientKind {
    /// Wire tag for this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outbound message: `(ack id or absent, type tag, payload)`.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    /// Ack id when the sender wants a receipt.
    pub ack: Option<u64>,
    /// Message type.
    pub kind: ClientKind,
    /// Already-serialized payload.
    pub payload: Value,
}

impl WireMessage {
    /// Render the message as its wire text.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(&(self.ack, self.kind.as_str(), &self.payload)).map_err(CodecError::Encode)
    }
}

/// Convert an arbitrary serializable payload into a JSON value.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] for values JSON cannot represent (for
/// example maps with non-string keys).
pub fn to_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Value, CodecError> {
    serde_json::to_value(payload).map_err(CodecError::Encode)
}

/// A decoded inbound triple, not yet classified.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    /// First slot: the category tag.
    pub category: Value,
    /// Second slot: the sub-tag (or topic list for publishes).
    pub tag: Value,
    /// Third slot: the payload.
    pub payload: Value,
}

/// Parse inbound text into a raw triple.
///
/// # Errors
///
/// Returns a [`CodecError`] when the text is not JSON, not an array, or does
/// not have exactly three elements.
pub fn decode_frame(text: &str) -> Result<RawFrame, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(CodecError::Parse)?;
    let Value::Array(items) = value else {
        return Err(CodecError::NotArray);
    };
    let [category, tag, payload] =
        <[Value; 3]>::try_from(items).map_err(|items| CodecError::Arity(items.len()))?;
    Ok(RawFrame { category, tag, payload })
}

/// Parse and classify inbound text in one step.
///
/// # Errors
///
/// Same as [`decode_frame`].
pub fn decode(text: &str) -> Result<Inbound, CodecError> {
    decode_frame(text).map(RawFrame::classify)
}

/// Classified inbound message over the fixed two-level vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// `system.*` housekeeping.
    System(SystemEvent),
    /// `protocol.*` plumbing.
    Protocol(ProtocolEvent),
    /// A subscription publish.
    Publish(PublishEvent),
    /// Category outside the vocabulary.
    Unknown { category: String },
}

/// `system` sub-tags.
#[derive(Clone, Debug, PartialEq)]
pub enum SystemEvent {
    /// Reply to `authenticate`; an `error` key marks failure.
    AuthenticateResponse(Value),
    /// Server liveness flag.
    Hi(bool),
    /// Server is applying rate limits.
    RateLimit(Value),
    /// Sub-tag outside the vocabulary.
    Unknown { tag: String, payload: Value },
}

/// `protocol` sub-tags.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    /// Receipt for a previously sent message. The id is kept raw so a
    /// malformed id can still be reported as an unexpected ack.
    Ack(Value),
    /// Sub-tag outside the vocabulary.
    Unknown { tag: String, payload: Value },
}

/// Body of a `publish` message.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishEvent {
    /// Server-supplied local topics to republish on.
    pub topics: Vec<String>,
    /// Target subscription; `None` when the payload is malformed.
    pub subscription_id: Option<u64>,
    /// The subscription payload.
    pub payload: Value,
}

impl RawFrame {
    /// Classify the triple. Never fails: anything unrecognized becomes an
    /// `Unknown` variant for the caller to log.
    #[must_use]
    pub fn classify(self) -> Inbound {
        let Self { category, tag, payload } = self;
        match category.as_str() {
            Some(CATEGORY_SYSTEM) => Inbound::System(classify_system(tag, payload)),
            Some(CATEGORY_PROTOCOL) => Inbound::Protocol(classify_protocol(tag, payload)),
            Some(CATEGORY_PUBLISH) => Inbound::Publish(classify_publish(tag, payload)),
            Some(other) => Inbound::Unknown { category: other.to_owned() },
            None => Inbound::Unknown { category: category.to_string() },
        }
    }
}

fn classify_system(tag: Value, payload: Value) -> SystemEvent {
    match tag.as_str() {
        Some("authenticateResponse") => SystemEvent::AuthenticateResponse(payload),
        Some("hi") => SystemEvent::Hi(payload.as_bool().unwrap_or(false)),
        Some("rateLimit") => SystemEvent::RateLimit(payload),
        _ => SystemEvent::Unknown { tag: tag_name(&tag), payload },
    }
}

fn classify_protocol(tag: Value, payload: Value) -> ProtocolEvent {
    match tag.as_str() {
        Some("ack") => ProtocolEvent::Ack(payload),
        _ => ProtocolEvent::Unknown { tag: tag_name(&tag), payload },
    }
}

fn classify_publish(tag: Value, payload: Value) -> PublishEvent {
    let topics = match tag {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|t| match t {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let (subscription_id, payload) = match payload {
        Value::Array(mut parts) if parts.len() == 2 => {
            let body = parts.pop().unwrap_or(Value::Null);
            (parts[0].as_u64(), body)
        }
        other => (None, other),
    };

    PublishEvent { topics, subscription_id, payload }
}

fn tag_name(tag: &Value) -> String {
    tag.as_str().map_or_else(|| tag.to_string(), ToOwned::to_owned)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
