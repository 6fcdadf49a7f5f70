//! Client error taxonomy.
//!
//! DESIGN
//! ======
//! Argument-style errors (`Argument`, `Capacity`, `DuplicatePath`,
//! `NotAuthenticated`) are returned synchronously from the call that caused
//! them. Everything else is produced while the connection runs and is
//! funnelled through the session's failure path, which hands it to the error
//! callback and publishes it on the reserved `error` topic.

use std::time::Duration;

use serde_json::Value;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Grepable error code for structured error payloads.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

/// Errors produced by the push client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Malformed caller input.
    #[error("bad arguments: {0}")]
    Argument(String),

    /// The subscription table is full.
    #[error("max number of subscriptions ({max}) reached; unable to add more")]
    Capacity { max: usize },

    /// A subscription for the path already exists on this connection.
    #[error("subscription '{0}' already added")]
    DuplicatePath(String),

    /// Server subscriptions require an authenticated session.
    #[error("cannot create subscriptions until authenticated")]
    NotAuthenticated,

    /// Malformed frame or protocol violation by the server.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Sending on or closing the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No auth response arrived in time.
    #[error("server failed to authenticate within {}ms", .elapsed.as_millis())]
    AuthTimeout { elapsed: Duration },

    /// No ack arrived in time for an acked send.
    #[error("no ack received for message {ack_id} after {}ms", .elapsed.as_millis())]
    AckTimeout { ack_id: u64, elapsed: Duration },

    /// The server signalled rate limiting.
    #[error("server is applying rate limits")]
    RateLimit { info: Value },

    /// A subscriber, auth callback or payload handler failed.
    #[error("{context}: {source}")]
    Runtime {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The connection task has finished; the handle can no longer reach it.
    #[error("connection closed")]
    Closed,
}

impl ClientError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub(crate) fn runtime(context: impl Into<String>, source: BoxError) -> Self {
        Self::Runtime { context: context.into(), source }
    }

    /// True for ack and auth expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AuthTimeout { .. } | Self::AckTimeout { .. })
    }

    /// Structured form published on the `error` topic.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "code": self.error_code(),
            "message": self.to_string(),
        })
    }
}

impl ErrorCode for ClientError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Argument(_) => "E_BAD_ARGUMENTS",
            Self::Capacity { .. } => "E_CAPACITY",
            Self::DuplicatePath(_) => "E_DUPLICATE_PATH",
            Self::NotAuthenticated => "E_NOT_AUTHENTICATED",
            Self::Protocol { .. } => "E_PROTOCOL",
            Self::Transport(_) => "E_TRANSPORT",
            Self::AuthTimeout { .. } | Self::AckTimeout { .. } => "E_TIMEOUT",
            Self::RateLimit { .. } => "E_RATE_LIMIT",
            Self::Runtime { .. } => "E_RUNTIME",
            Self::Closed => "E_CLOSED",
        }
    }
}

impl From<frames::CodecError> for ClientError {
    fn from(err: frames::CodecError) -> Self {
        match err {
            frames::CodecError::Encode(_) => Self::Argument(err.to_string()),
            _ => Self::protocol(err.to_string()),
        }
    }
}
