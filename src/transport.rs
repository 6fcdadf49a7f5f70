//! Outbound transport seam.
//!
//! The session core never touches a socket. It writes through [`Transport`],
//! which the tokio driver backs with a channel drained by the WebSocket
//! writer task.

use tokio::sync::mpsc;

use crate::error::ClientError;

/// Synchronous outbound half of a connection.
pub trait Transport {
    /// Queue one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when the connection cannot carry it.
    fn send_text(&mut self, text: &str) -> Result<(), ClientError>;

    /// Ask the connection to close.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the close could not be requested.
    fn close(&mut self) -> Result<(), ClientError>;
}

/// Work item for the WebSocket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// [`Transport`] backed by an unbounded channel to the writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx }
    }

    /// Build a transport plus the receiver the writer task drains.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.tx
            .send(Outgoing::Text(text.to_owned()))
            .map_err(|_| ClientError::Transport("send failed; the socket is not open".into()))
    }

    fn close(&mut self) -> Result<(), ClientError> {
        self.tx
            .send(Outgoing::Close)
            .map_err(|_| ClientError::Transport("close failed; the socket writer is gone".into()))
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
