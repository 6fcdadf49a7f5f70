//! Outbound sends with optional acknowledgement tracking.
//!
//! DESIGN
//! ======
//! Every send bumps a per-connection message counter. When an ack is
//! requested the counter value becomes the ack id and a [`PendingAck`] is
//! recorded with a deadline. The driver sleeps until [`ReliableSender::next_deadline`]
//! and calls [`ReliableSender::expire_at`]; removing an entry is what
//! "cancelling its timer" means here.
//!
//! There is no retry. An expired ack is reported once and forgotten.
//!
//! A pending entry is only recorded after the frame was handed to the
//! transport, so a failed send never leaves state behind.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use frames::{ClientKind, WireMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::transport::Transport;

/// Ack round-trip samples kept for diagnostics.
pub const DEFAULT_ACK_WINDOW: usize = 50;

/// An acked send awaiting its receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAck {
    pub ack_id: u64,
    pub sent_at: Instant,
    pub deadline: Instant,
    pub kind: ClientKind,
    pub payload: Value,
}

/// A pending ack whose deadline passed.
#[derive(Debug, Clone, PartialEq)]
pub struct AckTimeout {
    pub ack_id: u64,
    pub elapsed: Duration,
    pub kind: ClientKind,
    pub payload: Value,
}

impl AckTimeout {
    /// `{timeout, elapsed, message, payload}` detail for error reporting.
    #[must_use]
    pub fn detail(&self) -> Value {
        serde_json::json!({
            "timeout": true,
            "elapsed": duration_ms(self.elapsed),
            "message": self.kind.as_str(),
            "payload": self.payload,
        })
    }

    #[must_use]
    pub fn to_error(&self) -> ClientError {
        ClientError::AckTimeout { ack_id: self.ack_id, elapsed: self.elapsed }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    /// Ack id, when one was requested.
    pub ack: Option<u64>,
    /// The exact text handed to the transport.
    pub text: String,
}

/// Diagnostic counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    pub messages_sent: u64,
    pub pending_acks: usize,
    pub mean_ack_ms: u64,
    pub ack_durations_ms: Vec<u64>,
}

pub struct ReliableSender {
    default_ack: bool,
    ack_timeout: Duration,
    message_count: u64,
    pending: BTreeMap<u64, PendingAck>,
    durations: VecDeque<Duration>,
    window: usize,
}

impl ReliableSender {
    #[must_use]
    pub fn new(default_ack: bool, ack_timeout: Duration, window: usize) -> Self {
        Self {
            default_ack,
            ack_timeout,
            message_count: 0,
            pending: BTreeMap::new(),
            durations: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Serialize and send one message.
    ///
    /// `ack` overrides the connection-wide default when set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] when the payload cannot be encoded
    /// and [`ClientError::Transport`] when the transport rejects the frame.
    pub fn send_at<T: Serialize + ?Sized>(
        &mut self,
        transport: &mut dyn Transport,
        kind: ClientKind,
        payload: &T,
        ack: Option<bool>,
        now: Instant,
    ) -> Result<Sent, ClientError> {
        self.message_count += 1;
        let ack_id = ack.unwrap_or(self.default_ack).then_some(self.message_count);

        let payload = frames::to_payload(payload)?;
        let message = WireMessage { ack: ack_id, kind, payload };
        let text = message.encode()?;
        transport.send_text(&text)?;

        if let Some(ack_id) = ack_id {
            self.pending.insert(
                ack_id,
                PendingAck {
                    ack_id,
                    sent_at: now,
                    deadline: now + self.ack_timeout,
                    kind,
                    payload: message.payload,
                },
            );
        }
        Ok(Sent { ack: ack_id, text })
    }

    /// Settle a pending ack. Returns the round-trip time.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when no pending entry matches.
    pub fn ack_at(&mut self, raw_id: &Value, now: Instant) -> Result<Duration, ClientError> {
        let entry = parse_ack_id(raw_id).and_then(|id| self.pending.remove(&id));
        let Some(entry) = entry else {
            return Err(ClientError::protocol(format!(
                "unexpected ack {raw_id}; either the message didn't request an ack or it was already received"
            )));
        };

        let elapsed = now.saturating_duration_since(entry.sent_at);
        self.durations.push_back(elapsed);
        while self.durations.len() > self.window {
            self.durations.pop_front();
        }
        Ok(elapsed)
    }

    /// Remove and return every pending ack whose deadline is at or before `now`.
    pub fn expire_at(&mut self, now: Instant) -> Vec<AckTimeout> {
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.ack_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| AckTimeout {
                ack_id: p.ack_id,
                elapsed: now.saturating_duration_since(p.sent_at),
                kind: p.kind,
                payload: p.payload,
            })
            .collect()
    }

    /// Earliest pending deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Drop every pending ack.
    pub fn shutdown(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn pending(&self, ack_id: u64) -> Option<&PendingAck> {
        self.pending.get(&ack_id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.message_count
    }

    #[must_use]
    pub fn stats(&self) -> SenderStats {
        let samples: Vec<u64> = self.durations.iter().copied().map(duration_ms).collect();
        let total: u64 = samples.iter().sum();
        let mean_ack_ms = if samples.is_empty() { 0 } else { total / samples.len() as u64 };
        SenderStats {
            messages_sent: self.message_count,
            pending_acks: self.pending.len(),
            mean_ack_ms,
            ack_durations_ms: samples,
        }
    }
}

fn parse_ack_id(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "sender_test.rs"]
mod tests;
