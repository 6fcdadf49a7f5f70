//! Well-known server subscription paths and their payload types.
//!
//! Each factory builds a [`NewSubscription`] with the canonical path, a
//! transform that normalizes the payload into its typed shape, and the extra
//! local topic the transformed payload is republished on. Queries are enums,
//! so an unsupported option combination cannot be expressed.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BoxError, ClientError};
use crate::subscriptions::{NewSubscription, ServerHandler, transform};

pub const SCALES_TOPIC: &str = "scales";
pub const COMPUTER_CONNECTIONS_TOPIC: &str = "computers.connections";

// =============================================================================
// QUERIES
// =============================================================================

/// Which scales to watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScalesQuery {
    /// Every scale on the account.
    #[default]
    All,
    Computer {
        computer_id: u64,
    },
    Device {
        computer_id: u64,
        device_name: String,
    },
    DeviceNum {
        computer_id: u64,
        device_name: String,
        device_num: u64,
    },
}

impl ScalesQuery {
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::All => build_path(&["scales"]),
            Self::Computer { computer_id } => build_path(&["computer", &computer_id.to_string(), "scales"]),
            Self::Device { computer_id, device_name } => {
                build_path(&["computer", &computer_id.to_string(), "scales", device_name])
            }
            Self::DeviceNum { computer_id, device_name, device_num } => build_path(&[
                "computer",
                &computer_id.to_string(),
                "scale",
                device_name,
                &device_num.to_string(),
            ]),
        }
    }
}

/// Which computers' connection state to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputerConnectionsQuery {
    #[default]
    All,
    Computer {
        computer_id: u64,
    },
}

impl ComputerConnectionsQuery {
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::All => build_path(&["computers", "connections"]),
            Self::Computer { computer_id } => build_path(&["computer", &computer_id.to_string(), "connections"]),
        }
    }
}

/// `/seg/seg/.../` with every segment percent-encoded.
fn build_path(segments: &[&str]) -> String {
    let mut path = String::from("/");
    for segment in segments {
        path.push_str(&encode_component(segment));
        path.push('/');
    }
    path
}

/// Percent-encode everything except the URI component unreserved set.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.!~*'()".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

// =============================================================================
// SCALES
// =============================================================================

/// One reading pushed by a scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalesMeasurement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_num: Option<u64>,
    /// `[mass, uncertainty]` in micrograms; either may be absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<Vec<Option<i64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_reported_create_timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScalesMeasurement {
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when the payload has the wrong shape.
    pub fn from_value(raw: &Value) -> Result<Self, ClientError> {
        Self::deserialize(raw).map_err(|e| ClientError::protocol(format!("invalid scales measurement: {e}")))
    }

    /// Time between the client stamping the reading and `now`.
    #[must_use]
    pub fn latency_at(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.client_reported_create_timestamp.map(|created| now - created)
    }

    #[must_use]
    pub fn latency(&self) -> Option<TimeDelta> {
        self.latency_at(Utc::now())
    }
}

fn scales_transform(raw: &Value) -> Result<Value, BoxError> {
    let measurement = ScalesMeasurement::from_value(raw)?;
    Ok(serde_json::to_value(measurement)?)
}

/// Subscription for scale measurements, republished on `scales`.
#[must_use]
pub fn scales_subscription(
    query: &ScalesQuery,
    callback: Option<ServerHandler>,
    context: Option<Value>,
) -> NewSubscription {
    let mut request = NewSubscription::new(query.path())
        .transform(transform(scales_transform))
        .topic(SCALES_TOPIC);
    request.callback = callback;
    request.context = context;
    request
}

// =============================================================================
// COMPUTER CONNECTIONS
// =============================================================================

/// One client connection of a computer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Connections currently held by one computer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputerConnections {
    pub account_id: i64,
    pub computer_id: i64,
    pub connections: Vec<Connection>,
}

impl ComputerConnections {
    /// Validate a server payload.
    ///
    /// A connection reporting a different computer id is rejected, except
    /// that a computer id of `0` adopts the first positive id seen.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] for non-integer ids, a missing
    /// connections array, or inconsistent computer ids.
    pub fn from_value(raw: &Value) -> Result<Self, ClientError> {
        let connections = raw
            .get("connections")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::protocol("computer connections: 'connections' is not an array"))?;
        let account_id = raw
            .get("accountId")
            .and_then(Value::as_i64)
            .ok_or_else(|| ClientError::protocol("computer connections: 'accountId' is not an integer"))?;
        let computer_id = raw
            .get("computerId")
            .and_then(Value::as_i64)
            .ok_or_else(|| ClientError::protocol("computer connections: 'computerId' is not an integer"))?;

        let mut out = Self { account_id, computer_id, connections: Vec::with_capacity(connections.len()) };
        for item in connections {
            let connection = Connection::deserialize(item)
                .map_err(|e| ClientError::protocol(format!("computer connections: invalid connection: {e}")))?;
            out.add(connection)?;
        }
        Ok(out)
    }

    fn add(&mut self, connection: Connection) -> Result<(), ClientError> {
        match connection.computer_id {
            Some(id) if id == self.computer_id => {}
            Some(id) if self.computer_id == 0 && id > 0 => self.computer_id = id,
            other => {
                return Err(ClientError::protocol(format!(
                    "computer connections: connection for computer {other:?} in list for computer {}",
                    self.computer_id
                )));
            }
        }
        self.connections.push(connection);
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }
}

fn computer_connections_transform(raw: &Value) -> Result<Value, BoxError> {
    let connections = ComputerConnections::from_value(raw)?;
    Ok(serde_json::to_value(connections)?)
}

/// Subscription for computer connection changes, republished on
/// `computers.connections`.
#[must_use]
pub fn computer_connections_subscription(
    query: &ComputerConnectionsQuery,
    callback: Option<ServerHandler>,
    context: Option<Value>,
) -> NewSubscription {
    let mut request = NewSubscription::new(query.path())
        .transform(transform(computer_connections_transform))
        .topic(COMPUTER_CONNECTIONS_TOPIC);
    request.callback = callback;
    request.context = context;
    request
}

#[cfg(test)]
#[path = "paths_test.rs"]
mod tests;
