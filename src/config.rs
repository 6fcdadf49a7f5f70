//! Client configuration.
//!
//! Defaults are carried-over policy values, not derived ones; every timeout
//! is tunable.

use std::time::Duration;

use crate::error::ClientError;

pub const DEFAULT_CENTRAL_ORIGIN: &str = "central.printnode.com";
pub const DEFAULT_FALLBACK_HOST: &str = "api.printnode.com";
pub const PROTOCOL_VERSION: &str = "0.1.0";
pub const DEFAULT_SCHEME: &str = "wss";
pub const DEFAULT_DISCOVERY_SCHEME: &str = "https";
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Credential sent with `authenticate` and used for discovery.
    pub api_key: String,
    /// Explicit host; skips discovery when set.
    pub server: Option<String>,
    pub central_origin: String,
    pub fallback_host: String,
    pub version: String,
    /// WebSocket scheme (`wss` or `ws`).
    pub scheme: String,
    /// HTTP scheme for discovery hops.
    pub discovery_scheme: String,
    /// Request acks on every send unless overridden per call.
    pub ack: bool,
    pub ack_timeout: Duration,
    pub auth_timeout: Duration,
    pub discovery_timeout: Duration,
    /// How long to wait for the peer to answer our close frame.
    pub close_timeout: Duration,
    /// Ack latency samples kept for diagnostics.
    pub ack_window: usize,
}

impl ClientConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            server: None,
            central_origin: DEFAULT_CENTRAL_ORIGIN.to_owned(),
            fallback_host: DEFAULT_FALLBACK_HOST.to_owned(),
            version: PROTOCOL_VERSION.to_owned(),
            scheme: DEFAULT_SCHEME.to_owned(),
            discovery_scheme: DEFAULT_DISCOVERY_SCHEME.to_owned(),
            ack: false,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
            discovery_timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            ack_window: crate::sender::DEFAULT_ACK_WINDOW,
        }
    }

    /// Build config from environment variables.
    ///
    /// Required:
    /// - `PUSHLINK_API_KEY`
    ///
    /// Optional:
    /// - `PUSHLINK_SERVER`: explicit host, disables discovery
    /// - `PUSHLINK_CENTRAL_ORIGIN`: discovery origin
    /// - `PUSHLINK_ACK`: `true` to ack every send
    /// - `PUSHLINK_ACK_TIMEOUT_MS`: default 10000
    /// - `PUSHLINK_AUTH_TIMEOUT_MS`: default 5000
    /// - `PUSHLINK_DISCOVERY_TIMEOUT_MS`: default 5000
    /// - `PUSHLINK_CLOSE_TIMEOUT_MS`: default 2000
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] when the API key is missing.
    pub fn from_env() -> Result<Self, ClientError> {
        let api_key = std::env::var("PUSHLINK_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ClientError::Argument("PUSHLINK_API_KEY not set".into()))?;

        let mut config = Self::new(api_key);
        config.server = std::env::var("PUSHLINK_SERVER").ok().filter(|s| !s.is_empty());
        if let Ok(origin) = std::env::var("PUSHLINK_CENTRAL_ORIGIN") {
            if !origin.is_empty() {
                config.central_origin = origin;
            }
        }
        config.ack = env_parse("PUSHLINK_ACK", false);
        config.ack_timeout = Duration::from_millis(env_parse("PUSHLINK_ACK_TIMEOUT_MS", DEFAULT_ACK_TIMEOUT_MS));
        config.auth_timeout = Duration::from_millis(env_parse("PUSHLINK_AUTH_TIMEOUT_MS", DEFAULT_AUTH_TIMEOUT_MS));
        config.discovery_timeout =
            Duration::from_millis(env_parse("PUSHLINK_DISCOVERY_TIMEOUT_MS", DEFAULT_DISCOVERY_TIMEOUT_MS));
        config.close_timeout = Duration::from_millis(env_parse("PUSHLINK_CLOSE_TIMEOUT_MS", DEFAULT_CLOSE_TIMEOUT_MS));
        Ok(config)
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Check caller input before anything is opened.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for an empty credential, a zero
    /// timeout, or an unknown scheme.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.is_empty() {
            return Err(ClientError::Argument("api_key must not be empty".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(ClientError::Argument("ack_timeout must be positive".into()));
        }
        if self.auth_timeout.is_zero() {
            return Err(ClientError::Argument("auth_timeout must be positive".into()));
        }
        if self.discovery_timeout.is_zero() {
            return Err(ClientError::Argument("discovery_timeout must be positive".into()));
        }
        if self.close_timeout.is_zero() {
            return Err(ClientError::Argument("close_timeout must be positive".into()));
        }
        if !matches!(self.scheme.as_str(), "ws" | "wss") {
            return Err(ClientError::Argument(format!("unsupported scheme '{}'", self.scheme)));
        }
        if !matches!(self.discovery_scheme.as_str(), "http" | "https") {
            return Err(ClientError::Argument(format!(
                "unsupported discovery scheme '{}'",
                self.discovery_scheme
            )));
        }
        Ok(())
    }

    /// WebSocket URL for `host`.
    #[must_use]
    pub fn ws_url(&self, host: &str) -> String {
        format!("{}://{host}/ws/{}", self.scheme, self.version)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
