//! Endpoint discovery.
//!
//! DESIGN
//! ======
//! Two strictly sequential HTTP hops, each under its own timeout:
//!
//! 1. `GET {central}/v3/proxy?key=KEY` (basic auth, key as username) returns
//!    the proxy host as a JSON string.
//! 2. `GET {proxy}/v3/computeunit?key=KEY` returns `{ "httpPublicHost": .. }`.
//!
//! Any failure on either hop (timeout, transport error, non-200, unexpected
//! body) aborts the rest and falls back to the fixed host. Discovery never
//! fails outright; the fallback reason is logged and kept on the endpoint.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("response timeout from {host}")]
    Timeout { host: String },
    #[error("non HTTP 200 response from {host} ({status})")]
    Status { host: String, status: reqwest::StatusCode },
    #[error("request to {host} failed: {source}")]
    Http {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from {host}: missing `{field}`")]
    MissingField { host: String, field: &'static str },
}

/// Where the endpoint came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// Configured by the caller; discovery was skipped.
    Explicit,
    Discovered,
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub source: EndpointSource,
}

pub struct EndpointResolver {
    http: reqwest::Client,
    api_key: String,
    central_origin: String,
    fallback_host: String,
    scheme: String,
    hop_timeout: Duration,
}

impl EndpointResolver {
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.discovery_timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            central_origin: config.central_origin.clone(),
            fallback_host: config.fallback_host.clone(),
            scheme: config.discovery_scheme.clone(),
            hop_timeout: config.discovery_timeout,
        })
    }

    /// Pick the host to connect to. An explicit host wins outright.
    pub async fn resolve(&self, explicit: Option<&str>) -> Endpoint {
        if let Some(host) = explicit {
            return Endpoint { host: host.to_owned(), source: EndpointSource::Explicit };
        }

        match self.discover().await {
            Ok(host) => {
                info!(%host, "discovery: resolved compute unit");
                Endpoint { host, source: EndpointSource::Discovered }
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(fallback = %self.fallback_host, %reason, "discovery: using fallback host");
                Endpoint { host: self.fallback_host.clone(), source: EndpointSource::Fallback { reason } }
            }
        }
    }

    /// Run both hops without falling back.
    ///
    /// # Errors
    ///
    /// Returns the first hop failure.
    pub async fn discover(&self) -> Result<String, DiscoveryError> {
        let central = self.central_origin.as_str();
        let proxy = self
            .hop(central, "/v3/proxy", true)
            .await?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| DiscoveryError::MissingField { host: central.to_owned(), field: "proxyHost" })?;

        self.hop(&proxy, "/v3/computeunit", false)
            .await?
            .get("httpPublicHost")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .ok_or(DiscoveryError::MissingField { host: proxy, field: "httpPublicHost" })
    }

    async fn hop(&self, host: &str, path: &str, authenticated: bool) -> Result<Value, DiscoveryError> {
        let url = format!("{}://{host}{path}", self.scheme);
        let mut request = self.http.get(url).query(&[("key", self.api_key.as_str())]);
        if authenticated {
            request = request.basic_auth(&self.api_key, Some(""));
        }

        let http_err = |source: reqwest::Error| DiscoveryError::Http { host: host.to_owned(), source };
        let exchange = async {
            let response = request.send().await.map_err(http_err)?;
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(DiscoveryError::Status { host: host.to_owned(), status });
            }
            response.json::<Value>().await.map_err(http_err)
        };

        tokio::time::timeout(self.hop_timeout, exchange)
            .await
            .map_err(|_| DiscoveryError::Timeout { host: host.to_owned() })?
    }
}

#[cfg(test)]
#[path = "discovery_test.rs"]
mod tests;
