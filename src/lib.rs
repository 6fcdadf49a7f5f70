//! Client for a realtime push service.
//!
//! One authenticated WebSocket session per [`Client`]: acked sends with
//! timeouts, a hierarchical local pub/sub router, and a table of server-side
//! subscriptions whose publishes are fanned out to callbacks and local
//! topics. The protocol core ([`session::Session`]) is sans-IO; [`Client`]
//! drives it on tokio.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod paths;
pub mod sender;
pub mod session;
pub mod subscriptions;
pub mod topic;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{BoxError, ClientError, ErrorCode};
pub use paths::{ComputerConnections, ComputerConnectionsQuery, ScalesMeasurement, ScalesQuery};
pub use session::{Callbacks, ConnectionState, Session};
pub use subscriptions::{NewSubscription, Removal, server_handler, transform};
pub use topic::{SubscribeOptions, Topic, Unsubscribe, handler};
