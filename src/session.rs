//! Connection and authentication lifecycle.
//!
//! ARCHITECTURE
//! ============
//! `Session` is a sans-IO state machine. The driver feeds it transport events
//! (`on_open`, `on_text`, `on_close`, `on_transport_error`) and timer ticks
//! (`poll_timers`), each with the current instant. Every event runs to
//! completion before the next one is delivered, so the session needs no
//! locks and inbound frames are handled strictly in arrival order.
//!
//! LIFECYCLE
//! =========
//! ```text
//! NOT_STARTED -> AUTHENTICATING -> AUTHENTICATED | UNAUTHENTICATED -> DISCONNECTED
//! ```
//! 1. Open: arm the auth deadline, send an acked `authenticate`.
//! 2. Auth response: `error` key -> UNAUTHENTICATED and close; otherwise
//!    AUTHENTICATED and a subscription table sized by `maxSubscriptions`.
//! 3. Deadline first: UNAUTHENTICATED, timeout payload to the auth
//!    callback, then the failure path.
//! 4. Transport close, whatever the cause: DISCONNECTED (terminal).
//!
//! ERROR HANDLING
//! ==============
//! Every asynchronous failure goes through [`Session::fail`]: close the
//! transport if open, cancel the auth deadline, call the error callback, and
//! publish on the reserved `error` topic. A failing error callback or `error`
//! subscriber is only logged.

use std::sync::Arc;
use std::time::Duration;

use frames::{ClientKind, Inbound, ProtocolEvent, PublishEvent, SystemEvent};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{BoxError, ClientError, ErrorCode};
use crate::paths::{self, ComputerConnectionsQuery, ScalesQuery};
use crate::sender::{ReliableSender, SenderStats};
use crate::subscriptions::{NewSubscription, Removal, ServerHandler, SubscriptionTable};
use crate::topic::{DeliveryFailure, ERROR_TOPIC, Handler, SubscribeOptions, Topic, TopicRouter, Unsubscribe};
use crate::transport::Transport;

// =============================================================================
// STATE
// =============================================================================

/// Authoritative connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    NotStarted,
    Authenticating,
    Authenticated,
    Unauthenticated,
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Authenticating => "AUTHENTICATING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// No further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CALLBACKS
// =============================================================================

/// Receives the auth response payload (or the synthesized timeout payload).
pub type AuthCallback = Arc<dyn Fn(&Value) -> Result<(), BoxError> + Send + Sync>;

/// Receives every failure routed through the failure path.
pub type ErrorCallback = Arc<dyn Fn(&ClientError, &Value) -> Result<(), BoxError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_auth: Option<AuthCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Callbacks {
    #[must_use]
    pub fn on_auth<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_auth = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientError, &Value) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct Session<T: Transport> {
    api_key: String,
    auth_timeout: Duration,
    state: ConnectionState,
    connected: bool,
    transport: T,
    transport_open: bool,
    sender: ReliableSender,
    router: TopicRouter,
    subscriptions: Option<SubscriptionTable>,
    /// `(opened_at, deadline)` while an auth response is outstanding.
    auth_timer: Option<(Instant, Instant)>,
    callbacks: Callbacks,
}

impl<T: Transport> Session<T> {
    #[must_use]
    pub fn new(config: &ClientConfig, transport: T, callbacks: Callbacks) -> Self {
        Self {
            api_key: config.api_key.clone(),
            auth_timeout: config.auth_timeout,
            state: ConnectionState::NotStarted,
            connected: false,
            transport,
            transport_open: false,
            sender: ReliableSender::new(config.ack, config.ack_timeout, config.ack_window),
            router: TopicRouter::new(),
            subscriptions: None,
            auth_timer: None,
            callbacks,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// False once the session has closed (or never opened) its transport.
    #[must_use]
    pub fn is_transport_open(&self) -> bool {
        self.transport_open
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn debug_info(&self) -> SenderStats {
        self.sender.stats()
    }

    /// Live server subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.as_ref().map_or(0, SubscriptionTable::len)
    }

    /// Earliest instant at which [`Session::poll_timers`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let auth = self.auth_timer.map(|(_, deadline)| deadline);
        match (auth, self.sender.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -------------------------------------------------------------------------
    // transport events
    // -------------------------------------------------------------------------

    /// The transport finished opening.
    pub fn on_open(&mut self, now: Instant) {
        if self.state != ConnectionState::NotStarted {
            warn!(state = %self.state, "session: open event in unexpected state");
            return;
        }
        self.transport_open = true;
        self.connected = true;
        self.auth_timer = Some((now, now + self.auth_timeout));
        self.set_state(ConnectionState::Authenticating);
        self.publish_local(&Topic::parse("system.socket.open"), &Value::Null);

        let credential = serde_json::json!({ "apiKey": self.api_key });
        // Failures are already on the failure path.
        let _ = self.send(ClientKind::Authenticate, &credential, Some(true), now);
    }

    /// One inbound text frame.
    pub fn on_text(&mut self, text: &str, now: Instant) {
        self.publish_local(&Topic::parse("system.socket.message"), &Value::String(text.to_owned()));

        let inbound = match frames::decode(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                let err = ClientError::from(err);
                self.fail(&err, serde_json::json!({ "timeout": false, "data": text }));
                return;
            }
        };

        match inbound {
            Inbound::System(SystemEvent::AuthenticateResponse(payload)) => self.authenticate_response(payload),
            Inbound::System(SystemEvent::Hi(flag)) => self.connected = flag,
            Inbound::System(SystemEvent::RateLimit(info)) => {
                self.fail(&ClientError::RateLimit { info: info.clone() }, info);
            }
            Inbound::System(SystemEvent::Unknown { tag, payload }) => {
                warn!(%tag, %payload, "session: unhandled system message");
            }
            Inbound::Protocol(ProtocolEvent::Ack(id)) => match self.sender.ack_at(&id, now) {
                Ok(rtt) => debug!(ack = %id, rtt_ms = rtt.as_millis(), "session: ack"),
                Err(err) => self.report(&err, serde_json::json!({ "timeout": false })),
            },
            Inbound::Protocol(ProtocolEvent::Unknown { tag, payload }) => {
                warn!(%tag, %payload, "session: unhandled protocol message");
            }
            Inbound::Publish(event) => self.dispatch_publish(event),
            Inbound::Unknown { category } => {
                warn!(%category, "session: unhandled message type");
            }
        }
    }

    /// The transport closed, for whatever reason.
    pub fn on_close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.connected = false;
        self.transport_open = false;
        self.teardown();
        self.publish_local(&Topic::parse("system.socket.close"), &Value::Null);
        self.set_state(ConnectionState::Disconnected);
        info!("session: disconnected");
    }

    /// The transport reported an error.
    pub fn on_transport_error(&mut self, err: &ClientError) {
        let detail = serde_json::json!({ "socket": true, "socketError": err.to_string() });
        self.publish_local(&Topic::parse("system.socket.error"), &detail);
        self.fail(err, detail);
    }

    /// Fire every deadline at or before `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some((opened_at, deadline)) = self.auth_timer {
            if deadline <= now {
                self.auth_timed_out(now.saturating_duration_since(opened_at));
            }
        }
        for timeout in self.sender.expire_at(now) {
            warn!(ack = timeout.ack_id, message = %timeout.kind, "session: no ack received");
            self.fail(&timeout.to_error(), timeout.detail());
        }
    }

    /// Close the transport. Returns `false` when it was not open or the
    /// close request failed. Safe to call repeatedly.
    pub fn close(&mut self) -> bool {
        self.teardown();
        if !self.transport_open {
            return false;
        }
        self.transport_open = false;
        match self.transport.close() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "session: failed to close socket");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // local pub/sub
    // -------------------------------------------------------------------------

    pub fn subscribe(&mut self, topic: impl Into<Topic>, handler: Handler, options: SubscribeOptions) {
        self.router.subscribe(topic, handler, options);
    }

    pub fn unsubscribe(&mut self, target: &Unsubscribe) -> usize {
        self.router.unsubscribe(target)
    }

    /// Publish an application payload locally. Subscriber failures go
    /// through the failure path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for the reserved `error` hierarchy.
    pub fn publish(&mut self, topic: impl Into<Topic>, payload: &Value) -> Result<usize, ClientError> {
        let topic = checked_app_topic(topic.into())?;
        Ok(self.publish_local(&topic, payload))
    }

    /// Publish with a caller-supplied sink for subscriber failures.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for the reserved `error` hierarchy.
    pub fn publish_with(
        &mut self,
        topic: impl Into<Topic>,
        payload: &Value,
        on_error: &mut dyn FnMut(DeliveryFailure),
    ) -> Result<usize, ClientError> {
        let topic = checked_app_topic(topic.into())?;
        Ok(self.router.publish(topic, payload, on_error))
    }

    // -------------------------------------------------------------------------
    // server subscriptions
    // -------------------------------------------------------------------------

    /// Register a server subscription and send the acked `subscribe`.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotAuthenticated`] before authentication, the table's
    /// registration errors, or the send failure (after the failure path ran).
    pub fn make_server_subscription(&mut self, request: NewSubscription, now: Instant) -> Result<u64, ClientError> {
        let table = self.subscriptions.as_mut().ok_or(ClientError::NotAuthenticated)?;
        let path = request.path.clone();
        let id = table.add(request)?;

        if let Err(err) = self.send(ClientKind::Subscribe, &(id, &path), Some(true), now) {
            if let Some(table) = self.subscriptions.as_mut() {
                table.remove(&Removal::Id(id));
            }
            return Err(err);
        }
        info!(id, %path, "session: server subscription added");
        Ok(id)
    }

    /// Remove server subscriptions locally, then tell the server.
    ///
    /// Returns the removed ids without waiting for the unsubscribe ack.
    pub fn remove_server_subscription(&mut self, target: &Removal, now: Instant) -> Vec<u64> {
        let Some(table) = self.subscriptions.as_mut() else {
            return Vec::new();
        };
        let removed = table.remove(target);
        if !removed.is_empty() {
            let _ = self.send(ClientKind::Unsubscribe, &removed, Some(true), now);
        }
        removed
    }

    /// Subscribe to scale measurements.
    ///
    /// # Errors
    ///
    /// As [`Session::make_server_subscription`].
    pub fn get_scales(
        &mut self,
        query: &ScalesQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
        now: Instant,
    ) -> Result<u64, ClientError> {
        let request = paths::scales_subscription(query, callback, context);
        self.make_server_subscription(request, now)
    }

    /// Subscribe to computer connection changes.
    ///
    /// # Errors
    ///
    /// As [`Session::make_server_subscription`].
    pub fn get_computer_connections(
        &mut self,
        query: &ComputerConnectionsQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
        now: Instant,
    ) -> Result<u64, ClientError> {
        let request = paths::computer_connections_subscription(query, callback, context);
        self.make_server_subscription(request, now)
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        debug!(from = %self.state, to = %state, "session: state change");
        self.state = state;
        let topic = Topic::parse(&format!("system.state.{state}"));
        self.publish_local(&topic, &Value::String(state.as_str().to_owned()));
    }

    fn send<P: Serialize + ?Sized>(
        &mut self,
        kind: ClientKind,
        payload: &P,
        ack: Option<bool>,
        now: Instant,
    ) -> Result<Option<u64>, ClientError> {
        match self.sender.send_at(&mut self.transport, kind, payload, ack, now) {
            Ok(sent) => {
                self.publish_local(&Topic::parse("system.socket.sent"), &Value::String(sent.text));
                Ok(sent.ack)
            }
            Err(err) => {
                self.fail(&err, serde_json::json!({ "timeout": false, "message": kind.as_str() }));
                Err(err)
            }
        }
    }

    fn authenticate_response(&mut self, payload: Value) {
        if self.state != ConnectionState::Authenticating {
            warn!(state = %self.state, "session: late authenticate response ignored");
            return;
        }
        self.auth_timer = None;

        if payload.get("error").is_some_and(is_truthy) {
            self.set_state(ConnectionState::Unauthenticated);
            self.publish_local(&Topic::parse("authenticate.error"), &payload);
            self.close();
        } else {
            let max = payload
                .get("maxSubscriptions")
                .and_then(Value::as_u64)
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX));
            self.subscriptions = Some(SubscriptionTable::new(max));
            self.set_state(ConnectionState::Authenticated);
            self.publish_local(&Topic::parse("authenticate.ok"), &payload);
            info!(max_subscriptions = ?max, "session: authenticated");
        }
        self.invoke_auth_callback(&payload);
    }

    fn auth_timed_out(&mut self, elapsed: Duration) {
        self.auth_timer = None;
        self.set_state(ConnectionState::Unauthenticated);
        let payload = serde_json::json!({ "timeout": true, "error": "Server timed out" });
        self.publish_local(&Topic::parse("authenticate.error"), &payload);
        self.invoke_auth_callback(&payload);
        self.fail(&ClientError::AuthTimeout { elapsed }, payload);
    }

    fn invoke_auth_callback(&mut self, payload: &Value) {
        let Some(callback) = self.callbacks.on_auth.clone() else {
            return;
        };
        if let Err(source) = callback(payload) {
            let err = ClientError::runtime("exception thrown in authentication callback", source);
            self.fail(&err, payload.clone());
        }
    }

    fn dispatch_publish(&mut self, event: PublishEvent) {
        let Some(id) = event.subscription_id else {
            debug!(payload = %event.payload, "session: publish without subscription id dropped");
            return;
        };
        let Some(triggered) = self.subscriptions.as_ref().and_then(|t| t.trigger(id, &event.payload)) else {
            debug!(id, "session: publish for unknown subscription dropped");
            return;
        };

        if let Some(failure) = triggered.failure {
            let detail = failure.detail();
            let err = ClientError::runtime("exception thrown in subscription callback", failure.error);
            self.fail(&err, detail);
        }

        for topic in &triggered.topics {
            self.publish_local(topic, &triggered.payload);
        }
        for topic in &event.topics {
            match checked_app_topic(Topic::parse(topic)) {
                Ok(topic) => {
                    self.publish_local(&topic, &triggered.payload);
                }
                Err(_) => warn!(id, %topic, "session: server named a reserved topic; not republished"),
            }
        }
    }

    /// Publish on the local router, sending subscriber failures through the
    /// failure path once delivery has finished.
    fn publish_local(&mut self, topic: &Topic, payload: &Value) -> usize {
        let mut failures = Vec::new();
        let invoked = self.router.publish(topic, payload, &mut |f| failures.push(f));
        for failure in failures {
            let detail = failure.detail();
            let err = ClientError::runtime("exception thrown in subscription callback", failure.error);
            self.fail(&err, detail);
        }
        invoked
    }

    /// Cancel every timer and drop pending-ack and subscription state.
    fn teardown(&mut self) {
        self.auth_timer = None;
        self.sender.shutdown();
        self.subscriptions = None;
    }

    /// The unified failure path.
    fn fail(&mut self, err: &ClientError, detail: Value) {
        warn!(code = err.error_code(), error = %err, "session: failure");
        self.close();
        self.notify(err, detail);
    }

    /// Report without closing; used for non-fatal server misbehaviour.
    fn report(&mut self, err: &ClientError, detail: Value) {
        warn!(code = err.error_code(), error = %err, "session: server-side error");
        self.notify(err, detail);
    }

    fn notify(&mut self, err: &ClientError, detail: Value) {
        if let Some(callback) = self.callbacks.on_error.clone() {
            if let Err(cb_err) = callback(err, &detail) {
                error!(error = %cb_err, original = %err, "session: error in error callback");
            }
        }

        let mut payload = err.to_value();
        payload["detail"] = detail;
        self.router.publish(Topic::parse(ERROR_TOPIC), &payload, &mut |failure| {
            error!(error = %failure.error, "session: error in error topic subscriber");
        });
    }
}

fn checked_app_topic(topic: Topic) -> Result<Topic, ClientError> {
    if topic.hierarchy().first().is_some_and(Topic::is_reserved) {
        return Err(ClientError::Argument(format!("topic '{topic}' is reserved")));
    }
    Ok(topic)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
