//! Tokio driver for [`Session`].
//!
//! ARCHITECTURE
//! ============
//! [`Client::connect`] spawns one task that owns the session. The task
//! resolves the endpoint, opens the WebSocket, then runs a single `select!`
//! loop over:
//! - inbound frames from the socket reader
//! - commands from [`Client`] handles
//! - the session's earliest deadline
//! - the close-handshake deadline, armed once the session closes its side
//!
//! Outbound frames go through a [`ChannelTransport`] to a writer task that
//! owns the socket's sink half. Handles never touch session state; every
//! call is a command answered on a oneshot channel, and the connection state
//! is mirrored on a watch channel.
//!
//! LIFECYCLE
//! =========
//! A close requested while the endpoint is still being resolved or the
//! socket is still connecting abandons the connect and ends in
//! `DISCONNECTED` without ever sending `authenticate`. A peer that never
//! answers our close frame is dropped after `close_timeout`.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::discovery::EndpointResolver;
use crate::error::ClientError;
use crate::paths::{ComputerConnectionsQuery, ScalesQuery};
use crate::sender::SenderStats;
use crate::session::{Callbacks, ConnectionState, Session};
use crate::subscriptions::{NewSubscription, Removal, ServerHandler};
use crate::topic::{Handler, SubscribeOptions, Topic, Unsubscribe};
use crate::transport::{ChannelTransport, Outgoing, Transport};

// =============================================================================
// COMMANDS
// =============================================================================

enum Command {
    Subscribe {
        topic: Topic,
        handler: Handler,
        options: SubscribeOptions,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        target: Unsubscribe,
        reply: oneshot::Sender<usize>,
    },
    Publish {
        topic: Topic,
        payload: Value,
        reply: oneshot::Sender<Result<usize, ClientError>>,
    },
    MakeServerSubscription {
        request: NewSubscription,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    RemoveServerSubscription {
        target: Removal,
        reply: oneshot::Sender<Vec<u64>>,
    },
    GetScales {
        query: ScalesQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    GetComputerConnections {
        query: ComputerConnectionsQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    Close {
        reply: oneshot::Sender<bool>,
    },
    DebugInfo {
        reply: oneshot::Sender<SenderStats>,
    },
    IsConnected {
        reply: oneshot::Sender<bool>,
    },
}

// Replies are dropped when the caller stopped waiting; that is not an error.
fn handle_command<T: Transport>(session: &mut Session<T>, command: Command) {
    let now = Instant::now();
    match command {
        Command::Subscribe { topic, handler, options, reply } => {
            session.subscribe(topic, handler, options);
            let _ = reply.send(());
        }
        Command::Unsubscribe { target, reply } => {
            let _ = reply.send(session.unsubscribe(&target));
        }
        Command::Publish { topic, payload, reply } => {
            let _ = reply.send(session.publish(topic, &payload));
        }
        Command::MakeServerSubscription { request, reply } => {
            let _ = reply.send(session.make_server_subscription(request, now));
        }
        Command::RemoveServerSubscription { target, reply } => {
            let _ = reply.send(session.remove_server_subscription(&target, now));
        }
        Command::GetScales { query, callback, context, reply } => {
            let _ = reply.send(session.get_scales(&query, callback, context, now));
        }
        Command::GetComputerConnections { query, callback, context, reply } => {
            let _ = reply.send(session.get_computer_connections(&query, callback, context, now));
        }
        Command::Close { reply } => {
            let _ = reply.send(session.close());
        }
        Command::DebugInfo { reply } => {
            let _ = reply.send(session.debug_info());
        }
        Command::IsConnected { reply } => {
            let _ = reply.send(session.is_connected());
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Client {
    /// Validate `config` and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for invalid configuration, before
    /// anything is opened.
    pub fn connect(config: ClientConfig, callbacks: Callbacks) -> Result<Self, ClientError> {
        config.validate()?;
        let resolver = EndpointResolver::new(&config)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::NotStarted);
        tokio::spawn(run_connection(config, resolver, callbacks, command_rx, state_tx));
        Ok(Self { commands, state })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task ended first.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, ClientError> {
        let mut state = self.state.clone();
        let current = state.wait_for(predicate).await.map_err(|_| ClientError::Closed)?;
        Ok(*current)
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn subscribe(
        &self,
        topic: impl Into<Topic>,
        handler: Handler,
        options: SubscribeOptions,
    ) -> Result<(), ClientError> {
        let topic = topic.into();
        self.request(|reply| Command::Subscribe { topic, handler, options, reply }).await
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn unsubscribe(&self, target: Unsubscribe) -> Result<usize, ClientError> {
        self.request(|reply| Command::Unsubscribe { target, reply }).await
    }

    /// # Errors
    ///
    /// [`ClientError::Argument`] for the reserved `error` hierarchy, or
    /// [`ClientError::Closed`].
    pub async fn publish(&self, topic: impl Into<Topic>, payload: Value) -> Result<usize, ClientError> {
        let topic = topic.into();
        self.request(|reply| Command::Publish { topic, payload, reply }).await?
    }

    /// # Errors
    ///
    /// As [`Session::make_server_subscription`], or [`ClientError::Closed`].
    pub async fn make_server_subscription(&self, request: NewSubscription) -> Result<u64, ClientError> {
        self.request(|reply| Command::MakeServerSubscription { request, reply }).await?
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn remove_server_subscription(&self, target: impl Into<Removal>) -> Result<Vec<u64>, ClientError> {
        let target = target.into();
        self.request(|reply| Command::RemoveServerSubscription { target, reply }).await
    }

    /// # Errors
    ///
    /// As [`Session::get_scales`], or [`ClientError::Closed`].
    pub async fn get_scales(
        &self,
        query: ScalesQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
    ) -> Result<u64, ClientError> {
        self.request(|reply| Command::GetScales { query, callback, context, reply }).await?
    }

    /// # Errors
    ///
    /// As [`Session::get_computer_connections`], or [`ClientError::Closed`].
    pub async fn get_computer_connections(
        &self,
        query: ComputerConnectionsQuery,
        callback: Option<ServerHandler>,
        context: Option<Value>,
    ) -> Result<u64, ClientError> {
        self.request(|reply| Command::GetComputerConnections { query, callback, context, reply }).await?
    }

    /// Close the connection. Resolves to whether a close was performed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn close(&self) -> Result<bool, ClientError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn debug_info(&self) -> Result<SenderStats, ClientError> {
        self.request(|reply| Command::DebugInfo { reply }).await
    }

    /// Server-reported liveness (`system.hi`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection task has ended.
    pub async fn is_connected(&self) -> Result<bool, ClientError> {
        self.request(|reply| Command::IsConnected { reply }).await
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn run_connection(
    config: ClientConfig,
    resolver: EndpointResolver,
    callbacks: Callbacks,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let (transport, mut outgoing) = ChannelTransport::pair();
    let mut session = Session::new(&config, transport, callbacks);

    let connecting = async {
        let endpoint = resolver.resolve(config.server.as_deref()).await;
        let url = config.ws_url(&endpoint.host);
        info!(%url, source = ?endpoint.source, "client: connecting");
        connect_async(url).await
    };

    // Commands issued while connecting still reach the session.
    let connected = match serve_until(connecting, &mut session, &mut commands).await {
        Connecting::Finished(connected) => connected,
        Connecting::Aborted => {
            session.on_close();
            publish_state(&state_tx, &session);
            return;
        }
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            session.on_transport_error(&ClientError::Transport(format!("connect failed: {e}")));
            session.on_close();
            publish_state(&state_tx, &session);
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws.split();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            let (message, last) = match item {
                Outgoing::Text(text) => (Message::Text(text.into()), false),
                Outgoing::Close => (Message::Close(None), true),
            };
            if let Err(e) = ws_write.send(message).await {
                debug!(error = %e, "client: socket write failed");
                break;
            }
            if last {
                break;
            }
        }
    });

    session.on_open(Instant::now());
    publish_state(&state_tx, &session);

    let mut handles_gone = false;
    let mut close_deadline: Option<Instant> = None;
    loop {
        if close_deadline.is_none() && !session.is_transport_open() {
            close_deadline = Some(Instant::now() + config.close_timeout);
        }
        let deadline = session.next_deadline();
        tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(text))) => session.on_text(&text, Instant::now()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "client: close frame received");
                    session.on_close();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    session.on_transport_error(&ClientError::Transport(e.to_string()));
                    session.on_close();
                }
                None => session.on_close(),
            },
            command = commands.recv(), if !handles_gone => match command {
                Some(command) => handle_command(&mut session, command),
                None => {
                    debug!("client: all handles dropped; closing");
                    handles_gone = true;
                    session.close();
                }
            },
            () = sleep_until(deadline) => session.poll_timers(Instant::now()),
            () = sleep_until(close_deadline) => {
                warn!("client: peer did not answer close; dropping socket");
                session.on_close();
            }
        }
        publish_state(&state_tx, &session);
        if session.state().is_terminal() {
            break;
        }
    }

    drop(session);
    match tokio::time::timeout(config.close_timeout, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "client: writer task failed"),
        Err(_) => {
            debug!("client: writer blocked on a stalled peer; aborting");
            writer.abort();
        }
    }
    info!("client: connection task finished");
}

/// How the connect phase ended.
enum Connecting<O> {
    Finished(O),
    /// A handle asked to close, or every handle was dropped.
    Aborted,
}

/// Drive `fut` to completion while answering commands. A close request or
/// the last handle going away drops `fut`, abandoning the connect.
async fn serve_until<F, T>(
    fut: F,
    session: &mut Session<T>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Connecting<F::Output>
where
    F: Future,
    T: Transport,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Connecting::Finished(out),
            command = commands.recv() => match command {
                Some(Command::Close { reply }) => {
                    debug!("client: close requested while connecting");
                    let _ = reply.send(session.close());
                    return Connecting::Aborted;
                }
                Some(command) => handle_command(session, command),
                None => {
                    session.close();
                    return Connecting::Aborted;
                }
            },
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn publish_state<T: Transport>(state_tx: &watch::Sender<ConnectionState>, session: &Session<T>) {
    let next = session.state();
    state_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
