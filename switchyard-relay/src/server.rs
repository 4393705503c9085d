//! WebSocket front end: accepts peer connections and binds each one to a
//! multiplexed [`Session`].
//!
//! A connection is set up by a single [`Frame::Setup`] on the `connect`
//! route carrying the client's id. After that the socket only carries
//! session frames; the session's routes serve `personal.call` and
//! `group.call` through the [`Router`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use switchyard_proto::codec;
use switchyard_proto::envelope::ClientId;
use switchyard_proto::frame::Frame;
use switchyard_proto::route;
use switchyard_proto::session::{Role, Routes, Session};
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::lifecycle::{CloseCause, ConnectionLifecycle};
use crate::registry::{ClientRegistry, ConnectionHandle};
use crate::router::{RelayMode, Router};

/// How long a fresh connection may take to send its setup frame.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared relay server state: the client registry and routing options.
pub struct RelayState {
    registry: Arc<ClientRegistry>,
    router: Router,
    max_frame_size: usize,
    status_probe: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with an empty registry and default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    /// Creates a relay state using the options of a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let router =
            Router::new(Arc::clone(&registry)).with_sender_enforcement(config.enforce_sender);
        Self {
            registry,
            router,
            max_frame_size: config.max_frame_size,
            status_probe: config.status_probe,
        }
    }

    /// The registry of connected clients.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The router relayed envelopes go through.
    #[must_use]
    pub const fn router(&self) -> &Router {
        &self.router
    }

    /// Disposes every registered connection.
    ///
    /// Each connection's handler notices the disposal, closes its socket and
    /// deregisters itself. Returns the number of connections disposed.
    pub fn shutdown(&self) -> usize {
        let mut disposed = 0;
        for client_id in self.registry.keys() {
            if let Some(handle) = self.registry.get(&client_id) {
                tracing::info!(client_id = %client_id, connection = %handle.id(), "disposing client connection");
                handle.dispose();
                disposed += 1;
            }
        }
        tracing::info!(disposed, "relay shut down");
        disposed
    }

    /// Session routes served on `client_id`'s connection.
    fn routes_for(&self, client_id: &ClientId) -> Routes {
        Routes::new()
            .route(
                route::PERSONAL_CALL,
                self.router
                    .channel_handler(client_id.clone(), RelayMode::Personal),
            )
            .route(
                route::GROUP_CALL,
                self.router.channel_handler(client_id.clone(), RelayMode::Group),
            )
    }
}

/// Handles an upgraded WebSocket connection for a single peer.
///
/// The connection lifecycle:
/// 1. Wait for the `connect` setup frame.
/// 2. Register the client, probe its status if enabled.
/// 3. Pump frames between the socket and the session until either side ends.
/// 4. Close the lifecycle with the observed cause and dispose the session.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let client_id = match tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup(&mut ws_receiver)).await
    {
        Ok(Some(client_id)) => client_id,
        Ok(None) => {
            tracing::warn!("connection closed before setup");
            return;
        }
        Err(_) => {
            tracing::warn!(timeout_secs = SETUP_TIMEOUT.as_secs(), "setup timed out");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let session = Session::new(Role::Server, tx, state.routes_for(&client_id));
    let handle = ConnectionHandle::new(session.clone());
    let lifecycle =
        ConnectionLifecycle::new(client_id.clone(), handle.clone(), Arc::clone(&state.registry));
    lifecycle.open();
    if state.status_probe {
        lifecycle.spawn_status_probe();
    }

    // Writer: session frames to the socket, and a close frame on disposal.
    let writer_client = client_id.clone();
    let writer_session = session.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_session.closed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    let bytes = match codec::encode_frame(&frame) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(client_id = %writer_client, error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                        tracing::warn!(client_id = %writer_client, "WebSocket write failed");
                        return;
                    }
                }
            }
        }
    });

    // Reader: socket frames into the session.
    let reader_client = client_id.clone();
    let reader_session = session.clone();
    let max_frame_size = state.max_frame_size;
    let mut read_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if data.len() > max_frame_size {
                        tracing::warn!(
                            client_id = %reader_client,
                            size = data.len(),
                            max = max_frame_size,
                            "frame exceeds size limit, dropped"
                        );
                        continue;
                    }
                    match codec::decode_frame(&data) {
                        Ok(frame) => reader_session.handle_frame(frame),
                        Err(e) => {
                            tracing::warn!(client_id = %reader_client, error = %e, "failed to decode frame");
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::debug!(client_id = %reader_client, "received close frame");
                    return CloseCause::Normal;
                }
                Ok(_) => {
                    // Text, ping and pong frames carry nothing for the session.
                }
                Err(e) => return CloseCause::Error(e.to_string()),
            }
        }
        CloseCause::Normal
    });

    let cause = tokio::select! {
        result = &mut read_task => {
            write_task.abort();
            result.unwrap_or_else(|e| CloseCause::Error(e.to_string()))
        }
        _ = &mut write_task => {
            read_task.abort();
            CloseCause::Error("connection write failed".to_string())
        }
    };
    let cause = if session.is_disposed() {
        CloseCause::Cancelled
    } else {
        cause
    };

    lifecycle.close(cause);
    // Fails the exchanges this connection still takes part in.
    handle.dispose();
}

/// Waits for the first frame on the WebSocket, expecting a `connect` setup.
///
/// Returns the declared client id, or `None` if the connection closes or
/// anything other than a valid setup arrives.
async fn wait_for_setup(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<ClientId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode_frame(&data) {
                Ok(Frame::Setup { route, data }) => {
                    if route != route::CONNECT {
                        tracing::warn!(route = %route, "setup on unknown route");
                        return None;
                    }
                    let client_id = ClientId::new(data);
                    if client_id.is_empty() {
                        tracing::warn!("setup with empty client id");
                        return None;
                    }
                    return Some(client_id);
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected setup, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode setup frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Starts the relay server on the given address with default options.
///
/// Returns the bound address and a handle to the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
