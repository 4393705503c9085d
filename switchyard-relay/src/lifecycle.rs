//! Per-connection lifecycle: registration on open, one cleanup on close.
//!
//! Each accepted connection gets a [`ConnectionLifecycle`] that walks
//! `Connecting → Open → Closed`. The three terminal causes (normal close,
//! error, cancel) all land in the same [`ConnectionLifecycle::close`]
//! transition, which runs at most once no matter how many times the
//! transport reports an ending.

use std::fmt;
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use switchyard_proto::codec;
use switchyard_proto::envelope::ClientId;
use switchyard_proto::route;

use crate::error::RelayError;
use crate::registry::{ClientRegistry, ConnectionHandle};

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet registered.
    Connecting,
    /// Registered and routable.
    Open,
    /// Terminal.
    Closed,
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer or transport closed cleanly.
    Normal,
    /// The transport failed.
    Error(String),
    /// The connection was cancelled, locally or by the peer.
    Cancelled,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("closed normally"),
            Self::Error(reason) => write!(f, "closed with error: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Drives one connection's registration and cleanup.
pub struct ConnectionLifecycle {
    client_id: ClientId,
    handle: ConnectionHandle,
    registry: Arc<ClientRegistry>,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("client_id", &self.client_id)
            .field("connection", &self.handle.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionLifecycle {
    /// Starts tracking a freshly accepted connection.
    #[must_use]
    pub fn new(client_id: ClientId, handle: ConnectionHandle, registry: Arc<ClientRegistry>) -> Self {
        Self {
            client_id,
            handle,
            registry,
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// The client this connection declared.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The connection's handle.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// `Connecting → Open`: registers the connection.
    ///
    /// A previous connection under the same id is superseded, not closed.
    /// Returns `false` if the connection was not in `Connecting`.
    pub fn open(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Open;

        if let Some(previous) = self.registry.put(self.client_id.clone(), self.handle.clone()) {
            let conflict = RelayError::RegistrationConflict {
                client_id: self.client_id.clone(),
                previous: previous.id(),
            };
            tracing::info!(client_id = %self.client_id, "{conflict}");
        }
        drop(state);

        tracing::info!(
            client_id = %self.client_id,
            connection = %self.handle.id(),
            "client connected"
        );
        true
    }

    /// Moves to `Closed` and removes this connection from the registry.
    ///
    /// Only the first call does anything; it returns `true`, later calls
    /// return `false`. A cancelled connection is disposed before removal.
    pub fn close(&self, cause: CloseCause) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;

        if cause == CloseCause::Cancelled {
            self.handle.dispose();
        }
        let removed = self.registry.remove_if_same(&self.client_id, &self.handle);
        drop(state);

        match &cause {
            CloseCause::Normal => {
                tracing::info!(client_id = %self.client_id, removed, "client disconnected");
            }
            CloseCause::Error(reason) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    error = %reason,
                    removed,
                    "connection to client closed with error"
                );
            }
            CloseCause::Cancelled => {
                tracing::info!(client_id = %self.client_id, removed, "client connection cancelled");
            }
        }
        let terminated = RelayError::ConnectionTerminated {
            client_id: self.client_id.clone(),
            cause,
        };
        tracing::debug!(connection = %self.handle.id(), "{terminated}");
        true
    }

    /// Asks the new peer for its status stream on `client-status`.
    ///
    /// Every value received is logged. The probe is diagnostic only: if it
    /// cannot be opened or fails later, registration is unaffected.
    pub fn spawn_status_probe(&self) -> Option<tokio::task::JoinHandle<()>> {
        let request = match codec::encode(&route::STATUS_OPEN.to_string()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "failed to encode status probe");
                return None;
            }
        };
        let mut exchange = match self
            .handle
            .open_exchange(route::CLIENT_STATUS, stream::iter([request]))
        {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "status probe not opened");
                return None;
            }
        };

        let client_id = self.client_id.clone();
        Some(tokio::spawn(async move {
            while let Some(item) = exchange.next().await {
                match item {
                    Ok(bytes) => match codec::decode::<String>(&bytes) {
                        Ok(status) => {
                            tracing::info!(client_id = %client_id, status = %status, "client status");
                        }
                        Err(e) => {
                            tracing::debug!(client_id = %client_id, error = %e, "undecodable client status");
                        }
                    },
                    Err(e) => {
                        tracing::debug!(client_id = %client_id, error = %e, "status probe ended");
                        break;
                    }
                }
            }
        }))
    }
}
