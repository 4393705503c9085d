//! Directory of currently reachable peers.
//!
//! The [`ClientRegistry`] maps each [`ClientId`] to the [`ConnectionHandle`]
//! of its live connection. Registration is last-connect-wins; removal is
//! compare-and-remove on the exact handle, so a superseded connection closing
//! late can never evict the connection that replaced it.

use dashmap::DashMap;
use futures_util::Stream;
use switchyard_proto::envelope::ClientId;
use switchyard_proto::session::{Exchange, Session, SessionError};
use uuid::Uuid;

/// A live connection the relay can address a peer through.
///
/// Clones refer to the same connection. Two handles are the same connection
/// only if [`ConnectionHandle::same_connection`] says so; sharing a
/// [`ClientId`] is not enough.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session: Session,
}

impl ConnectionHandle {
    /// Wraps the session of an accepted connection.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// Unique id of the underlying connection.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    /// The multiplexed session behind this handle.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Whether `other` is the very same connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.session.same_session(&other.session)
    }

    /// Opens a fresh exchange on `route` toward this peer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disposed`] if the connection is already closed.
    pub fn open_exchange<S>(&self, route: &str, outbound: S) -> Result<Exchange, SessionError>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        self.session.open_exchange(route, outbound)
    }

    /// Force-closes the connection. Idempotent.
    pub fn dispose(&self) {
        self.session.dispose();
    }

    /// Whether the connection has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.session.is_disposed()
    }

    /// Resolves once the connection is disposed.
    pub async fn closed(&self) {
        self.session.closed().await;
    }
}

/// Concurrent `ClientId` → [`ConnectionHandle`] map.
///
/// Backed by a sharded [`DashMap`], so unrelated connections never contend on
/// a single lock. No guard is held past the end of any method.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ConnectionHandle>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `id`, returning the handle it replaced.
    ///
    /// The replaced handle is not closed here; its own close path removes
    /// nothing because it no longer matches.
    pub fn put(&self, id: ClientId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.clients.insert(id, handle)
    }

    /// Returns the handle currently registered for `id`.
    #[must_use]
    pub fn get(&self, id: &ClientId) -> Option<ConnectionHandle> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `id` currently has a registered connection.
    #[must_use]
    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Removes the entry for `id` only if it still holds `handle`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if_same(&self, id: &ClientId, handle: &ConnectionHandle) -> bool {
        self.clients
            .remove_if(id, |_, current| current.same_connection(handle))
            .is_some()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of the registered ids.
    #[must_use]
    pub fn keys(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }
}
