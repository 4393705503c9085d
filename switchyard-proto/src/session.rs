//! Duplex exchange multiplexer over a single connection.
//!
//! A [`Session`] turns one ordered frame pipe into any number of concurrent
//! duplex exchanges. Either side may open an exchange with
//! [`Session::open_exchange`]; the other side dispatches it by route name
//! through its [`Routes`] table and streams responses back.
//!
//! The session never touches the socket itself. The transport pushes decoded
//! frames into [`Session::handle_frame`] and drains the outbound channel the
//! session was built with, so the same code runs over WebSocket in the relay,
//! over tungstenite in peers, and in-process via [`loopback`].

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::frame::{Frame, StreamId};

/// Why an exchange ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// The remote responder reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The session carrying the exchange was closed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session has been disposed and cannot open exchanges.
    #[error("session disposed")]
    Disposed,
}

/// One item received on an exchange.
pub type ExchangeItem = Result<Vec<u8>, ExchangeError>;

/// Response stream produced by a [`ChannelHandler`].
///
/// An `Err` item is sent to the requester as an error frame and ends the
/// exchange.
pub type ResponseStream = BoxStream<'static, ExchangeItem>;

/// Handles exchanges opened on one route.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Produce the response stream for a newly accepted exchange.
    fn handle(&self, inbound: Incoming) -> ResponseStream;
}

impl<F> ChannelHandler for F
where
    F: Fn(Incoming) -> ResponseStream + Send + Sync + 'static,
{
    fn handle(&self, inbound: Incoming) -> ResponseStream {
        self(inbound)
    }
}

/// Route name → handler table a session dispatches accepted exchanges on.
#[derive(Clone, Default)]
pub struct Routes {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl Routes {
    /// Creates an empty route table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`, replacing any previous handler.
    #[must_use]
    pub fn route(mut self, name: impl Into<String>, handler: impl ChannelHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Looks up the handler for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(name).cloned()
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Routes").field("handlers", &names).finish()
    }
}

/// Which end of the connection a session runs on.
///
/// Decides the parity of locally allocated stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side; opens odd-numbered exchanges.
    Client,
    /// The accepting side; opens even-numbered exchanges.
    Server,
}

impl Role {
    const fn first_stream_id(self) -> StreamId {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `stream_id` could have been allocated by the remote side.
    const fn is_remote_id(self, stream_id: StreamId) -> bool {
        stream_id != 0 && stream_id % 2 != self.first_stream_id() % 2
    }
}

struct Inner {
    id: Uuid,
    role: Role,
    outbound: mpsc::UnboundedSender<Frame>,
    routes: Routes,
    /// Receiving half of every live exchange, ours or the remote's.
    inbound: DashMap<StreamId, mpsc::UnboundedSender<ExchangeItem>>,
    /// Responses this side is currently producing.
    responders: DashMap<StreamId, CancellationToken>,
    next_stream_id: AtomicU32,
    disposed: CancellationToken,
}

impl Inner {
    fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// A multiplexed duplex connection.
///
/// Cheap to clone; all clones refer to the same connection. Use
/// [`Session::same_session`] to compare identity.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session that writes its frames to `outbound` and dispatches
    /// remote-opened exchanges through `routes`.
    #[must_use]
    pub fn new(role: Role, outbound: mpsc::UnboundedSender<Frame>, routes: Routes) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::now_v7(),
                role,
                outbound,
                routes,
                inbound: DashMap::new(),
                responders: DashMap::new(),
                next_stream_id: AtomicU32::new(role.first_stream_id()),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Unique id of this connection, for logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The side of the connection this session runs on.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether `other` refers to the same connection as `self`.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether [`Session::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Resolves once the session is disposed.
    pub async fn closed(&self) {
        self.inner.disposed.cancelled().await;
    }

    /// Queues a raw frame for the transport. Returns `false` once the
    /// transport has gone away.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.inner.send(frame)
    }

    /// Opens a new exchange on `route`, streaming `outbound` as its requests.
    ///
    /// The returned [`Exchange`] yields the remote's responses. Dropping it
    /// before it finishes cancels the exchange on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disposed`] if the session has been disposed.
    pub fn open_exchange<S>(&self, route: &str, outbound: S) -> Result<Exchange, SessionError>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inbound.insert(stream_id, tx);

        // dispose() may have drained the table between the check and the insert.
        if self.is_disposed()
            || !self.inner.send(Frame::RequestChannel {
                stream_id,
                route: route.to_string(),
            })
        {
            self.inner.inbound.remove(&stream_id);
            return Err(SessionError::Disposed);
        }

        tracing::trace!(session = %self.inner.id, stream_id, route, "exchange opened");

        let pump = self.inner.disposed.child_token();
        tokio::spawn(pump_requests(
            self.inner.outbound.clone(),
            stream_id,
            outbound,
            pump.clone(),
        ));

        Ok(Exchange {
            stream_id,
            rx,
            session: Arc::downgrade(&self.inner),
            pump,
            finished: false,
        })
    }

    /// Applies one frame received from the remote side.
    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Setup { route, .. } => {
                tracing::warn!(session = %self.inner.id, route = %route, "unexpected setup frame on open session");
            }
            Frame::RequestChannel { stream_id, route } => self.accept(stream_id, &route),
            Frame::Payload { stream_id, data } => {
                if let Some(tx) = self.inner.inbound.get(&stream_id) {
                    let _ = tx.send(Ok(data));
                } else {
                    tracing::debug!(session = %self.inner.id, stream_id, "payload for unknown exchange");
                }
            }
            Frame::Complete { stream_id } => {
                self.inner.inbound.remove(&stream_id);
            }
            Frame::Cancel { stream_id } => {
                if let Some((_, token)) = self.inner.responders.remove(&stream_id) {
                    token.cancel();
                }
                self.inner.inbound.remove(&stream_id);
            }
            Frame::Error { stream_id, reason } => {
                if let Some((_, tx)) = self.inner.inbound.remove(&stream_id) {
                    let _ = tx.send(Err(ExchangeError::Remote(reason)));
                }
            }
        }
    }

    /// Closes the session: every open exchange fails with
    /// [`ExchangeError::ConnectionClosed`] and every responder is cancelled.
    ///
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();

        let open: Vec<StreamId> = self.inner.inbound.iter().map(|e| *e.key()).collect();
        for stream_id in open {
            if let Some((_, tx)) = self.inner.inbound.remove(&stream_id) {
                let _ = tx.send(Err(ExchangeError::ConnectionClosed));
            }
        }
        // Responder tokens are children of `disposed` and already cancelled.
        self.inner.responders.clear();
        tracing::debug!(session = %self.inner.id, "session disposed");
    }

    fn accept(&self, stream_id: StreamId, route: &str) {
        if self.is_disposed() {
            return;
        }
        if !self.inner.role.is_remote_id(stream_id)
            || self.inner.inbound.contains_key(&stream_id)
            || self.inner.responders.contains_key(&stream_id)
        {
            tracing::warn!(session = %self.inner.id, stream_id, "rejecting exchange with invalid stream id");
            self.inner.send(Frame::Error {
                stream_id,
                reason: format!("invalid stream id {stream_id}"),
            });
            return;
        }
        let Some(handler) = self.inner.routes.get(route) else {
            tracing::debug!(session = %self.inner.id, stream_id, route, "no handler for route");
            self.inner.send(Frame::Error {
                stream_id,
                reason: format!("no handler for route {route}"),
            });
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inbound.insert(stream_id, tx);
        let cancel = self.inner.disposed.child_token();
        self.inner.responders.insert(stream_id, cancel.clone());

        tracing::trace!(session = %self.inner.id, stream_id, route, "exchange accepted");
        let responses = handler.handle(Incoming { stream_id, rx });
        tokio::spawn(pump_responses(
            Arc::clone(&self.inner),
            stream_id,
            responses,
            cancel,
        ));
    }
}

/// Streams one exchange's requests onto the wire, then completes it.
async fn pump_requests<S>(
    outbound: mpsc::UnboundedSender<Frame>,
    stream_id: StreamId,
    items: S,
    stop: CancellationToken,
) where
    S: Stream<Item = Vec<u8>> + Send + 'static,
{
    let mut items = std::pin::pin!(items);
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            next = items.next() => match next {
                Some(data) => {
                    if outbound.send(Frame::Payload { stream_id, data }).is_err() {
                        return;
                    }
                }
                None => {
                    let _ = outbound.send(Frame::Complete { stream_id });
                    return;
                }
            },
        }
    }
}

/// Streams a handler's responses onto the wire until it ends or is cancelled.
async fn pump_responses(
    inner: Arc<Inner>,
    stream_id: StreamId,
    mut responses: ResponseStream,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                tracing::trace!(session = %inner.id, stream_id, "responder cancelled");
                break;
            }
            next = responses.next() => next,
        };
        match next {
            Some(Ok(data)) => {
                if !inner.send(Frame::Payload { stream_id, data }) {
                    break;
                }
            }
            Some(Err(e)) => {
                inner.send(Frame::Error {
                    stream_id,
                    reason: e.to_string(),
                });
                break;
            }
            None => {
                inner.send(Frame::Complete { stream_id });
                break;
            }
        }
    }
    inner.responders.remove(&stream_id);
    inner.inbound.remove(&stream_id);
}

/// Requester's view of an exchange: the stream of remote responses.
///
/// Ends after the responder completes, errors, or the session closes.
/// Dropping an unfinished exchange sends a cancel to the responder.
pub struct Exchange {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<ExchangeItem>,
    session: Weak<Inner>,
    pump: CancellationToken,
    finished: bool,
}

impl Exchange {
    /// Id of this exchange within its session.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for Exchange {
    type Item = ExchangeItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if matches!(polled, Poll::Ready(None)) {
            self.finished = true;
        }
        polled
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.pump.cancel();
        if self.finished {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            inner.inbound.remove(&self.stream_id);
            if !inner.disposed.is_cancelled() {
                inner.send(Frame::Cancel {
                    stream_id: self.stream_id,
                });
            }
        }
    }
}

/// Responder's view of an exchange: the stream of the requester's items.
pub struct Incoming {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<ExchangeItem>,
}

impl Incoming {
    /// Id of this exchange within its session.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl Stream for Incoming {
    type Item = ExchangeItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Creates two sessions wired back to back in-process.
///
/// The first is the client side, the second the server side. Disposing
/// either one disposes its partner, like a dropped connection would.
#[must_use]
pub fn loopback(client_routes: Routes, server_routes: Routes) -> (Session, Session) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let client = Session::new(Role::Client, client_tx, client_routes);
    let server = Session::new(Role::Server, server_tx, server_routes);
    tokio::spawn(forward(client_rx, client.clone(), server.clone()));
    tokio::spawn(forward(server_rx, server.clone(), client.clone()));
    (client, server)
}

async fn forward(mut frames: mpsc::UnboundedReceiver<Frame>, from: Session, to: Session) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => to.handle_frame(frame),
                None => break,
            },
            () = from.closed() => break,
            () = to.closed() => break,
        }
    }
    to.dispose();
    from.dispose();
}
