//! WebSocket connection from a peer to a Switchyard relay.
//!
//! [`RelayPeer::connect`] opens the socket, declares the peer's client id
//! with a `connect` setup frame and binds the socket to a client-side
//! [`Session`]. Exchanges the relay opens toward the peer (`call`,
//! `client-status`) are served by the [`Routes`] given at connect time.

use std::time::Duration;

use futures_util::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt, future};
use switchyard_proto::codec;
use switchyard_proto::envelope::{ClientId, MessageEnvelope};
use switchyard_proto::frame::Frame;
use switchyard_proto::route;
use switchyard_proto::session::{ExchangeItem, Role, Routes, Session};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::PeerError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of the relay WebSocket.
type WsSender = SplitSink<WsStream, Message>;

/// Read half of the relay WebSocket.
type WsReader = SplitStream<WsStream>;

/// Default timeout for connecting to the relay server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Replies relayed back on a channel, decoded.
pub type EnvelopeStream = BoxStream<'static, Result<MessageEnvelope, PeerError>>;

/// A peer's live connection to the relay.
///
/// Dropping the peer closes the connection.
pub struct RelayPeer {
    client_id: ClientId,
    relay_url: String,
    session: Session,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for RelayPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPeer")
            .field("client_id", &self.client_id)
            .field("relay_url", &self.relay_url)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl RelayPeer {
    /// Connects to the relay at `relay_url` as `client_id`.
    ///
    /// Performs the following steps:
    /// 1. Checks that `relay_url` is a `ws://` or `wss://` URL
    /// 2. Establishes the WebSocket connection (10s timeout)
    /// 3. Sends the `connect` setup frame carrying `client_id`
    /// 4. Spawns the reader and writer tasks driving the session
    ///
    /// The relay does not acknowledge setup; the peer becomes addressable
    /// once the relay has processed the setup frame.
    ///
    /// # Errors
    ///
    /// - [`PeerError::InvalidUrl`] if the URL is malformed or not WebSocket.
    /// - [`PeerError::Timeout`] if the connection attempt times out.
    /// - [`PeerError::Unreachable`] if the relay refuses the connection.
    /// - [`PeerError::Io`] for handshake and socket failures.
    pub async fn connect(
        relay_url: &str,
        client_id: ClientId,
        routes: Routes,
    ) -> Result<Self, PeerError> {
        validate_url(relay_url)?;

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(relay_url))
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                PeerError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = relay_url, error = %e, "relay WebSocket connect failed");
                map_ws_connect_error(relay_url, e)
            })?;

        let (mut ws_sender, ws_reader) = ws_stream.split();

        let setup = Frame::Setup {
            route: route::CONNECT.to_string(),
            data: client_id.as_str().to_string(),
        };
        let setup_bytes = codec::encode_frame(&setup)?;
        ws_sender
            .send(Message::Binary(setup_bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to send setup frame");
                PeerError::Io(std::io::Error::other(format!("failed to send setup: {e}")))
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(Role::Client, tx, routes);
        let writer_handle = tokio::spawn(writer_loop(ws_sender, rx, session.clone()));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, session.clone()));

        tracing::info!(client_id = %client_id, url = relay_url, "connected to relay");

        Ok(Self {
            client_id,
            relay_url: relay_url.to_string(),
            session,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// The client id this peer declared.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The relay URL this peer is connected to.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Opens a duplex exchange on `route`, sending `envelopes` and yielding
    /// the replies the relay forwards back.
    ///
    /// Dropping the returned stream cancels the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ConnectionClosed`] if the connection is closed.
    pub fn channel<S>(&self, route: &str, envelopes: S) -> Result<EnvelopeStream, PeerError>
    where
        S: Stream<Item = MessageEnvelope> + Send + 'static,
    {
        let requests = envelopes.filter_map(|envelope| {
            let encoded = match codec::encode_envelope(&envelope) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(receiver = %envelope.receiver, error = %e, "dropping unencodable envelope");
                    None
                }
            };
            future::ready(encoded)
        });
        let exchange = self.session.open_exchange(route, requests)?;
        tracing::debug!(client_id = %self.client_id, route, stream_id = exchange.stream_id(), "channel opened");

        Ok(exchange
            .map(|item: ExchangeItem| -> Result<MessageEnvelope, PeerError> {
                Ok(codec::decode_envelope(&item?)?)
            })
            .boxed())
    }

    /// [`RelayPeer::channel`] on `personal.call`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ConnectionClosed`] if the connection is closed.
    pub fn personal_call<S>(&self, envelopes: S) -> Result<EnvelopeStream, PeerError>
    where
        S: Stream<Item = MessageEnvelope> + Send + 'static,
    {
        self.channel(route::PERSONAL_CALL, envelopes)
    }

    /// [`RelayPeer::channel`] on `group.call`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::ConnectionClosed`] if the connection is closed.
    pub fn group_call<S>(&self, envelopes: S) -> Result<EnvelopeStream, PeerError>
    where
        S: Stream<Item = MessageEnvelope> + Send + 'static,
    {
        self.channel(route::GROUP_CALL, envelopes)
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        if !self.session.is_disposed() {
            tracing::info!(client_id = %self.client_id, "closing relay connection");
        }
        self.session.dispose();
    }

    /// Whether the connection is closed, locally or by the relay.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_disposed()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.session.closed().await;
    }
}

impl Drop for RelayPeer {
    fn drop(&mut self) {
        self.session.dispose();
    }
}

/// Checks that `relay_url` is a WebSocket URL.
fn validate_url(relay_url: &str) -> Result<(), PeerError> {
    let parsed = url::Url::parse(relay_url).map_err(|e| PeerError::InvalidUrl {
        url: relay_url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(PeerError::InvalidUrl {
            url: relay_url.to_string(),
            reason: format!("unsupported scheme {other}, expected ws or wss"),
        }),
    }
}

/// Forwards session frames to the socket until the session is disposed.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    session: Session,
) {
    loop {
        tokio::select! {
            () = session.closed() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let bytes = match codec::encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                    tracing::warn!(error = %e, "relay WebSocket write failed");
                    session.dispose();
                    break;
                }
            }
        }
    }
}

/// Feeds socket frames into the session; disposes it when the socket ends.
async fn reader_loop(mut ws_reader: WsReader, session: Session) {
    loop {
        let msg = tokio::select! {
            () = session.closed() => return,
            msg = ws_reader.next() => msg,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => match codec::decode_frame(&data) {
                Ok(frame) => session.handle_frame(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed relay frame, skipping");
                }
            },
            Some(Ok(Message::Close(_))) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Some(Ok(_)) => {
                // Ping, pong and text frames carry nothing for the session.
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "relay WebSocket read error");
                break;
            }
            None => break,
        }
    }
    session.dispose();
}

/// Maps a WebSocket connect error to a [`PeerError`].
fn map_ws_connect_error(relay_url: &str, err: tokio_tungstenite::tungstenite::Error) -> PeerError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                PeerError::Unreachable(relay_url.to_string())
            } else {
                PeerError::Io(io_err)
            }
        }
        WsError::Http(response) => PeerError::Io(std::io::Error::other(format!(
            "relay HTTP error: status {}",
            response.status()
        ))),
        other => PeerError::Io(std::io::Error::other(format!(
            "relay connection error: {other}"
        ))),
    }
}
