//! Relay routing: forward each envelope onto its receiver's connection.
//!
//! For every envelope a sender streams in, the [`Router`] looks the receiver
//! up in the [`ClientRegistry`], opens a fresh `call` exchange on the
//! receiver's connection carrying that one envelope, and streams the
//! receiver's replies back to the sender.
//!
//! A sender has at most one forwarded exchange in flight. [`SwitchRelay`]
//! drops (and so cancels) the previous exchange before starting the next,
//! so the sender only ever sees replies from its most recent target.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use switchyard_proto::codec;
use switchyard_proto::envelope::{ClientId, MessageEnvelope};
use switchyard_proto::route;
use switchyard_proto::session::{
    ChannelHandler, Exchange, ExchangeItem, Incoming, ResponseStream,
};

use crate::error::RelayError;
use crate::registry::ClientRegistry;

/// Which relay route an exchange arrived on.
///
/// Both modes route each envelope to the single receiver it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// `personal.call`
    Personal,
    /// `group.call`; same single-receiver routing as [`RelayMode::Personal`].
    Group,
}

impl RelayMode {
    /// Route name this mode is served on.
    #[must_use]
    pub const fn route(self) -> &'static str {
        match self {
            Self::Personal => route::PERSONAL_CALL,
            Self::Group => route::GROUP_CALL,
        }
    }
}

/// Resolves receivers and opens forwarding exchanges.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ClientRegistry>,
    enforce_sender: bool,
}

impl Router {
    /// Creates a router over `registry`, forwarding envelopes verbatim.
    #[must_use]
    pub const fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            enforce_sender: false,
        }
    }

    /// When enabled, the `sender` field of every relayed envelope is
    /// overwritten with the client id of the connection it arrived on.
    #[must_use]
    pub const fn with_sender_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_sender = enforce;
        self
    }

    /// The registry receivers are resolved against.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Opens a new `call` exchange on the envelope's receiver carrying the
    /// envelope as its only request.
    ///
    /// # Errors
    ///
    /// - [`RelayError::RecipientUnreachable`] if the receiver is not registered.
    /// - [`RelayError::PeerExchangeFailure`] if the exchange cannot be opened.
    pub fn forward(&self, envelope: &MessageEnvelope) -> Result<Forwarding, RelayError> {
        let receiver = envelope.receiver.clone();
        let Some(handle) = self.registry.get(&receiver) else {
            return Err(RelayError::RecipientUnreachable(receiver));
        };
        let payload =
            codec::encode_envelope(envelope).map_err(|e| RelayError::PeerExchangeFailure {
                receiver: receiver.clone(),
                reason: e.to_string(),
            })?;
        let exchange = handle
            .open_exchange(route::CALL, stream::iter([payload]))
            .map_err(|e| RelayError::PeerExchangeFailure {
                receiver: receiver.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            receiver = %receiver,
            connection = %handle.id(),
            stream_id = exchange.stream_id(),
            "forwarding exchange opened"
        );
        Ok(Forwarding { receiver, exchange })
    }

    /// Relays `inbound` envelopes from `sender`, yielding the replies of the
    /// most recently addressed receiver.
    pub fn relay<S>(&self, sender: ClientId, mode: RelayMode, inbound: S) -> SwitchRelay
    where
        S: Stream<Item = MessageEnvelope> + Send + 'static,
    {
        SwitchRelay {
            router: self.clone(),
            sender,
            mode,
            inbound: Some(inbound.boxed()),
            active: None,
        }
    }

    /// Builds the session route handler serving `mode` for `sender`'s
    /// connection.
    ///
    /// Undecodable requests are skipped; the exchange only ends when the
    /// sender completes it or the connection goes away.
    pub fn channel_handler(&self, sender: ClientId, mode: RelayMode) -> impl ChannelHandler {
        let router = self.clone();
        move |inbound: Incoming| -> ResponseStream {
            tracing::info!(client_id = %sender, route = mode.route(), "received channel request");
            let from = sender.clone();
            let envelopes = inbound.filter_map(move |item: ExchangeItem| {
                let decoded = match item {
                    Ok(bytes) => match codec::decode_envelope(&bytes) {
                        Ok(envelope) => Some(envelope),
                        Err(e) => {
                            tracing::warn!(client_id = %from, error = %e, "dropping undecodable envelope");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::debug!(client_id = %from, error = %e, "sender exchange ended");
                        None
                    }
                };
                future::ready(decoded)
            });

            router
                .relay(sender.clone(), mode, envelopes)
                .filter_map(|reply| {
                    let encoded = match codec::encode_envelope(&reply) {
                        Ok(bytes) => Some(Ok(bytes)),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping unencodable reply");
                            None
                        }
                    };
                    future::ready(encoded)
                })
                .boxed()
        }
    }
}

/// One envelope's forwarding exchange: the receiver's decoded replies.
pub struct Forwarding {
    receiver: ClientId,
    exchange: Exchange,
}

impl Forwarding {
    /// Receiver this exchange was opened on.
    #[must_use]
    pub const fn receiver(&self) -> &ClientId {
        &self.receiver
    }
}

impl fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarding")
            .field("receiver", &self.receiver)
            .field("exchange", &self.exchange)
            .finish()
    }
}

impl Stream for Forwarding {
    type Item = Result<MessageEnvelope, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.exchange.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => match codec::decode_envelope(&bytes) {
                    Ok(reply) => return Poll::Ready(Some(Ok(reply))),
                    Err(e) => {
                        tracing::warn!(receiver = %self.receiver, error = %e, "skipping undecodable reply");
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(RelayError::PeerExchangeFailure {
                        receiver: self.receiver.clone(),
                        reason: e.to_string(),
                    })));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// A sender's relay output with switch semantics.
///
/// Holds at most one active [`Forwarding`]. Each new inbound envelope drops
/// the current one (cancelling it on the receiver) before its own exchange
/// is opened. Unreachable receivers and failed exchanges contribute nothing
/// and never end the stream; it ends once the inbound side has ended and the
/// last exchange has finished.
pub struct SwitchRelay {
    router: Router,
    sender: ClientId,
    mode: RelayMode,
    inbound: Option<BoxStream<'static, MessageEnvelope>>,
    active: Option<Forwarding>,
}

impl SwitchRelay {
    /// Receiver of the exchange currently being relayed, if any.
    #[must_use]
    pub fn active_receiver(&self) -> Option<&ClientId> {
        self.active.as_ref().map(Forwarding::receiver)
    }

    fn switch_to(&mut self, mut envelope: MessageEnvelope) {
        tracing::debug!(
            route = self.mode.route(),
            sender = %envelope.sender,
            receiver = %envelope.receiver,
            content = %envelope.content,
            "relaying envelope"
        );

        if let Some(previous) = self.active.take() {
            tracing::debug!(
                client_id = %self.sender,
                previous = %previous.receiver,
                "superseding in-flight exchange"
            );
            drop(previous);
        }

        if self.router.enforce_sender && envelope.sender != self.sender {
            tracing::debug!(
                client_id = %self.sender,
                claimed = %envelope.sender,
                "overwriting envelope sender"
            );
            envelope.sender = self.sender.clone();
        }

        match self.router.forward(&envelope) {
            Ok(forwarding) => self.active = Some(forwarding),
            Err(e) => {
                tracing::info!(client_id = %self.sender, error = %e, "envelope not forwarded");
            }
        }
    }
}

impl fmt::Debug for SwitchRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchRelay")
            .field("sender", &self.sender)
            .field("mode", &self.mode)
            .field("inbound_open", &self.inbound.is_some())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Stream for SwitchRelay {
    type Item = MessageEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        // Take every envelope already waiting so only the newest target stays live.
        while let Some(inbound) = this.inbound.as_mut() {
            match inbound.poll_next_unpin(cx) {
                Poll::Ready(Some(envelope)) => this.switch_to(envelope),
                Poll::Ready(None) => this.inbound = None,
                Poll::Pending => break,
            }
        }

        while let Some(active) = this.active.as_mut() {
            match active.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(reply))) => return Poll::Ready(Some(reply)),
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(client_id = %this.sender, error = %e, "forwarding failed");
                    this.active = None;
                }
                Poll::Ready(None) => {
                    tracing::trace!(client_id = %this.sender, "forwarding exchange complete");
                    this.active = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if this.inbound.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
