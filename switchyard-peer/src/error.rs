//! Errors surfaced by the peer client.

use switchyard_proto::codec::CodecError;
use switchyard_proto::session::{ExchangeError, SessionError};

/// Errors that can occur while talking to a relay.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The relay URL is malformed or not a `ws://`/`wss://` URL.
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl {
        /// URL as given.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Connecting to the relay took too long.
    #[error("connection to relay timed out")]
    Timeout,

    /// The relay refused or could not be reached.
    #[error("relay {0} is unreachable")]
    Unreachable(String),

    /// The WebSocket handshake or a socket operation failed.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection to the relay is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An exchange ended with a failure.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// An envelope or frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<SessionError> for PeerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Disposed => Self::ConnectionClosed,
        }
    }
}
