//! Wire frames exchanged over a relay connection.
//!
//! Each WebSocket binary message carries exactly one postcard-encoded
//! [`Frame`]. A connection starts with a single [`Frame::Setup`] from the
//! client; everything after that belongs to a numbered duplex exchange.

use serde::{Deserialize, Serialize};

/// Identifier of one duplex exchange within a connection.
///
/// Client-initiated exchanges use odd ids, relay-initiated exchanges use even
/// ids, so both sides can open exchanges without coordinating.
pub type StreamId = u32;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Connection setup, sent once by the client before anything else.
    Setup {
        /// Setup route name (`connect`).
        route: String,
        /// Setup payload: the client's declared identifier.
        data: String,
    },

    /// Opens a new duplex exchange on `route`.
    RequestChannel {
        /// Exchange id chosen by the requester.
        stream_id: StreamId,
        /// Route the responder should dispatch on.
        route: String,
    },

    /// One item of an exchange, in either direction.
    Payload {
        /// Exchange the item belongs to.
        stream_id: StreamId,
        /// Encoded item.
        data: Vec<u8>,
    },

    /// The sending side has no more items for this exchange.
    Complete {
        /// Exchange being completed.
        stream_id: StreamId,
    },

    /// The requester is no longer interested in responses.
    Cancel {
        /// Exchange being cancelled.
        stream_id: StreamId,
    },

    /// The responder failed; the exchange is over.
    Error {
        /// Exchange that failed.
        stream_id: StreamId,
        /// Human-readable failure description.
        reason: String,
    },
}

impl Frame {
    /// Exchange this frame belongs to, or `None` for [`Frame::Setup`].
    #[must_use]
    pub const fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::Setup { .. } => None,
            Self::RequestChannel { stream_id, .. }
            | Self::Payload { stream_id, .. }
            | Self::Complete { stream_id }
            | Self::Cancel { stream_id }
            | Self::Error { stream_id, .. } => Some(*stream_id),
        }
    }
}
