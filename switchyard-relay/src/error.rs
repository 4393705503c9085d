//! Failure taxonomy for relay routing and connection handling.
//!
//! None of these tear down a sender's session. They are returned from the
//! fallible routing steps and end up as structured log fields.

use switchyard_proto::envelope::ClientId;
use uuid::Uuid;

use crate::lifecycle::CloseCause;

/// Outcomes the relay reports but never escalates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// A client connected with an id that already had a live connection.
    /// The newer connection wins; informational only.
    #[error("client {client_id} reconnected, superseding connection {previous}")]
    RegistrationConflict {
        /// The reused client id.
        client_id: ClientId,
        /// Connection id of the superseded handle.
        previous: Uuid,
    },

    /// The receiver named by an envelope is not registered.
    #[error("recipient {0} is not connected")]
    RecipientUnreachable(ClientId),

    /// The exchange opened toward a receiver failed.
    #[error("exchange with {receiver} failed: {reason}")]
    PeerExchangeFailure {
        /// Receiver the exchange was opened on.
        receiver: ClientId,
        /// Failure description.
        reason: String,
    },

    /// A connection reached its terminal state.
    #[error("connection of {client_id} terminated: {cause}")]
    ConnectionTerminated {
        /// Client whose connection ended.
        client_id: ClientId,
        /// What ended it.
        cause: CloseCause,
    },
}
