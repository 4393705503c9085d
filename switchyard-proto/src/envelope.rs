//! The addressed message unit carried over relay exchanges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier a peer declares for itself when it connects.
///
/// Opaque to the relay: it is neither validated nor authenticated, only used
/// as the key peers are addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A message addressed from one peer to another.
///
/// The relay reads `receiver` for routing and otherwise forwards the
/// envelope as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Peer the message claims to come from.
    pub sender: ClientId,
    /// Peer the message should be routed to.
    pub receiver: ClientId,
    /// Free-form message body.
    pub content: String,
}

impl MessageEnvelope {
    /// Build an envelope from its three fields.
    pub fn new(
        sender: impl Into<ClientId>,
        receiver: impl Into<ClientId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
        }
    }

    /// Turn this envelope around so it is addressed back to its sender.
    ///
    /// `from` becomes the new sender and `content` replaces the body.
    #[must_use]
    pub fn reply(self, from: ClientId, content: impl Into<String>) -> Self {
        Self {
            sender: from,
            receiver: self.sender,
            content: content.into(),
        }
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {}",
            self.sender, self.receiver, self.content
        )
    }
}
