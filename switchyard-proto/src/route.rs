//! Well-known route names.

/// Setup route a client declares its identifier on.
pub const CONNECT: &str = "connect";

/// Relay route: forward each envelope to its receiver, newest target wins.
pub const PERSONAL_CALL: &str = "personal.call";

/// Relay route with the same single-receiver routing as [`PERSONAL_CALL`].
///
/// Despite the name there is no fan-out: each envelope still goes to the one
/// receiver it names.
pub const GROUP_CALL: &str = "group.call";

/// Peer-side route the relay opens on a receiver to deliver an envelope.
pub const CALL: &str = "call";

/// Peer-side liveness probe the relay opens on a freshly connected client.
pub const CLIENT_STATUS: &str = "client-status";

/// Payload the relay sends on [`CLIENT_STATUS`] when a client connects.
pub const STATUS_OPEN: &str = "OPEN";
