//! Peer side of the Switchyard relay.
//!
//! [`client::RelayPeer`] connects to a relay over WebSocket, declares its
//! client id and relays envelopes through it; [`responder`] holds the routes
//! a peer serves back to the relay.

pub mod client;
pub mod error;
pub mod responder;
