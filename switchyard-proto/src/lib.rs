//! Shared protocol definitions for the Switchyard relay.
//!
//! Holds the addressed [`envelope::MessageEnvelope`], the wire [`frame::Frame`]
//! set with its postcard [`codec`], the well-known [`route`] names, and the
//! duplex [`session`] multiplexer both the relay and its peers run.

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod route;
pub mod session;
