//! Switchyard relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay keeps
//! a registry of connected peers and forwards each addressed envelope onto
//! its receiver's own connection, streaming the receiver's replies back to
//! the sender.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod server;
