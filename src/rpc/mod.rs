//! JSON-RPC layer
//!
//! Everything between a byte stream and a typed call:
//!
//! - **protocol**: JSON-RPC 2.0 envelopes and inbound classification
//! - **pending**: request ids and their completion slots
//! - **connection**: read loop, framed writes and correlation
//! - **health**: consecutive-failure tracking and the ping loop
//! - **transport**: the `Transport` trait and the subprocess implementation
//! - **testing**: in-memory transports for callers' tests

pub mod connection;
pub mod error;
pub mod health;
pub mod pending;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use error::TransportError;
pub use transport::{ConnectionState, ProcessTransport, StateTransition, Transport};
