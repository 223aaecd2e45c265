//! Subprocess JSON-RPC transport for the studio control plane.
//!
//! Launches the control-plane server as a child process, exchanges
//! newline-delimited JSON-RPC 2.0 messages over its stdio, enforces
//! per-request timeouts and relaunches the server when health checks fail.
//! A small façade maps studio operations onto requests.

pub mod config;
pub mod io;
pub mod logging;
pub mod rpc;
pub mod studio;

#[cfg(test)]
mod test_utils;

pub use config::{ConfigError, HealthConfig, TransportConfig};
pub use rpc::{ConnectionState, ProcessTransport, StateTransition, Transport, TransportError};
pub use studio::{BlockingStudioClient, ClientError, ControlPlane, StudioClient};
