//! Transport error taxonomy

use crate::io::process::ProcessError;
use crate::rpc::protocol::JsonRpcErrorObject;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced to callers of `Transport::send_request` and the lifecycle
/// operations.
///
/// Cloneable so test doubles can replay the same injected error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No subprocess; `initialize` has not been called
    #[error("Transport is not connected (initialize has not been called)")]
    NotConnected,

    /// The executable is missing or the spawn failed
    #[error("Failed to launch control-plane process: {0}")]
    Launch(#[from] ProcessError),

    /// No response within the allotted window
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The peer answered with a JSON-RPC error object
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Writing or reading one of the process streams failed
    #[error("Transport I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The transport was torn down while (or before) the request was in flight
    #[error("Transport closed")]
    Closed,

    /// The request could not be encoded, or the reply to it could not be decoded
    #[error("JSON-RPC serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<JsonRpcErrorObject> for TransportError {
    fn from(err: JsonRpcErrorObject) -> Self {
        TransportError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
