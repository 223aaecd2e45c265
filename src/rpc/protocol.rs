//! JSON-RPC 2.0 protocol layer
//!
//! Envelope types for outbound requests and inbound responses, plus the
//! classification of inbound lines used by the read loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried by every request
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: u64,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Request identifier (matches the request)
    pub id: u64,

    /// Result (present if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(JsonRpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC error codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl JsonRpcErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Check if the given code is in the server error range (-32099 to -32000)
    pub fn is_server_error(code: i64) -> bool {
        (-32099..=-32000).contains(&code)
    }
}

// ============================================================================
// Inbound Classification
// ============================================================================

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcErrorObject>,
    },
    /// Request or notification initiated by the peer
    PeerMessage { method: String },
}

/// Reasons an inbound line is discarded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no usable id")]
    MissingId,

    #[error("response {id} carries an undecodable error object: {source}")]
    InvalidErrorObject {
        id: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one framed line.
///
/// A response without `result` and without `error` resolves to `null`.
pub fn decode_inbound(line: &[u8]) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_slice(line)?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    if let Some(Value::String(method)) = object.get("method") {
        return Ok(Inbound::PeerMessage {
            method: method.clone(),
        });
    }

    let id = object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or(DecodeError::MissingId)?;

    match object.remove("error") {
        Some(Value::Null) | None => {}
        Some(error) => {
            let error = serde_json::from_value::<JsonRpcErrorObject>(error)
                .map_err(|source| DecodeError::InvalidErrorObject { id, source })?;
            return Ok(Inbound::Response {
                id,
                outcome: Err(error),
            });
        }
    }

    let result = object.remove("result").unwrap_or(Value::Null);
    Ok(Inbound::Response {
        id,
        outcome: Ok(result),
    })
}
