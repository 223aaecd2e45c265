//! Typed asynchronous client for the studio control plane

use crate::rpc::error::TransportError;
use crate::rpc::transport::Transport;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Control-plane method names
pub mod methods {
    pub const PING: &str = "ping";
    pub const SET_DOCUMENT: &str = "set_document";
    pub const RENDER_FRAME: &str = "render_frame";
    pub const SWITCH_VIEW: &str = "switch_view";
    pub const SET_UNIFORM: &str = "set_uniform";
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by the façade
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid parameters for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Failed to encode parameters for '{method}': {reason}")]
    Encode { method: String, reason: String },

    #[error("Unexpected response to '{method}': {reason}")]
    UnexpectedResponse { method: String, reason: String },

    #[error("Blocking call to '{method}' issued from inside an async runtime")]
    BlockingInRuntime { method: String },
}

impl ClientError {
    fn invalid(method: &str, reason: impl Into<String>) -> Self {
        ClientError::InvalidParams {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    /// The underlying transport error, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            ClientError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDocumentParams {
    /// Shader source text
    pub source: String,

    /// Where the document lives on disk, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrameParams {
    /// Shader time in seconds
    pub time: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchViewParams {
    pub view: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetUniformParams {
    pub name: String,
    pub value: Value,
}

impl SetDocumentParams {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.source.trim().is_empty() {
            return Err(ClientError::invalid(methods::SET_DOCUMENT, "source is empty"));
        }
        Ok(())
    }
}

impl RenderFrameParams {
    pub fn validate(&self) -> Result<(), ClientError> {
        if !self.time.is_finite() {
            return Err(ClientError::invalid(
                methods::RENDER_FRAME,
                format!("time must be finite, got {}", self.time),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ClientError::invalid(
                methods::RENDER_FRAME,
                format!("size must be non-zero, got {}x{}", self.width, self.height),
            ));
        }
        Ok(())
    }
}

impl SwitchViewParams {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.view.trim().is_empty() {
            return Err(ClientError::invalid(methods::SWITCH_VIEW, "view is empty"));
        }
        Ok(())
    }
}

impl SetUniformParams {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.name.trim().is_empty() {
            return Err(ClientError::invalid(methods::SET_UNIFORM, "uniform name is empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Maps studio operations onto transport requests
pub struct StudioClient<T: Transport + ?Sized> {
    transport: Arc<T>,
    request_timeout: Option<Duration>,
}

impl<T: Transport + ?Sized> Clone for StudioClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            request_timeout: self.request_timeout,
        }
    }
}

impl<T: Transport + ?Sized> StudioClient<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            request_timeout: None,
        }
    }

    /// Per-request timeout; without one the transport default applies
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.call_raw(methods::PING, None).await.map(|_| ())
    }

    pub async fn set_document(&self, source: &str, path: Option<&str>) -> Result<Value, ClientError> {
        let params = SetDocumentParams {
            source: source.to_string(),
            path: path.map(str::to_string),
        };
        params.validate()?;
        self.call(methods::SET_DOCUMENT, Some(&params)).await
    }

    pub async fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<Value, ClientError> {
        let params = RenderFrameParams {
            time,
            width,
            height,
        };
        params.validate()?;
        self.call(methods::RENDER_FRAME, Some(&params)).await
    }

    pub async fn switch_view(&self, view: &str) -> Result<Value, ClientError> {
        let params = SwitchViewParams {
            view: view.to_string(),
        };
        params.validate()?;
        self.call(methods::SWITCH_VIEW, Some(&params)).await
    }

    pub async fn set_uniform(&self, name: &str, value: Value) -> Result<Value, ClientError> {
        let params = SetUniformParams {
            name: name.to_string(),
            value,
        };
        params.validate()?;
        self.call(methods::SET_UNIFORM, Some(&params)).await
    }

    /// Typed request: encode `params`, decode the result into `R`
    pub async fn call<P, R>(&self, method: &str, params: Option<&P>) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ClientError::Encode {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        let result = self.call_raw(method, params).await?;
        serde_json::from_value(result).map_err(|e| ClientError::UnexpectedResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Untyped request
    pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        Ok(self
            .transport
            .send_request(method, params, self.request_timeout)
            .await?)
    }
}
