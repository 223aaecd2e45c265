//! Blocking façade
//!
//! `ControlPlane` is the synchronous contract used by callers that cannot
//! await, such as UI event handlers. `BlockingStudioClient` implements it by
//! running each call on a Tokio runtime and parking the calling thread on a
//! one-shot channel until the result arrives.

use crate::rpc::error::TransportError;
use crate::rpc::transport::Transport;
use crate::studio::client::{ClientError, StudioClient, methods};
use serde_json::Value;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// Synchronous control-plane operations
pub trait ControlPlane: Send + Sync {
    fn ping(&self) -> Result<(), ClientError>;

    fn set_document(&self, source: &str, path: Option<&str>) -> Result<Value, ClientError>;

    fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<Value, ClientError>;

    fn switch_view(&self, view: &str) -> Result<Value, ClientError>;

    fn set_uniform(&self, name: &str, value: Value) -> Result<Value, ClientError>;
}

/// Aborts the bridged task if the waiting thread unwinds
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sync-over-async bridge around `StudioClient`.
///
/// Must be called from threads that are not driving a Tokio runtime.
pub struct BlockingStudioClient<T: Transport + ?Sized> {
    client: StudioClient<T>,
    runtime: Handle,
}

impl<T: Transport + ?Sized + 'static> BlockingStudioClient<T> {
    pub fn new(client: StudioClient<T>, runtime: Handle) -> Self {
        Self { client, runtime }
    }

    pub fn client(&self) -> &StudioClient<T> {
        &self.client
    }

    /// Run one façade call on the runtime and wait for it.
    ///
    /// The request keeps the transport's timeout, so the wait is bounded. If the
    /// runtime drops the task before it reports back, the call fails with
    /// `TransportError::Closed`.
    fn bridge<R, F, Fut>(&self, method: &str, call: F) -> Result<R, ClientError>
    where
        F: FnOnce(StudioClient<T>) -> Fut,
        Fut: Future<Output = Result<R, ClientError>> + Send + 'static,
        R: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            warn!("Refusing blocking '{}' call from inside an async runtime", method);
            return Err(ClientError::BlockingInRuntime {
                method: method.to_string(),
            });
        }

        let (sender, receiver) = oneshot::channel();
        let request = call(self.client.clone());
        let _task = AbortOnDrop(self.runtime.spawn(async move {
            let _ = sender.send(request.await);
        }));

        receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(ClientError::Transport(TransportError::Closed)))
    }
}

impl<T: Transport + ?Sized + 'static> ControlPlane for BlockingStudioClient<T> {
    fn ping(&self) -> Result<(), ClientError> {
        self.bridge(methods::PING, |client| async move { client.ping().await })
    }

    fn set_document(&self, source: &str, path: Option<&str>) -> Result<Value, ClientError> {
        let source = source.to_string();
        let path = path.map(str::to_string);
        self.bridge(methods::SET_DOCUMENT, |client| async move {
            client.set_document(&source, path.as_deref()).await
        })
    }

    fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<Value, ClientError> {
        self.bridge(methods::RENDER_FRAME, move |client| async move {
            client.render_frame(time, width, height).await
        })
    }

    fn switch_view(&self, view: &str) -> Result<Value, ClientError> {
        let view = view.to_string();
        self.bridge(methods::SWITCH_VIEW, |client| async move {
            client.switch_view(&view).await
        })
    }

    fn set_uniform(&self, name: &str, value: Value) -> Result<Value, ClientError> {
        let name = name.to_string();
        self.bridge(methods::SET_UNIFORM, |client| async move {
            client.set_uniform(&name, value).await
        })
    }
}
