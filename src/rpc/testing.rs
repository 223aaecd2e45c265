//! Test doubles for code built on `Transport`
//!
//! `FakeTransport` answers from canned results without a subprocess and
//! records every call. `FlakyTransport` wraps any transport and fails a
//! configurable fraction of requests.

use crate::rpc::error::TransportError;
use crate::rpc::protocol::JsonRpcErrorCode;
use crate::rpc::transport::{ConnectionState, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timeout applied when a caller passes `None`
const FAKE_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One call observed by a fake
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Position in the overall call order, starting at 0
    pub sequence: u64,
    pub method: String,
    pub params: Option<Value>,
}

// ============================================================================
// Fake Transport
// ============================================================================

#[derive(Debug)]
struct FakeState {
    connection_state: ConnectionState,
    shut_down: bool,
    /// Cancelled by `shutdown`; wakes calls sleeping out a delay
    closed: CancellationToken,
    responses: HashMap<String, Value>,
    errors: HashMap<String, TransportError>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    initialize_error: Option<TransportError>,
    initialize_count: u32,
    calls: Vec<RecordedCall>,
}

/// In-memory transport with canned results.
///
/// Starts out `Connected`, so callers can use it without `initialize`.
/// Methods with neither a canned result nor an injected error fail with a
/// remote "method not found" error.
#[derive(Debug)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                connection_state: ConnectionState::Connected,
                shut_down: false,
                closed: CancellationToken::new(),
                responses: HashMap::new(),
                errors: HashMap::new(),
                delays: HashMap::new(),
                default_delay: None,
                initialize_error: None,
                initialize_count: 0,
                calls: Vec::new(),
            }),
        }
    }

    /// Builder form of `set_response`
    pub fn with_response(self, method: &str, result: Value) -> Self {
        self.set_response(method, result);
        self
    }

    /// Answer `method` with `result`
    pub fn set_response(&self, method: &str, result: Value) {
        self.state.lock().responses.insert(method.to_string(), result);
    }

    /// Fail every call to `method` with `error`. Takes precedence over a
    /// canned result.
    pub fn set_error(&self, method: &str, error: TransportError) {
        self.state.lock().errors.insert(method.to_string(), error);
    }

    pub fn clear_error(&self, method: &str) {
        self.state.lock().errors.remove(method);
    }

    /// Delay calls to `method`. A delay longer than the call's timeout
    /// produces a timeout error once the timeout elapses. `shutdown` cuts the
    /// delay short with `TransportError::Closed`.
    pub fn set_delay(&self, method: &str, delay: Duration) {
        self.state.lock().delays.insert(method.to_string(), delay);
    }

    /// Delay for methods without their own delay
    pub fn set_default_delay(&self, delay: Duration) {
        self.state.lock().default_delay = Some(delay);
    }

    /// Make the next `initialize` calls fail
    pub fn set_initialize_error(&self, error: Option<TransportError>) {
        self.state.lock().initialize_error = error;
    }

    /// Force the reported state
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection_state = state;
    }

    pub fn initialize_count(&self) -> u32 {
        self.state.lock().initialize_count
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.state.lock().calls.last().cloned()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.initialize_count += 1;
        if let Some(error) = state.initialize_error.clone() {
            state.connection_state = ConnectionState::Disconnected;
            return Err(error);
        }
        if state.shut_down {
            state.shut_down = false;
            state.closed = CancellationToken::new();
        }
        state.connection_state = ConnectionState::Connected;
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.closed.cancel();
        state.connection_state = ConnectionState::Disconnected;
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let (delay, outcome, closed) = {
            let mut state = self.state.lock();
            let sequence = state.calls.len() as u64;
            state.calls.push(RecordedCall {
                sequence,
                method: method.to_string(),
                params,
            });

            if state.shut_down {
                return Err(TransportError::Closed);
            }

            let outcome = if let Some(error) = state.errors.get(method) {
                Err(error.clone())
            } else if let Some(result) = state.responses.get(method) {
                Ok(result.clone())
            } else {
                Err(TransportError::Remote {
                    code: JsonRpcErrorCode::MethodNotFound.code(),
                    message: format!("Method not found: {}", method),
                    data: None,
                })
            };
            let delay = state.delays.get(method).copied().or(state.default_delay);
            (delay, outcome, state.closed.clone())
        };

        if let Some(delay) = delay {
            let timeout = timeout.unwrap_or(FAKE_DEFAULT_TIMEOUT);
            tokio::select! {
                _ = closed.cancelled() => return Err(TransportError::Closed),
                _ = tokio::time::sleep(delay.min(timeout)) => {}
            }
            if delay > timeout {
                return Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        }

        outcome
    }

    fn is_healthy(&self) -> bool {
        self.state.lock().connection_state == ConnectionState::Connected
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }
}

// ============================================================================
// Flaky Transport
// ============================================================================

/// Wraps a transport and fails a random fraction of requests with an I/O error
pub struct FlakyTransport<T> {
    inner: T,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl<T: Transport> FlakyTransport<T> {
    /// `failure_rate` is clamped to `0.0..=1.0`
    pub fn new(inner: T, failure_rate: f64) -> Self {
        Self::with_rng(inner, failure_rate, StdRng::from_entropy())
    }

    /// Reproducible failure pattern
    pub fn with_seed(inner: T, failure_rate: f64, seed: u64) -> Self {
        Self::with_rng(inner, failure_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: T, failure_rate: f64, rng: StdRng) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self {
            inner,
            failure_rate,
            rng: Mutex::new(rng),
            injected: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of requests failed by this wrapper
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Transport> Transport for FlakyTransport<T> {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.inner.initialize().await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let fail = self.rng.lock().gen_bool(self.failure_rate);
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Io(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("injected failure for '{}'", method),
            ))));
        }
        self.inner.send_request(method, params, timeout).await
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_canned_response_and_history() {
        let transport = FakeTransport::new()
            .with_response("switch_view", json!({"active": "preview"}))
            .with_response("ping", json!("pong"));

        let result = transport
            .send_request("switch_view", Some(json!({"view": "preview"})), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"active": "preview"}));
        transport.send_request("ping", None, None).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].sequence, 0);
        assert_eq!(calls[0].method, "switch_view");
        assert_eq!(calls[0].params, Some(json!({"view": "preview"})));
        assert_eq!(transport.calls_to("ping").len(), 1);
        assert_eq!(transport.last_call().unwrap().sequence, 1);

        transport.clear_calls();
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_is_remote_error() {
        let transport = FakeTransport::new();
        match transport.send_request("no_such_method", None, None).await {
            Err(TransportError::Remote { code, .. }) => {
                assert_eq!(code, JsonRpcErrorCode::MethodNotFound.code());
            }
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_injected_error_overrides_response() {
        let transport = FakeTransport::new().with_response("render_frame", json!({}));
        transport.set_error(
            "render_frame",
            TransportError::Remote {
                code: -32000,
                message: "GPU lost".to_string(),
                data: None,
            },
        );

        let result = transport.send_request("render_frame", None, None).await;
        assert!(matches!(result, Err(TransportError::Remote { .. })));

        transport.clear_error("render_frame");
        assert!(transport.send_request("render_frame", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_delay_beyond_timeout_times_out() {
        let transport = FakeTransport::new().with_response("render_frame", json!({}));
        transport.set_delay("render_frame", Duration::from_secs(60));

        let started = Instant::now();
        let result = transport
            .send_request("render_frame", None, Some(Duration::from_millis(50)))
            .await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        match result {
            Err(TransportError::Timeout { method, timeout }) => {
                assert_eq!(method, "render_frame");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }

        // Delay within the timeout just slows the call down
        transport.set_delay("render_frame", Duration::from_millis(20));
        let started = Instant::now();
        assert!(
            transport
                .send_request("render_frame", None, Some(Duration::from_secs(5)))
                .await
                .is_ok()
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_delayed_call() {
        let transport = Arc::new(FakeTransport::new().with_response("render_frame", json!({})));
        transport.set_delay("render_frame", Duration::from_secs(60));

        let delayed = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .send_request("render_frame", None, Some(Duration::from_secs(120)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), delayed)
            .await
            .expect("Delayed call outlived shutdown")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));

        // A fresh start delays calls again instead of closing them
        transport.initialize().await.unwrap();
        transport.set_delay("render_frame", Duration::from_millis(10));
        assert!(transport.send_request("render_frame", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let transport = FakeTransport::new().with_response("ping", json!("pong"));
        assert!(transport.is_healthy());

        transport.shutdown().await;
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.send_request("ping", None, None).await,
            Err(TransportError::Closed)
        ));

        transport.initialize().await.unwrap();
        assert_eq!(transport.initialize_count(), 1);
        assert!(transport.send_request("ping", None, None).await.is_ok());

        transport.set_initialize_error(Some(TransportError::NotConnected));
        assert!(transport.initialize().await.is_err());
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_flaky_extremes() {
        let always = FlakyTransport::with_seed(
            FakeTransport::new().with_response("ping", json!("pong")),
            1.0,
            7,
        );
        for _ in 0..10 {
            assert!(matches!(
                always.send_request("ping", None, None).await,
                Err(TransportError::Io(_))
            ));
        }
        assert_eq!(always.injected_failures(), 10);
        // Injected failures never reach the wrapped transport
        assert_eq!(always.inner().call_count(), 0);

        let never = FlakyTransport::with_seed(
            FakeTransport::new().with_response("ping", json!("pong")),
            -3.0,
            7,
        );
        for _ in 0..10 {
            assert!(never.send_request("ping", None, None).await.is_ok());
        }
        assert_eq!(never.injected_failures(), 0);
    }

    #[tokio::test]
    async fn test_flaky_fraction() {
        let flaky = FlakyTransport::with_seed(
            FakeTransport::new().with_response("ping", json!("pong")),
            0.3,
            42,
        );

        let mut failures = 0;
        for _ in 0..1000 {
            if flaky.send_request("ping", None, None).await.is_err() {
                failures += 1;
            }
        }
        assert!((200..400).contains(&failures), "failures = {}", failures);
        assert_eq!(flaky.injected_failures(), failures as u64);
    }
}
