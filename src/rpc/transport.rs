//! Subprocess transport
//!
//! `ProcessTransport` launches the control-plane server, attaches an
//! `RpcConnection` to its stdio, publishes its connection state and runs the
//! health loop that relaunches a wedged server.

use crate::config::TransportConfig;
use crate::io::process::{ChildProcessManager, ProcessError, StderrHandler, StderrMonitor, StopMode};
use crate::log_timing;
use crate::rpc::connection::{ClosedHandler, RpcConnection};
use crate::rpc::error::TransportError;
use crate::rpc::health::{HealthMonitor, HealthProbe};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{Level, debug, info, warn};

/// Capacity of the transition event channel; slow subscribers see `Lagged`
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// How often, and how many times, to look for the exit status of a process
/// that closed its output on its own
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_ATTEMPTS: u32 = 20;

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unhealthy,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unhealthy => "unhealthy",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// One observed state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Authoritative state plus its two observation channels
struct StateCell {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl StateCell {
    fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            current: watch::Sender::new(ConnectionState::Disconnected),
            transitions,
        }
    }

    fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    fn set(&self, to: ConnectionState) {
        self.update(|_| Some(to));
    }

    /// Move to `to` only when currently in `expected`
    fn transition_if(&self, expected: ConnectionState, to: ConnectionState) -> bool {
        self.update(|from| (from == expected).then_some(to))
    }

    /// Apply `next` to the current state under the watch lock
    fn update(&self, next: impl FnOnce(ConnectionState) -> Option<ConnectionState>) -> bool {
        // Events are published under the watch lock so both channels agree on order
        self.current.send_if_modified(|state| {
            let from = *state;
            let Some(to) = next(from).filter(|to| *to != from) else {
                return false;
            };
            *state = to;
            info!("Connection state: {} -> {}", from, to);
            let _ = self.transitions.send(StateTransition { from, to });
            true
        })
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Request/response channel to a control-plane server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Launch and connect. A no-op when already running.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Tear everything down. Idempotent; always ends disconnected.
    async fn shutdown(&self);

    /// Send one request and wait for its result. `None` uses the configured
    /// default timeout.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError>;

    /// Whether requests are currently expected to succeed
    fn is_healthy(&self) -> bool;

    /// Current lifecycle state
    fn connection_state(&self) -> ConnectionState;
}

// ============================================================================
// Process Transport
// ============================================================================

/// What the lifecycle lock protects
#[derive(Default)]
struct Lifecycle {
    process: Option<ChildProcessManager>,
}

struct TransportInner {
    config: TransportConfig,
    connection: RpcConnection,
    state: StateCell,

    /// Serializes launch, teardown and relaunch
    lifecycle: Mutex<Lifecycle>,

    /// Serializes relaunches; holds the outcome of the most recent one
    reconnect: Mutex<Result<(), TransportError>>,
    reconnect_generation: AtomicU64,

    health: parking_lot::Mutex<Option<HealthMonitor>>,
    launch_count: AtomicU64,

    /// Set by `shutdown`, cleared by `initialize`; a shut-down transport is
    /// never relaunched
    shut_down: AtomicBool,
    stderr_handler: Option<StderrHandler>,

    /// Handed to the health loop and the end-of-stream callback
    self_ref: Weak<TransportInner>,
}

/// Transport over a child process's stdio.
///
/// Cheap to clone; clones share the same process and state.
#[derive(Clone)]
pub struct ProcessTransport {
    inner: Arc<TransportInner>,
}

impl ProcessTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// Like `new`, additionally forwarding each stderr line to `handler`.
    /// Lines are logged under the `studio_rpc::stderr` target either way.
    pub fn with_stderr_handler<F>(config: TransportConfig, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(handler)))
    }

    fn build(config: TransportConfig, stderr_handler: Option<StderrHandler>) -> Self {
        let connection = RpcConnection::new(config.frame_limits);
        let inner = Arc::new_cyclic(|self_ref| TransportInner {
            config,
            connection,
            state: StateCell::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            reconnect: Mutex::new(Ok(())),
            reconnect_generation: AtomicU64::new(0),
            health: parking_lot::Mutex::new(None),
            launch_count: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            stderr_handler,
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Tear down the current process and launch a fresh one.
    ///
    /// Concurrent callers collapse into a single relaunch and all observe its
    /// outcome. A successful relaunch restarts the health loop if it had
    /// stopped. Fails with `TransportError::Closed` once `shutdown` has run.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let result = self.inner.reconnect().await;
        if result.is_ok() {
            self.inner.ensure_health_monitor();
        }
        result
    }

    /// Number of successful process launches so far
    pub fn launch_count(&self) -> u64 {
        self.inner.launch_count.load(Ordering::SeqCst)
    }

    /// Watch the current state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.current.subscribe()
    }

    /// Receive every state transition from now on
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.state.transitions.subscribe()
    }

    /// Requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.connection.pending_count()
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle.lock().await;
            inner.shut_down.store(false, Ordering::SeqCst);
            if lifecycle.process.is_some() {
                debug!("ProcessTransport: already initialized");
            } else {
                inner.state.set(ConnectionState::Connecting);
                if let Err(e) = inner.launch_locked(&mut lifecycle).await {
                    inner.state.set(ConnectionState::Disconnected);
                    return Err(e);
                }
                inner.publish_launched();
            }
        }
        inner.ensure_health_monitor();
        Ok(())
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        // Before anything awaits, so a queued relaunch sees it
        inner.shut_down.store(true, Ordering::SeqCst);

        let monitor = inner.health.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let mut lifecycle = inner.lifecycle.lock().await;
        let failed = inner.teardown_locked(&mut lifecycle).await;
        if failed > 0 {
            info!("Shutdown closed {} pending request(s)", failed);
        }
        inner.state.set(ConnectionState::Disconnected);
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner.request(method, params, timeout).await
    }

    fn is_healthy(&self) -> bool {
        self.inner.state.get() == ConnectionState::Connected && self.inner.connection.is_attached()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

impl TransportInner {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let started = Instant::now();
        let result = self.connection.call(method, params, timeout).await;
        log_timing!(Level::DEBUG, method, started.elapsed());
        result
    }

    /// Spawn the process and attach the connection. Caller holds the
    /// lifecycle lock and owns the state transitions around this call.
    async fn launch_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), TransportError> {
        let command = self
            .config
            .parsed_command()
            .map_err(ProcessError::from)?;
        let mut process =
            ChildProcessManager::new(command, self.config.working_directory.clone());
        if let Some(handler) = &self.stderr_handler {
            let handler = Arc::clone(handler);
            process.on_stderr_line(move |line| handler(line));
        }

        let pipes = process.start()?;
        let launches = self.launch_count.fetch_add(1, Ordering::SeqCst) + 1;

        let weak = self.self_ref.clone();
        let on_closed: ClosedHandler = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .state
                    .transition_if(ConnectionState::Connected, ConnectionState::Unhealthy);
                tokio::spawn(async move { inner.reap_exited(launches).await });
            }
        });
        self.connection
            .attach(pipes.stdout, pipes.stdin, Some(on_closed))
            .await;

        info!(
            "Control-plane process launched (pid {:?}, launch #{})",
            process.pid(),
            launches
        );
        lifecycle.process = Some(process);
        Ok(())
    }

    /// Report a finished launch. A peer that already hung up lands in
    /// `Unhealthy`; the check runs under the state lock so it cannot race the
    /// end-of-stream callback.
    fn publish_launched(&self) {
        let connection = &self.connection;
        self.state.update(|_| {
            Some(if connection.is_attached() {
                ConnectionState::Connected
            } else {
                ConnectionState::Unhealthy
            })
        });
    }

    /// Close the connection, then stop the process. Returns how many pending
    /// requests were failed.
    async fn teardown_locked(&self, lifecycle: &mut Lifecycle) -> usize {
        let failed = self.connection.detach().await;
        if let Some(mut process) = lifecycle.process.take() {
            // Reaping first logs the exit status of a process that already died
            if process.is_running() {
                if let Err(e) = process
                    .stop(StopMode::Graceful, self.config.shutdown_grace)
                    .await
                {
                    warn!("Error stopping control-plane process: {}", e);
                }
            }
        }
        failed
    }

    /// Log the exit status of launch `launch` after it hung up on its own.
    /// Gives up when the process was relaunched or torn down meanwhile.
    async fn reap_exited(&self, launch: u64) {
        for _ in 0..REAP_ATTEMPTS {
            {
                let mut lifecycle = self.lifecycle.lock().await;
                if self.launch_count.load(Ordering::SeqCst) != launch {
                    return;
                }
                let Some(process) = lifecycle.process.as_mut() else {
                    return;
                };
                if !process.is_running() {
                    return;
                }
            }
            tokio::time::sleep(REAP_POLL_INTERVAL).await;
        }
        warn!("Control-plane process closed its output but is still running");
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let seen = self.reconnect_generation.load(Ordering::SeqCst);
        let mut last = self.reconnect.lock().await;
        if self.reconnect_generation.load(Ordering::SeqCst) != seen {
            debug!("ProcessTransport: joined a relaunch that finished while waiting");
            return last.clone();
        }

        let result = {
            let mut lifecycle = self.lifecycle.lock().await;
            if self.shut_down.load(Ordering::SeqCst) {
                debug!("ProcessTransport: not relaunching after shutdown");
                Err(TransportError::Closed)
            } else {
                self.state.set(ConnectionState::Reconnecting);
                self.teardown_locked(&mut lifecycle).await;
                let launched = self.launch_locked(&mut lifecycle).await;
                match &launched {
                    Ok(()) => self.publish_launched(),
                    Err(e) => {
                        warn!("Relaunch failed: {}", e);
                        self.state.set(ConnectionState::Disconnected);
                    }
                }
                launched
            }
        };

        *last = result.clone();
        self.reconnect_generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    fn ensure_health_monitor(&self) {
        if !self.config.health.enabled {
            return;
        }
        let mut slot = self.health.lock();
        // Checked under the slot lock; `shutdown` raises the flag before it
        // takes the monitor out
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if slot.as_ref().is_some_and(|monitor| !monitor.is_finished()) {
            return;
        }
        *slot = Some(HealthMonitor::spawn(
            self.self_ref.clone(),
            self.config.health.clone(),
        ));
    }
}

#[async_trait]
impl HealthProbe for TransportInner {
    async fn ping(&self, method: &str, timeout: Duration) -> Result<(), TransportError> {
        self.request(method, None, timeout).await.map(|_| ())
    }

    fn mark_unhealthy(&self, failures: u32) {
        debug!("Marking transport unhealthy after {} failures", failures);
        self.state.set(ConnectionState::Unhealthy);
    }

    async fn relaunch(&self) -> Result<(), TransportError> {
        self.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::io::command::CommandLineError;
    use crate::test_utils::scripts::{self, ScriptDir};

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    /// Test timeout to prevent hanging tests
    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn quiet_config(command: &str) -> TransportConfig {
        TransportConfig::new(command)
            .with_health(HealthConfig::disabled())
            .with_shutdown_grace(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_request_before_initialize_is_not_connected() {
        let transport = ProcessTransport::new(quiet_config("/bin/cat"));

        let result = transport.send_request("ping", None, None).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert!(!transport.is_healthy());

        // Shutdown on a transport that never started is a no-op
        transport.shutdown().await;
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let transport = ProcessTransport::new(quiet_config("/bin/cat"));
        let mut transitions = transport.subscribe_transitions();

        transport.initialize().await.unwrap();
        transport.initialize().await.unwrap();
        assert_eq!(transport.launch_count(), 1);
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
        assert!(transport.is_healthy());

        assert_eq!(
            transitions.recv().await.unwrap(),
            StateTransition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connecting
            }
        );
        assert_eq!(
            transitions.recv().await.unwrap(),
            StateTransition {
                from: ConnectionState::Connecting,
                to: ConnectionState::Connected
            }
        );

        transport.shutdown().await;
        transport.shutdown().await;
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unresponsive_peer_times_out_with_method_name() {
        let transport = ProcessTransport::new(quiet_config("/bin/sleep 10"));
        transport.initialize().await.unwrap();

        let started = Instant::now();
        let result = transport
            .send_request("render_frame", None, Some(Duration::from_secs(1)))
            .await;
        let elapsed = started.elapsed();

        match result {
            Err(e @ TransportError::Timeout { .. }) => {
                assert!(e.to_string().contains("render_frame"));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1500));
        assert_eq!(transport.pending_count(), 0);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_every_outstanding_request() {
        // cat echoes requests back; they have no result/error but carry a
        // method, so they are ignored and the requests stay pending
        let transport = ProcessTransport::new(quiet_config("/bin/cat"));
        transport.initialize().await.unwrap();

        let mut requests = Vec::new();
        for _ in 0..5 {
            let transport = transport.clone();
            requests.push(tokio::spawn(async move {
                transport
                    .send_request("render_frame", None, Some(Duration::from_secs(60)))
                    .await
            }));
        }

        tokio::time::timeout(TEST_TIMEOUT, async {
            while transport.pending_count() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Requests never became pending");

        transport.shutdown().await;

        for request in requests {
            let result = tokio::time::timeout(TEST_TIMEOUT, request)
                .await
                .expect("Request hung through shutdown")
                .unwrap();
            assert!(matches!(result, Err(TransportError::Closed)));
        }

        let result = transport.send_request("ping", None, None).await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_failure() {
        let transport =
            ProcessTransport::new(quiet_config("/no/such/studio-control-plane --stdio"));

        let result = transport.initialize().await;
        assert!(matches!(
            result,
            Err(TransportError::Launch(ProcessError::CommandLine(
                CommandLineError::ExecutableNotFound { .. }
            )))
        ));
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_through_quoted_script_path() {
        let scripts = ScriptDir::new().unwrap();
        let script = scripts
            .write_script("Shader Studio/control-plane.sh", scripts::RESPONDER)
            .unwrap();
        let command = format!("{} --stdio", scripts::quoted(&script));

        let transport = ProcessTransport::new(quiet_config(&command));
        transport.initialize().await.unwrap();

        for _ in 0..3 {
            let result = transport
                .send_request("ping", None, Some(TEST_TIMEOUT))
                .await
                .unwrap();
            assert_eq!(result, serde_json::json!("ok"));
        }

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_working_directory_and_stderr_handler() {
        let scripts = ScriptDir::new().unwrap();
        let script = scripts
            .write_script("pwd.sh", scripts::PWD_REPORTER)
            .unwrap();
        let workdir = tempfile::TempDir::new().unwrap();

        let lines = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&lines);
        let config = quiet_config(&scripts::quoted(&script))
            .with_working_directory(workdir.path());
        let transport =
            ProcessTransport::with_stderr_handler(config, move |line| sink.lock().push(line));

        transport.initialize().await.unwrap();
        // A round trip guarantees the script is past its `pwd`
        transport
            .send_request("ping", None, Some(TEST_TIMEOUT))
            .await
            .unwrap();

        tokio::time::timeout(TEST_TIMEOUT, async {
            while lines.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("No stderr line captured");

        let reported = std::path::PathBuf::from(lines.lock()[0].clone());
        assert_eq!(
            reported.canonicalize().unwrap(),
            workdir.path().canonicalize().unwrap()
        );

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_exit_marks_unhealthy_and_fails_fast() {
        let transport = ProcessTransport::new(quiet_config("/bin/sh -c \"exit 0\""));
        let mut state = transport.subscribe_state();

        transport.initialize().await.unwrap();

        tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| *s == ConnectionState::Unhealthy))
            .await
            .expect("Never became unhealthy")
            .unwrap();
        assert!(!transport.is_healthy());

        let result = transport
            .send_request("ping", None, Some(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(TransportError::Io(_))));

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_reconnect_relaunches() {
        let transport = ProcessTransport::new(quiet_config("/bin/cat"));
        transport.initialize().await.unwrap();

        let (a, b) = tokio::join!(transport.reconnect(), transport.reconnect());
        a.unwrap();
        b.unwrap();

        // Initial launch plus one collapsed relaunch
        assert_eq!(transport.launch_count(), 2);
        assert_eq!(transport.connection_state(), ConnectionState::Connected);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_not_undone_by_queued_reconnect() {
        let transport = ProcessTransport::new(quiet_config("/bin/cat"));
        transport.initialize().await.unwrap();

        let ((), reconnected) = tokio::join!(transport.shutdown(), transport.reconnect());
        assert!(matches!(reconnected, Err(TransportError::Closed)));
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.launch_count(), 1);

        // initialize makes it usable again
        transport.initialize().await.unwrap();
        transport.reconnect().await.unwrap();
        assert_eq!(transport.launch_count(), 3);
        assert_eq!(transport.connection_state(), ConnectionState::Connected);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_not_reading_input_cannot_block_requests_or_shutdown() {
        // sleep never reads stdin, so a large request fills the pipe
        let transport = ProcessTransport::new(quiet_config("/bin/sleep 30"));
        transport.initialize().await.unwrap();
        let document = serde_json::json!({"source": "x".repeat(256 * 1024)});

        let result = tokio::time::timeout(
            TEST_TIMEOUT,
            transport.send_request("set_document", Some(document.clone()), Some(Duration::from_millis(500))),
        )
        .await
        .expect("Request outlived its timeout");
        assert!(matches!(result, Err(TransportError::Timeout { .. })));

        let blocked = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send_request("set_document", Some(document), Some(Duration::from_secs(60)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(TEST_TIMEOUT, transport.shutdown())
            .await
            .expect("Shutdown hung on a blocked write");
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

        let result = tokio::time::timeout(TEST_TIMEOUT, blocked)
            .await
            .expect("Blocked request survived shutdown")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_crashed_process_is_reaped() {
        let transport = ProcessTransport::new(quiet_config("/bin/sh -c \"exit 3\""));
        let mut state = transport.subscribe_state();
        transport.initialize().await.unwrap();

        tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| *s == ConnectionState::Unhealthy))
            .await
            .expect("Never became unhealthy")
            .unwrap();

        // The exit status is collected without any teardown
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let running = {
                    let lifecycle = transport.inner.lifecycle.lock().await;
                    lifecycle
                        .process
                        .as_ref()
                        .is_some_and(|process| process.state().is_running())
                };
                if !running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Exited process was never reaped");

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_health_checks_trigger_relaunch() {
        // cat never answers, so every ping times out
        let config = TransportConfig::new("/bin/cat")
            .with_shutdown_grace(Duration::from_millis(500))
            .with_health(
                HealthConfig::default()
                    .with_interval(Duration::from_millis(50))
                    .with_timeout(Duration::from_millis(50))
                    .with_failure_threshold(3),
            );
        let transport = ProcessTransport::new(config);
        let mut transitions = transport.subscribe_transitions();

        transport.initialize().await.unwrap();

        let observed = tokio::time::timeout(TEST_TIMEOUT, async {
            let mut seen = Vec::new();
            loop {
                let transition = transitions.recv().await.unwrap();
                seen.push(transition);
                if transition.to == ConnectionState::Reconnecting {
                    return seen;
                }
            }
        })
        .await
        .expect("Health loop never reconnected");

        let tail: Vec<_> = observed.iter().rev().take(2).rev().copied().collect();
        assert_eq!(
            tail,
            vec![
                StateTransition {
                    from: ConnectionState::Connected,
                    to: ConnectionState::Unhealthy
                },
                StateTransition {
                    from: ConnectionState::Unhealthy,
                    to: ConnectionState::Reconnecting
                },
            ]
        );

        tokio::time::timeout(TEST_TIMEOUT, async {
            while transport.launch_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Process was never relaunched");

        transport.shutdown().await;
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }
}
