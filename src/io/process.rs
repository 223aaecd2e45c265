//! Process management layer
//!
//! Owns the control-plane child process and its three standard streams.
//! Handles launch validation, stderr draining and graceful-then-forceful
//! termination, completely separate from message framing and correlation.

use crate::io::command::{CommandLine, CommandLineError};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Log target for lines forwarded from the child's stderr
pub const STDERR_TARGET: &str = "studio_rpc::stderr";

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, wait for the grace period, then SIGKILL if still alive
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or been stopped
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for process management
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid command line: {0}")]
    CommandLine(#[from] CommandLineError),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Process exited immediately after launch")]
    ExitedEarly,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

impl From<io::Error> for ProcessError {
    fn from(err: io::Error) -> Self {
        ProcessError::Io(Arc::new(err))
    }
}

// ============================================================================
// Stderr Monitoring
// ============================================================================

/// Handler invoked with each non-empty stderr line
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines.
    ///
    /// Only one handler can be active at a time; installing a new handler
    /// replaces the previous one. Lines are always drained and logged, with
    /// or without a handler.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// The stdio pipes handed to the message layer after a successful start
#[derive(Debug)]
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Manages the control-plane child process.
///
/// The manager is the sole owner of the child; dropping it kills the process.
pub struct ChildProcessManager {
    /// Parsed command line
    command: CommandLine,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// The spawned child process (if running)
    child: Option<Child>,

    /// Current process state
    state: ProcessState,

    /// Stderr handler
    stderr_handler: Option<StderrHandler>,

    /// Stderr drain task handle
    stderr_task: Option<JoinHandle<()>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    pub fn new(command: CommandLine, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            working_directory: working_dir,
            child: None,
            state: ProcessState::NotStarted,
            stderr_handler: None,
            stderr_task: None,
        }
    }

    /// Current process state
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Process ID while running
    pub fn pid(&self) -> Option<u32> {
        self.state.pid()
    }

    /// Resolve the executable, spawn it with piped stdio and start draining
    /// stderr. Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<ProcessPipes, ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyStarted);
        }

        let executable = self.command.resolve_program()?;
        info!(
            "Starting process: {} {:?}",
            executable.display(),
            self.command.args
        );

        let mut command_builder = Command::new(&executable);
        command_builder
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.command.program.clone(),
                source: Arc::new(source),
            })?;

        let pid = match child.id() {
            Some(pid) => pid,
            None => return Err(ProcessError::ExitedEarly),
        };
        info!("Process started with PID: {}", pid);

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        // Always drain stderr so the child never blocks on a full pipe
        self.stderr_task = Some(spawn_stderr_drain(
            stderr,
            pid,
            self.stderr_handler.clone(),
        ));
        self.child = Some(child);
        self.state = ProcessState::Running { pid };

        Ok(ProcessPipes { stdin, stdout })
    }

    /// Check whether the child is still alive, reaping it if it has exited
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("Process PID {:?} exited with status: {}", self.state.pid(), status);
                self.child = None;
                self.state = ProcessState::Stopped;
                false
            }
            Err(e) => {
                error!("Error polling child process: {}", e);
                false
            }
        }
    }

    /// Stop the process.
    ///
    /// `Graceful` sends SIGTERM and waits up to `grace` before escalating to
    /// SIGKILL. Stopping a process that is not running is a no-op.
    pub async fn stop(&mut self, mode: StopMode, grace: Duration) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.take() else {
            self.state = ProcessState::Stopped;
            return Ok(());
        };
        let pid = self.state.pid();

        let result = match mode {
            StopMode::Graceful => {
                info!("Gracefully stopping process with PID: {:?}", pid);
                terminate(&mut child);

                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!("Process exited with status: {}", status);
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        error!("Error waiting for process: {}", e);
                        Err(ProcessError::from(e))
                    }
                    Err(_) => {
                        warn!(
                            "Process {:?} did not exit within {:?}, killing",
                            pid, grace
                        );
                        force_kill(&mut child).await
                    }
                }
            }
            StopMode::Force => {
                info!("Force killing process with PID: {:?}", pid);
                force_kill(&mut child).await
            }
        };

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.state = ProcessState::Stopped;

        result
    }

    /// Synchronous force kill for Drop
    pub fn kill_sync(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("Synchronously killing process with PID: {:?}", self.state.pid());
            if let Err(e) = child.start_kill() {
                trace!("start_kill failed (process probably gone): {}", e);
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.state = ProcessState::Stopped;
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

impl std::fmt::Debug for ChildProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessManager")
            .field("command", &self.command)
            .field("working_directory", &self.working_directory)
            .field("state", &self.state)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

/// Spawn the task that drains stderr line by line into the log
fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    pid: u32,
    handler: Option<StderrHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        trace!("ChildProcessManager: Starting stderr drain for PID {}", pid);

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    trace!("ChildProcessManager: stderr EOF reached");
                    break;
                }
                Ok(_) => {
                    let content = line.trim_end();
                    if content.is_empty() {
                        continue;
                    }
                    info!(target: STDERR_TARGET, pid, "{}", content);
                    if let Some(handler) = &handler {
                        handler(content.to_string());
                    }
                }
                Err(e) => {
                    error!("Failed to read from stderr: {}", e);
                    break;
                }
            }
        }

        trace!("ChildProcessManager: stderr drain finished");
    })
}

/// Send the polite termination signal
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a pid we spawned and still own
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                debug!("Sent SIGTERM to process {}", pid);
            } else {
                debug!("SIGTERM to process {} failed", pid);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!("Failed to terminate process: {}", e);
        }
    }
}

async fn force_kill(child: &mut Child) -> Result<(), ProcessError> {
    child.kill().await?;
    info!("Process killed");
    Ok(())
}
