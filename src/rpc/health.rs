//! Periodic health checking
//!
//! `HealthTracker` counts consecutive ping failures against a threshold.
//! `HealthMonitor` owns the background task that pings on a fixed interval
//! and asks its target to relaunch once the threshold is reached.

use crate::config::HealthConfig;
use crate::rpc::error::TransportError;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of recording one ping outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Last ping succeeded
    Healthy,
    /// Failing, still below the threshold
    Degraded { failures: u32 },
    /// Threshold reached
    Unhealthy { failures: u32 },
}

/// Consecutive-failure counter
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) -> HealthVerdict {
        self.consecutive_failures = 0;
        HealthVerdict::Healthy
    }

    pub fn record_failure(&mut self) -> HealthVerdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            HealthVerdict::Unhealthy {
                failures: self.consecutive_failures,
            }
        } else {
            HealthVerdict::Degraded {
                failures: self.consecutive_failures,
            }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// What the health loop drives
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Issue one ping with the given timeout
    async fn ping(&self, method: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Called once when the failure threshold is reached, before relaunching
    fn mark_unhealthy(&self, failures: u32);

    /// Tear down and relaunch the peer
    async fn relaunch(&self) -> Result<(), TransportError>;
}

/// Handle to a running health loop
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start pinging `target` every `config.interval`. The loop holds only a
    /// weak reference and exits once the target is gone.
    pub fn spawn<P: HealthProbe>(target: Weak<P>, config: HealthConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_health_loop(target, config, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Health loop ended abnormally: {}", e);
            }
        }
    }

    /// Whether the loop has exited on its own (target gone or relaunch failed)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run_health_loop<P: HealthProbe>(
    target: Weak<P>,
    config: HealthConfig,
    cancel: CancellationToken,
) {
    let mut tracker = HealthTracker::new(config.failure_threshold);
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    debug!(
        "Health loop started (interval {:?}, timeout {:?}, threshold {})",
        config.interval, config.timeout, config.failure_threshold
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(probe) = target.upgrade() else {
            debug!("Health loop target dropped");
            break;
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = probe.ping(&config.ping_method, config.timeout) => result,
        };

        let failures = match result {
            Ok(()) => {
                if tracker.consecutive_failures() > 0 {
                    info!("Health check recovered");
                }
                tracker.record_success();
                continue;
            }
            Err(e) => match tracker.record_failure() {
                HealthVerdict::Unhealthy { failures } => {
                    warn!("Health check failed ({} consecutive): {}", failures, e);
                    failures
                }
                HealthVerdict::Degraded { failures } => {
                    debug!("Health check failed ({} consecutive): {}", failures, e);
                    continue;
                }
                HealthVerdict::Healthy => continue,
            },
        };

        probe.mark_unhealthy(failures);
        tracker.reset();

        let relaunched = tokio::select! {
            _ = cancel.cancelled() => break,
            result = probe.relaunch() => result,
        };
        match relaunched {
            Ok(()) => info!("Control-plane process relaunched after {} failed health checks", failures),
            Err(e) => {
                error!("Relaunch failed, health checks stopped: {}", e);
                break;
            }
        }
    }

    debug!("Health loop stopped");
}
