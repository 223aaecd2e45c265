//! Configuration for the control-plane transport
//!
//! Provides `TransportConfig` with builder-style setters, environment
//! loading and validation.

use crate::io::command::{CommandLine, CommandLineError};
use crate::io::framing::FrameLimits;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Environment variable holding the control-plane command line
pub const COMMAND_ENV_VAR: &str = "STUDIO_CONTROL_PLANE_COMMAND";

/// Environment variable overriding the default request timeout (milliseconds)
pub const TIMEOUT_ENV_VAR: &str = "STUDIO_CONTROL_PLANE_TIMEOUT_MS";

/// Default timeout for individual requests (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Grace period between SIGTERM and SIGKILL during teardown (2 seconds)
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Interval between health pings (5 seconds)
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 5_000;

/// Timeout for a single health ping (2 seconds)
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 2_000;

/// Consecutive ping failures that trigger a relaunch
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// Method used for health pings
pub const DEFAULT_PING_METHOD: &str = "ping";

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing control-plane command; set {COMMAND_ENV_VAR}")]
    MissingCommand,

    #[error("Invalid value for {name}: {value:?} (expected a positive integer)")]
    InvalidNumber { name: String, value: String },

    #[error("Invalid command line: {0}")]
    CommandLine(#[from] CommandLineError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Health-check loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Run the periodic health loop at all
    pub enabled: bool,

    /// Time between pings
    pub interval: Duration,

    /// Timeout applied to each ping
    pub timeout: Duration,

    /// Consecutive failures before the process is relaunched
    pub failure_threshold: u32,

    /// Lightweight method used as the ping
    pub ping_method: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
            failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            ping_method: DEFAULT_PING_METHOD.to_string(),
        }
    }
}

impl HealthConfig {
    /// Health checks switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_ping_method(mut self, method: impl Into<String>) -> Self {
        self.ping_method = method.into();
        self
    }
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Complete transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Command line for the control-plane server (quoted segments honored)
    pub command_line: String,

    /// Working directory for the subprocess
    pub working_directory: Option<PathBuf>,

    /// Default per-request timeout
    pub request_timeout: Duration,

    /// Time allowed between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,

    /// Health-check loop settings
    pub health: HealthConfig,

    /// Inbound framing ceilings
    pub frame_limits: FrameLimits,
}

impl TransportConfig {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            working_directory: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            health: HealthConfig::default(),
            frame_limits: FrameLimits::default(),
        }
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command_line = lookup(COMMAND_ENV_VAR)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingCommand)?;

        let mut config = Self::new(command_line);
        if let Some(raw) = lookup(TIMEOUT_ENV_VAR) {
            let millis = parse_positive_millis(TIMEOUT_ENV_VAR, &raw)?;
            config.request_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_frame_limits(mut self, limits: FrameLimits) -> Self {
        self.frame_limits = limits;
        self
    }

    /// Parsed form of `command_line`
    pub fn parsed_command(&self) -> Result<CommandLine, CommandLineError> {
        CommandLine::parse(&self.command_line)
    }

    /// Check internal consistency. Does not touch the filesystem; executable
    /// resolution happens at launch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_command()?;

        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if self.health.enabled {
            if self.health.interval.is_zero() || self.health.timeout.is_zero() {
                return Err(ConfigError::Invalid(
                    "health interval and timeout must be greater than zero".to_string(),
                ));
            }
            if self.health.failure_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "health failure threshold must be at least 1".to_string(),
                ));
            }
        }
        if self.frame_limits.max_message_size == 0
            || self.frame_limits.max_message_size > self.frame_limits.max_buffer_size
        {
            return Err(ConfigError::Invalid(format!(
                "message ceiling {} must be non-zero and not exceed buffer ceiling {}",
                self.frame_limits.max_message_size, self.frame_limits.max_buffer_size
            )));
        }

        Ok(())
    }
}

fn parse_positive_millis(name: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::new("/usr/local/bin/studio-server --stdio");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert!(config.health.enabled);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.ping_method, "ping");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_command_and_timeout() {
        let config = TransportConfig::from_lookup(lookup(&[
            (COMMAND_ENV_VAR, r#""/Applications/Shader Studio/server" --stdio"#),
            (TIMEOUT_ENV_VAR, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        let command = config.parsed_command().unwrap();
        assert_eq!(command.program, "/Applications/Shader Studio/server");
        assert_eq!(command.args, vec!["--stdio"]);
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(matches!(
            TransportConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingCommand)
        ));
        assert!(matches!(
            TransportConfig::from_lookup(lookup(&[(COMMAND_ENV_VAR, "  ")])),
            Err(ConfigError::MissingCommand)
        ));
        assert!(matches!(
            TransportConfig::from_lookup(lookup(&[
                (COMMAND_ENV_VAR, "server"),
                (TIMEOUT_ENV_VAR, "soon"),
            ])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            TransportConfig::from_lookup(lookup(&[
                (COMMAND_ENV_VAR, "server"),
                (TIMEOUT_ENV_VAR, "0"),
            ])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            TransportConfig::from_lookup(lookup(&[(COMMAND_ENV_VAR, r#""unterminated"#)])),
            Err(ConfigError::CommandLine(CommandLineError::UnterminatedQuote(_)))
        ));
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let config = TransportConfig::new("server").with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = TransportConfig::new("server")
            .with_health(HealthConfig::default().with_failure_threshold(0));
        assert!(config.validate().is_err());

        // Disabled health checks are not validated
        let config = TransportConfig::new("server")
            .with_health(HealthConfig::disabled().with_failure_threshold(0));
        assert!(config.validate().is_ok());

        let config = TransportConfig::new("server").with_frame_limits(FrameLimits {
            max_buffer_size: 10,
            max_message_size: 20,
        });
        assert!(config.validate().is_err());
    }
}
