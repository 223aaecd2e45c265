use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming the log file
pub const LOG_FILE_ENV_VAR: &str = "STUDIO_LOG_FILE";

/// When "true", the process id is spliced into the log file name
pub const LOG_UNIQUE_ENV_VAR: &str = "STUDIO_LOG_UNIQUE";

/// When "true", logs are emitted as JSON
pub const LOG_JSON_ENV_VAR: &str = "STUDIO_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create LogConfig from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let file_path = lookup(LOG_FILE_ENV_VAR).map(|path| {
            let path_buf = PathBuf::from(path);
            if lookup(LOG_UNIQUE_ENV_VAR).unwrap_or_default() == "true" {
                with_pid_suffix(path_buf, std::process::id())
            } else {
                path_buf
            }
        });

        let json_format = lookup(LOG_JSON_ENV_VAR).unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `server.log` becomes `server.<pid>.log`
fn with_pid_suffix(mut path: PathBuf, pid: u32) -> PathBuf {
    if let Some(filename) = path.file_stem() {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        let unique_filename = if extension.is_empty() {
            format!("{}.{}", filename.to_string_lossy(), pid)
        } else {
            format!("{}.{}.{}", filename.to_string_lossy(), pid, extension)
        };

        path.set_file_name(unique_filename);
    }
    path
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Create environment filter from log level
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    // Build the subscriber based on configuration
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        // File + JSON format
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).init();
        }
        // File + human readable format
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).init();
        }
        // Stderr only + JSON format
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).init();
        }
        // Stderr only + human readable format (default)
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log one JSON-RPC request or response on a single structured line
#[macro_export]
macro_rules! log_rpc_message {
    ($level:expr, $direction:expr, $method:expr, $id:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            id = $id,
            pid = std::process::id(),
            "RPC message"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
