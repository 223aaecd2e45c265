use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use studio_rpc::config::{COMMAND_ENV_VAR, HealthConfig, TIMEOUT_ENV_VAR, TransportConfig};
use studio_rpc::logging::{LogConfig, init_logging};
use studio_rpc::{ProcessTransport, Transport};
use tracing::{error, info};

/// CLI arguments for the control-plane client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control-plane command line (overrides STUDIO_CONTROL_PLANE_COMMAND env var)
    #[arg(long, value_name = "CMD")]
    command: Option<String>,

    /// Request timeout in milliseconds (overrides STUDIO_CONTROL_PLANE_TIMEOUT_MS env var)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides STUDIO_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Method to call
    #[arg(default_value = "ping")]
    method: String,

    /// Request parameters as a JSON document
    #[arg(value_name = "PARAMS_JSON")]
    params: Option<String>,
}

/// Build the transport configuration from CLI args and environment
fn resolve_config(args: &Args) -> Result<TransportConfig, Box<dyn std::error::Error>> {
    // Priority: CLI arg > environment variable
    let config = TransportConfig::from_lookup(|name| match name {
        COMMAND_ENV_VAR => args
            .command
            .clone()
            .or_else(|| std::env::var(name).ok()),
        TIMEOUT_ENV_VAR => args
            .timeout_ms
            .map(|ms| ms.to_string())
            .or_else(|| std::env::var(name).ok()),
        _ => std::env::var(name).ok(),
    })?;

    // A single call does not need background pings
    Ok(config.with_health(HealthConfig::disabled()))
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>, serde_json::Error> {
    raw.map(serde_json::from_str).transpose()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let params = match parse_params(args.params.as_deref()) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("Invalid params JSON: {e}");
            std::process::exit(2);
        }
    };

    info!("Using control plane: {}", config.command_line);
    let transport = ProcessTransport::new(config);

    if let Err(e) = transport.initialize().await {
        error!("Failed to start control plane: {}", e);
        eprintln!("Failed to start control plane: {e}");
        std::process::exit(1);
    }

    let started = Instant::now();
    let result = transport.send_request(&args.method, params, None).await;
    info!("'{}' completed in {:?}", args.method, started.elapsed());

    transport.shutdown().await;

    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to format result: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Request '{}' failed: {e}", args.method);
            std::process::exit(1);
        }
    }
}
