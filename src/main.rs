// src/main.rs

//! The main entry point for the Helmsman agent.

use anyhow::Result;
use helmsman::config::{Config, DEFAULT_CONFIG_PATH};
use helmsman::server;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Helmsman version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|idx| args.get(idx + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::from_file(&config_path)?;

    // Keep the non-blocking writer guard alive for the process lifetime;
    // dropping it would silently stop file logging.
    let _log_guard = init_logging(&config);

    info!(version = VERSION, "starting helmsman");
    server::run(config).await
}

/// Console logging plus a daily-rotated file under the configured log
/// directory.
fn init_logging(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},hyper=warn,bollard=warn")));

    let file_appender =
        tracing_appender::rolling::daily(log_directory(config), "helmsman.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

fn log_directory(config: &Config) -> &Path {
    &config.system.log_directory
}
