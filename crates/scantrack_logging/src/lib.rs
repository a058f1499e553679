//! Shared logging setup for Scantrack binaries.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "scantrack=info,scantrack_db=info";

/// Console verbosity, mapped from the CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Errors only (`--quiet`)
    Quiet,
    /// Warnings and errors (default)
    Normal,
    /// Informational (`--verbose`)
    Verbose,
    /// Everything (`--debug`)
    Debug,
}

impl Verbosity {
    fn filter(&self) -> EnvFilter {
        match self {
            Verbosity::Quiet => EnvFilter::new("error"),
            Verbosity::Normal => EnvFilter::new("warn"),
            Verbosity::Verbose => EnvFilter::new(DEFAULT_LOG_FILTER),
            Verbosity::Debug => EnvFilter::new("debug"),
        }
    }
}

/// Logging configuration shared by Scantrack binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbosity: Verbosity,
}

/// Initialize tracing with a stderr layer and a per-app log file under the
/// Scantrack home directory. `RUST_LOG` overrides the file filter.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let log_path = log_dir.join(format!("{}.log", config.app_name));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(config.verbosity.filter()),
        )
        .init();

    Ok(())
}

/// Get the Scantrack home directory: ~/.scantrack
pub fn scantrack_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SCANTRACK_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scantrack")
}

/// Get the logs directory: ~/.scantrack/logs
pub fn logs_dir() -> PathBuf {
    scantrack_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
