//! Logging setup: console output plus an optional plain-text log file.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file used by `deploy` when none is given.
pub const DEFAULT_DEPLOY_LOG: &str = "fxlaunch-deploy.log";

/// Parse a `--log-level` value, defaulting to info.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn setup_logging(level: Level, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let file = match log_file {
        Some(path) => Some(file_layer(path)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(())
}

/// Formatting layer that writes to a shared file.
pub type FileLayer<S> = fmt::Layer<S, DefaultFields, Format, Mutex<File>>;

/// A layer appending every event to `path`, without colour codes.
pub fn file_layer<S>(path: &Path) -> Result<FileLayer<S>> {
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    Ok(fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file)))
}
