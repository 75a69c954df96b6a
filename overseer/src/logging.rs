//! Tracing setup for the overseer CLI.
//!
//! Diagnostics go to stderr in compact form. When a log directory is given,
//! the same events are also written to `overseer_<ts>.log` without colors.
//! Product artifacts (transcripts, ledgers, summaries) are written by their
//! own stores and are unaffected by the log level.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` applies. Returns the log file
/// path when a file layer was installed.
///
/// # Example
/// ```bash
/// RUST_LOG=overseer=debug overseer mission.yaml
/// ```
pub fn init(level: &str, log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("install tracing subscriber")?;
        return Ok(None);
    };

    fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    let path = dir.join(format!("overseer_{}.log", Local::now().format("%Y%m%d_%H%M%S")));
    let file = File::create(&path).with_context(|| format!("create log file {}", path.display()))?;
    let file_layer = fmt::layer().with_writer(Arc::new(file)).with_ansi(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(Some(path))
}
