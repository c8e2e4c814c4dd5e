//! Tracing subscriber setup

use crate::config::Config;
use crate::error::{AppError, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for the configured level; RUST_LOG wins when set.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.to_ascii_lowercase();
        EnvFilter::new(format!("ohlcv_harvester={},warn", level))
    })
}

/// Install the global subscriber: stdout, plus an append-only log file when configured.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &Config) -> Result<()> {
    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    AppError::Config(format!("Cannot open log file {}: {}", path.display(), e))
                })?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(&config.log_level))
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .ok();

    Ok(())
}
