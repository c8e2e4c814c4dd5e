//! OHLCV Harvester
//!
//! Downloads OHLCV and trade data from crypto exchanges with retry/backoff,
//! a freshness cache and integrity validation, then stores it as CSV and
//! SQLite tables ready for ML preprocessing.

pub mod config;
pub mod error;
pub mod exchanges;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod state;
pub mod storage;

use config::Config;
use error::Result;
use exchanges::{with_connections, ExchangeRegistry};
use pipeline::PipelineReport;
use state::AppState;

/// Run the configured download with the given exchange registry.
///
/// Exchange connections are closed before this returns, on success and on
/// error alike.
pub async fn run(config: Config, registry: &ExchangeRegistry) -> Result<PipelineReport> {
    tracing::info!("Starting OHLCV Harvester...");

    let connections_config = config.clone();
    with_connections(registry, &connections_config, |connections| async move {
        let state = AppState::new(config, connections)?;
        let report = pipeline::run(&state).await;

        let summary = state.monitor.summary();
        tracing::info!(
            "Operations: {} total, {} succeeded, {} failed ({:.1}% success), {} rows, mean {:.0} ms",
            summary.total,
            summary.succeeded,
            summary.failed,
            summary.success_rate,
            summary.total_rows,
            summary.mean_duration_ms
        );

        report
    })
    .await
}
