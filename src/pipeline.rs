//! The configured run: every default symbol, every requested data kind

use crate::config::DataKind;
use crate::error::{AppError, Result};
use crate::exchanges::types::OhlcvRow;
use crate::services::download_service::DownloadService;
use crate::services::enrichment::{technical_indicators, Normalizer};
use crate::state::AppState;
use crate::storage::{DatasetName, Table};
use serde::Serialize;
use tracing::{error, info};

pub const NORMALIZED_SUFFIX: &str = "normalized";
pub const INDICATORS_SUFFIX: &str = "indicators";

/// What a run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Symbols with validated OHLCV, sorted
    pub ohlcv: Vec<String>,
    /// Symbols with validated trades, sorted
    pub trades: Vec<String>,
    /// Derived datasets written (normalized + indicators)
    pub derived_datasets: usize,
}

/// Download everything the configuration asks for.
///
/// Fails before any download when the active exchange has no open gateway;
/// per-symbol failures are logged and leave the symbol out of the report.
pub async fn run(state: &AppState) -> Result<PipelineReport> {
    let config = &state.config;
    let exchange = config.active_exchange.as_str();

    state.connections.get(exchange).map_err(AppError::Exchange)?;

    info!(
        "Downloading {:?} for {} symbols from {} ({})",
        config.data_types,
        config.default_symbols.len(),
        exchange,
        config.timeframe
    );

    let mut report = PipelineReport::default();

    for kind in &config.data_types {
        match kind {
            DataKind::Ohlcv => {
                let results = DownloadService::download_many(
                    state,
                    &config.default_symbols,
                    exchange,
                    &config.timeframe,
                    config.batch.size,
                )
                .await;

                let mut symbols: Vec<&String> = results.keys().collect();
                symbols.sort();
                for symbol in symbols {
                    report.derived_datasets += enrich(state, exchange, symbol, &results[symbol]);
                    report.ohlcv.push(symbol.clone());
                }
            }
            DataKind::Trades => {
                let results = DownloadService::download_many_trades(
                    state,
                    &config.default_symbols,
                    exchange,
                    config.batch.size,
                )
                .await;

                let mut symbols: Vec<String> = results.into_keys().collect();
                symbols.sort();
                report.trades = symbols;
            }
        }
    }

    info!(
        "Run finished: {} ohlcv, {} trades, {} derived datasets",
        report.ohlcv.len(),
        report.trades.len(),
        report.derived_datasets
    );
    Ok(report)
}

/// Write the normalized and indicator datasets for one symbol; returns how many were saved
fn enrich(state: &AppState, exchange: &str, symbol: &str, rows: &[OhlcvRow]) -> usize {
    let config = &state.config;
    let base = DatasetName::ohlcv(exchange, symbol, &config.timeframe);
    let mut saved = 0;

    if config.normalization.enabled {
        let mut normalizer = Normalizer::new(config.normalization.clone());
        let outcome = normalizer
            .fit_transform(rows)
            .and_then(|scaled| state.store.save(&base.with_suffix(NORMALIZED_SUFFIX), &Table::from_ohlcv(&scaled)));
        match outcome {
            Ok(_) => {
                info!("Normalized data saved for {} on {}", symbol, exchange);
                saved += 1;
            }
            Err(e) => error!("Normalization failed for {}: {}", symbol, e),
        }
    }

    if config.indicators.enabled {
        let table = technical_indicators(rows).to_table();
        match state.store.save(&base.with_suffix(INDICATORS_SUFFIX), &table) {
            Ok(_) => saved += 1,
            Err(e) => error!("Saving indicators failed for {}: {}", symbol, e),
        }
    }

    saved
}
