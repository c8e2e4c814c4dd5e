//! Download Orchestrator
//!
//! Drives one request through
//! `CheckCache -> (CacheHit | Fetching -> Validating -> (Persisting | Rejected)) -> Done`,
//! with `Fetching -> Failed` when the retry coordinator gives up. Nothing a
//! single request does can fail another: every error ends that request's
//! machine and is reported through the monitor and the log.

use crate::config::DataKind;
use crate::error::{DownloadError, ErrorResponse};
use crate::exchanges::types::{OhlcvRow, TradeRecord};
use crate::exchanges::ExchangeGateway;
use crate::services::cache::CacheKey;
use crate::services::monitor::{MetricUpdate, OperationId};
use crate::services::validator::{DataValidator, ValidationResult};
use crate::state::AppState;
use crate::storage::{DatasetName, Table};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-request knobs; `limit` falls back to the configured default
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadOptions {
    pub since: Option<i64>,
    pub limit: Option<usize>,
    pub use_cache: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            since: None,
            limit: None,
            use_cache: true,
        }
    }
}

/// Request lifecycle; each request moves forward only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    CheckCache,
    CacheHit,
    Fetching,
    Validating,
    Persisting,
    Rejected,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Cache,
    Exchange,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadDiagnostics {
    pub operation_id: OperationId,
    pub source: DataSource,
    /// Absent on a cache hit; cached data was validated when it was stored
    pub validation: Option<ValidationResult>,
    pub pages: usize,
    pub persisted: bool,
    pub storage_error: Option<String>,
    pub elapsed_ms: u64,
}

impl DownloadDiagnostics {
    /// Fetched data passed every check (cache hits always do)
    pub fn is_valid(&self) -> bool {
        self.validation.as_ref().map_or(true, |v| v.passed)
    }
}

/// A completed request: the data plus what happened to it
#[derive(Debug, Clone, Serialize)]
pub struct Download<T> {
    pub data: Vec<T>,
    pub diagnostics: DownloadDiagnostics,
}

/// Tracks one request's walk through [`DownloadState`]
struct Lifecycle {
    state: DownloadState,
    started: Instant,
}

impl Lifecycle {
    fn begin() -> Self {
        Self {
            state: DownloadState::CheckCache,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: DownloadState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Fetch outcome before validation
struct Fetched<T> {
    data: Vec<T>,
    pages: usize,
    /// Rows from later pages at or before the last kept timestamp
    overlap_dropped: usize,
}

/// Download orchestration service
pub struct DownloadService;

impl DownloadService {
    /// Download OHLCV for one symbol.
    ///
    /// Returns `None` when the request failed (unknown exchange, permanent
    /// error, retries exhausted). Data that fails validation is returned with
    /// `diagnostics.validation.passed == false` and is neither persisted nor
    /// cached.
    pub async fn download(
        state: &AppState,
        symbol: &str,
        exchange: &str,
        timeframe: &str,
        options: DownloadOptions,
    ) -> Option<Download<OhlcvRow>> {
        let span = info_span!("download", exchange, symbol, timeframe);
        Self::run_ohlcv(state, symbol, exchange, timeframe, options)
            .instrument(span)
            .await
    }

    async fn run_ohlcv(
        state: &AppState,
        symbol: &str,
        exchange: &str,
        timeframe: &str,
        options: DownloadOptions,
    ) -> Option<Download<OhlcvRow>> {
        let mut lifecycle = Lifecycle::begin();
        let op = state.monitor.start_operation(symbol, exchange);
        let key = CacheKey::new(exchange, symbol, timeframe);

        if options.use_cache {
            if let Some(rows) = state.cache.get(&key) {
                lifecycle.advance(DownloadState::CacheHit);
                info!("Cache hit: {} rows", rows.len());
                state.monitor.update_metrics(
                    op,
                    [
                        MetricUpdate::RowsDownloaded(rows.len()),
                        MetricUpdate::ValidationPassed(true),
                        MetricUpdate::Stat("cache_hit".to_string(), 1.0),
                    ],
                );
                state.monitor.complete_operation(op, true);
                lifecycle.advance(DownloadState::Done);

                return Some(Download {
                    data: rows,
                    diagnostics: DownloadDiagnostics {
                        operation_id: op,
                        source: DataSource::Cache,
                        validation: None,
                        pages: 0,
                        persisted: false,
                        storage_error: None,
                        elapsed_ms: lifecycle.elapsed_ms(),
                    },
                });
            }
        }

        lifecycle.advance(DownloadState::Fetching);
        let limit = options.limit.unwrap_or(state.config.limit).max(1);
        let fetched = Self::fetch(state, op, exchange, |gateway| async move {
            Self::fetch_ohlcv_pages(state, gateway.as_ref(), symbol, timeframe, options.since, limit).await
        })
        .await;
        let Fetched {
            data: rows,
            pages,
            overlap_dropped,
        } = match fetched {
            Some(fetched) => fetched,
            None => {
                lifecycle.advance(DownloadState::Failed);
                return None;
            }
        };

        lifecycle.advance(DownloadState::Validating);
        let validation = DataValidator::validate_ohlcv(&rows);
        Self::record_validation(state, op, rows.len(), pages, &validation);
        if overlap_dropped > 0 {
            state.monitor.update_metrics(
                op,
                [MetricUpdate::Stat("overlap_dropped".to_string(), overlap_dropped as f64)],
            );
        }

        if !validation.passed {
            lifecycle.advance(DownloadState::Rejected);
            state.monitor.complete_operation(op, false);
            lifecycle.advance(DownloadState::Done);
            return Some(Download {
                data: rows,
                diagnostics: DownloadDiagnostics {
                    operation_id: op,
                    source: DataSource::Exchange,
                    validation: Some(validation),
                    pages,
                    persisted: false,
                    storage_error: None,
                    elapsed_ms: lifecycle.elapsed_ms(),
                },
            });
        }

        lifecycle.advance(DownloadState::Persisting);
        let storage_error = Self::persist(
            state,
            op,
            &DatasetName::ohlcv(exchange, symbol, timeframe),
            &Table::from_ohlcv(&rows),
        );
        state.cache.put(key, rows.clone());

        state.monitor.complete_operation(op, true);
        lifecycle.advance(DownloadState::Done);
        info!("Downloaded {} rows in {} page(s)", rows.len(), pages);

        Some(Download {
            data: rows,
            diagnostics: DownloadDiagnostics {
                operation_id: op,
                source: DataSource::Exchange,
                validation: Some(validation),
                pages,
                persisted: storage_error.is_none(),
                storage_error,
                elapsed_ms: lifecycle.elapsed_ms(),
            },
        })
    }

    /// Download recent trades for one symbol. Trades are never cached.
    pub async fn download_trades(
        state: &AppState,
        symbol: &str,
        exchange: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Option<Download<TradeRecord>> {
        let span = info_span!("download", exchange, symbol, kind = DataKind::Trades.as_str());
        Self::run_trades(state, symbol, exchange, since, limit)
            .instrument(span)
            .await
    }

    async fn run_trades(
        state: &AppState,
        symbol: &str,
        exchange: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Option<Download<TradeRecord>> {
        let mut lifecycle = Lifecycle::begin();
        let op = state.monitor.start_operation(symbol, exchange);

        lifecycle.advance(DownloadState::Fetching);
        let limit = limit.unwrap_or(state.config.limit).max(1);
        let label = format!("{} {} trades", exchange, symbol);
        let fetched = Self::fetch(state, op, exchange, |gateway| {
            let label = &label;
            async move {
                let data = state
                    .retry
                    .execute(label, || gateway.fetch_trades(symbol, since, limit))
                    .await?;
                Ok::<_, DownloadError>(Fetched {
                    data,
                    pages: 1,
                    overlap_dropped: 0,
                })
            }
        })
        .await;
        let Fetched { data: trades, pages, .. } = match fetched {
            Some(fetched) => fetched,
            None => {
                lifecycle.advance(DownloadState::Failed);
                return None;
            }
        };

        lifecycle.advance(DownloadState::Validating);
        let validation = DataValidator::validate_trades(&trades);
        Self::record_validation(state, op, trades.len(), pages, &validation);

        let mut storage_error = None;
        if validation.passed {
            lifecycle.advance(DownloadState::Persisting);
            storage_error = Self::persist(
                state,
                op,
                &DatasetName::trades(exchange, symbol),
                &Table::from_trades(&trades),
            );
        } else {
            lifecycle.advance(DownloadState::Rejected);
        }

        state.monitor.complete_operation(op, validation.passed);
        lifecycle.advance(DownloadState::Done);

        Some(Download {
            data: trades,
            diagnostics: DownloadDiagnostics {
                operation_id: op,
                source: DataSource::Exchange,
                persisted: validation.passed && storage_error.is_none(),
                validation: Some(validation),
                pages,
                storage_error,
                elapsed_ms: lifecycle.elapsed_ms(),
            },
        })
    }

    /// Download OHLCV for many symbols in sequential groups of `batch_size`.
    ///
    /// Symbols within a group run concurrently; the next group starts after
    /// the whole group has finished and the configured pause has elapsed. The
    /// result only holds symbols whose download succeeded and validated.
    pub async fn download_many<S: AsRef<str>>(
        state: &AppState,
        symbols: &[S],
        exchange: &str,
        timeframe: &str,
        batch_size: usize,
    ) -> HashMap<String, Vec<OhlcvRow>> {
        let results = in_batches(symbols, batch_size, state.config.batch.pause(), |symbol| {
            Self::download(state, symbol, exchange, timeframe, DownloadOptions::default())
        })
        .await;

        Self::collect_valid(results)
    }

    /// Trades counterpart of [`DownloadService::download_many`]
    pub async fn download_many_trades<S: AsRef<str>>(
        state: &AppState,
        symbols: &[S],
        exchange: &str,
        batch_size: usize,
    ) -> HashMap<String, Vec<TradeRecord>> {
        let results = in_batches(symbols, batch_size, state.config.batch.pause(), |symbol| {
            Self::download_trades(state, symbol, exchange, None, None)
        })
        .await;

        Self::collect_valid(results)
    }

    fn collect_valid<T>(results: Vec<(String, Option<Download<T>>)>) -> HashMap<String, Vec<T>> {
        let total = results.len();
        let map: HashMap<String, Vec<T>> = results
            .into_iter()
            .filter_map(|(symbol, download)| match download {
                Some(d) if d.diagnostics.is_valid() => Some((symbol, d.data)),
                Some(_) => {
                    warn!("Skipping {}: data failed validation", symbol);
                    None
                }
                None => {
                    warn!("Skipping {}: download failed", symbol);
                    None
                }
            })
            .collect();

        info!("Batch download finished: {}/{} symbols", map.len(), total);
        map
    }

    /// Resolve the gateway and run `fetch`; failures are logged and recorded
    async fn fetch<T, F, Fut>(
        state: &AppState,
        op: OperationId,
        exchange: &str,
        fetch: F,
    ) -> Option<Fetched<T>>
    where
        F: FnOnce(std::sync::Arc<dyn ExchangeGateway>) -> Fut,
        Fut: Future<Output = Result<Fetched<T>, DownloadError>>,
    {
        let outcome = match state.connections.get(exchange) {
            Ok(gateway) => fetch(gateway).await,
            Err(e) => Err(DownloadError::Permanent(e)),
        };

        match outcome {
            Ok(fetched) => Some(fetched),
            Err(e) => {
                let response = ErrorResponse::from(&e);
                error!("Download failed [{}]: {}", response.code, response.message);
                state
                    .monitor
                    .update_metrics(op, [MetricUpdate::Error(e.to_string())]);
                state.monitor.complete_operation(op, false);
                None
            }
        }
    }

    /// Page through OHLCV until `limit` rows, a short page, or no progress
    async fn fetch_ohlcv_pages(
        state: &AppState,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Fetched<OhlcvRow>, DownloadError> {
        let page_size = gateway.max_page_size().max(1);
        let label = format!("{} {} {}", gateway.id(), symbol, timeframe);

        let mut rows: Vec<OhlcvRow> = Vec::new();
        let mut cursor = since;
        let mut pages = 0;
        let mut overlap_dropped = 0;

        while rows.len() < limit {
            let want = (limit - rows.len()).min(page_size);
            let page = state
                .retry
                .execute(&label, || gateway.fetch_ohlcv(symbol, timeframe, cursor, want))
                .await?;
            pages += 1;

            let received = page.len();
            let last_seen = rows.last().map(|r| r.timestamp);
            let before = rows.len();
            rows.extend(
                page.into_iter()
                    .filter(|r| last_seen.map_or(true, |last| r.timestamp > last)),
            );

            let dropped = received - (rows.len() - before);
            if dropped > 0 {
                warn!("Page {} repeated {} row(s) at or before {:?}, dropped", pages, dropped, last_seen);
                overlap_dropped += dropped;
            }

            if received < want || rows.len() == before {
                break;
            }
            cursor = rows.last().map(|r| r.timestamp + 1);
            debug!("Page {} done, {} rows so far, next since {:?}", pages, rows.len(), cursor);
        }

        rows.truncate(limit);
        Ok(Fetched {
            data: rows,
            pages,
            overlap_dropped,
        })
    }

    fn record_validation(
        state: &AppState,
        op: OperationId,
        rows: usize,
        pages: usize,
        validation: &ValidationResult,
    ) {
        let mut updates = vec![
            MetricUpdate::RowsDownloaded(rows),
            MetricUpdate::ValidationPassed(validation.passed),
            MetricUpdate::Stat("pages".to_string(), pages as f64),
            MetricUpdate::Stats(validation.stats.clone()),
        ];
        updates.extend(validation.errors.iter().cloned().map(MetricUpdate::Error));
        state.monitor.update_metrics(op, updates);

        if !validation.passed {
            warn!(
                "Validation failed, not persisting: {} (stats: {:?})",
                validation.errors.join("; "),
                validation.stats
            );
        }
    }

    /// Write to the store; a failure is logged and returned, never raised
    fn persist(state: &AppState, op: OperationId, name: &DatasetName<'_>, table: &Table) -> Option<String> {
        match state.store.save(name, table) {
            Ok(report) => {
                debug!("Persisted {:?}", report);
                None
            }
            Err(e) => {
                error!("Error saving {}: {}", name.render(), e);
                state
                    .monitor
                    .update_metrics(op, [MetricUpdate::Error(e.to_string())]);
                Some(e.to_string())
            }
        }
    }
}

/// Run `task` for every symbol, `batch_size` at a time, pausing between groups
async fn in_batches<'s, S, T, F, Fut>(
    symbols: &'s [S],
    batch_size: usize,
    pause: Duration,
    task: F,
) -> Vec<(String, Option<T>)>
where
    S: AsRef<str>,
    F: Fn(&'s str) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let batch_size = batch_size.max(1);
    let groups = symbols.chunks(batch_size).count();
    let mut results = Vec::with_capacity(symbols.len());

    for (index, group) in symbols.chunks(batch_size).enumerate() {
        info!(
            "Processing batch {}/{} ({} symbols)",
            index + 1,
            groups,
            group.len()
        );

        let outcomes = join_all(group.iter().map(|s| task(s.as_ref()))).await;
        results.extend(
            group
                .iter()
                .map(|s| s.as_ref().to_string())
                .zip(outcomes),
        );

        if index + 1 < groups && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::FetchError;
    use crate::exchanges::mock::{FetchEvent, MockGateway};
    use crate::exchanges::types::Side;
    use crate::exchanges::ExchangeConnections;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const DAY: i64 = 86_400_000;

    fn candle(ts: i64) -> OhlcvRow {
        OhlcvRow::new(ts, 40000.0, 41000.0, 39000.0, 40500.0, 100.0)
    }

    fn days(start: i64, count: i64) -> Vec<OhlcvRow> {
        (0..count).map(|i| candle(start + i * DAY)).collect()
    }

    fn setup(mock: MockGateway) -> (AppState, Arc<MockGateway>, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = dir.path().join("data");
        config.retry_delay = 0.0;
        config.max_retry_delay = 0.0;
        config.batch.pause_ms = 0;

        let mock = Arc::new(mock);
        let mut gateways: HashMap<String, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".to_string(), mock.clone());
        let connections = Arc::new(ExchangeConnections::from_gateways(gateways));

        let state = AppState::new(config, connections).unwrap();
        (state, mock, dir)
    }

    #[tokio::test]
    async fn test_end_to_end_download_persists_and_caches() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_ohlcv(
            "BTC/USDT",
            Ok(vec![OhlcvRow::from_array([1622505600000.0, 40000.0, 41000.0, 39000.0, 40500.0, 100.0])]),
        );

        let download = DownloadService::download(&state, "BTC/USDT", "binance", "1d", DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(download.data.len(), 1);
        assert_eq!(download.data[0].open, 40000.0);
        assert_eq!(download.diagnostics.source, DataSource::Exchange);
        assert!(download.diagnostics.persisted);

        let csv = std::fs::read_to_string(state.store.csv_path("binance_BTC_USDT_1d_ohlcv")).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert_eq!(
            state.store.sqlite().unwrap().count_rows("binance_BTC_USDT_1d_ohlcv").unwrap(),
            1
        );
        assert_eq!(
            state.cache.get(&CacheKey::new("binance", "BTC/USDT", "1d")),
            Some(download.data.clone())
        );

        let record = state.monitor.get(download.diagnostics.operation_id).unwrap();
        assert!(record.success);
        assert!(record.validation_passed);
        assert_eq!(record.rows_downloaded, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_exchange() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_ohlcv("BTC/USDT", Ok(days(1622505600000, 3)));

        DownloadService::download(&state, "BTC/USDT", "binance", "1d", DownloadOptions::default())
            .await
            .unwrap();
        // A different window for the same series is still served from cache
        let cached = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                since: Some(0),
                limit: Some(10),
                use_cache: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(cached.diagnostics.source, DataSource::Cache);
        assert_eq!(cached.data.len(), 3);
        assert_eq!(mock.call_count("ohlcv", "BTC/USDT"), 1);

        let bypass = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                use_cache: false,
                ..DownloadOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(bypass.diagnostics.source, DataSource::Exchange);
        assert_eq!(mock.call_count("ohlcv", "BTC/USDT"), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_none() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_ohlcv("BTC/USDT", Err(FetchError::transient("timeout")));

        let result = DownloadService::download(&state, "BTC/USDT", "binance", "1d", DownloadOptions::default()).await;

        assert!(result.is_none());
        assert_eq!(mock.call_count("ohlcv", "BTC/USDT"), 3);
        let summary = state.monitor.summary();
        assert_eq!(summary.failed, 1);
        let record = &state.monitor.completed()[0];
        assert!(record.errors[0].contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_unknown_exchange_returns_none() {
        let (state, _mock, _dir) = setup(MockGateway::new("binance"));
        let result = DownloadService::download(&state, "BTC/USDT", "kraken", "1d", DownloadOptions::default()).await;
        assert!(result.is_none());
        assert!(state.monitor.completed()[0].errors[0].contains("exchange not found"));
    }

    #[tokio::test]
    async fn test_invalid_data_is_returned_but_not_persisted() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        let mut rows = days(1622505600000, 2);
        rows[1].high = rows[1].low - 1.0;
        mock.always_ohlcv("BTC/USDT", Ok(rows));

        let download = DownloadService::download(&state, "BTC/USDT", "binance", "1d", DownloadOptions::default())
            .await
            .unwrap();

        let validation = download.diagnostics.validation.as_ref().unwrap();
        assert!(!validation.passed);
        assert_eq!(validation.stat("ohlc_violations"), Some(1.0));
        assert!(!download.diagnostics.persisted);
        assert!(!state.store.csv_path("binance_BTC_USDT_1d_ohlcv").exists());
        assert!(state.cache.get(&CacheKey::new("binance", "BTC/USDT", "1d")).is_none());
        // Validation failures are not retried
        assert_eq!(mock.call_count("ohlcv", "BTC/USDT"), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_still_returns_data() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_ohlcv("BTC/USDT", Ok(days(1622505600000, 2)));
        std::fs::create_dir_all(state.store.csv_path("binance_BTC_USDT_1d_ohlcv")).unwrap();

        let download = DownloadService::download(&state, "BTC/USDT", "binance", "1d", DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(download.data.len(), 2);
        assert!(!download.diagnostics.persisted);
        assert!(download.diagnostics.storage_error.is_some());
        assert!(state.cache.get(&CacheKey::new("binance", "BTC/USDT", "1d")).is_some());
    }

    #[tokio::test]
    async fn test_pagination_advances_since() {
        let (state, mock, _dir) = setup(MockGateway::new("binance").with_page_size(2));
        let start = 1622505600000;
        mock.push_ohlcv("BTC/USDT", Ok(days(start, 2)));
        mock.push_ohlcv("BTC/USDT", Ok(days(start + 2 * DAY, 2)));
        mock.push_ohlcv("BTC/USDT", Ok(days(start + 4 * DAY, 1)));

        let download = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                since: Some(start),
                limit: Some(5),
                use_cache: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(download.data.len(), 5);
        assert_eq!(download.diagnostics.pages, 3);
        let sinces: Vec<Option<i64>> = mock.calls().iter().map(|c| c.since).collect();
        assert_eq!(
            sinces,
            vec![Some(start), Some(start + DAY + 1), Some(start + 3 * DAY + 1)]
        );
        let limits: Vec<usize> = mock.calls().iter().map(|c| c.limit).collect();
        assert_eq!(limits, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_or_stale_page() {
        let (state, mock, _dir) = setup(MockGateway::new("binance").with_page_size(2));
        let start = 1622505600000;
        mock.push_ohlcv("BTC/USDT", Ok(days(start, 2)));
        // Exchange ignores since and repeats the same page
        mock.push_ohlcv("BTC/USDT", Ok(days(start, 2)));

        let download = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                since: Some(start),
                limit: Some(10),
                use_cache: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(download.data.len(), 2);
        assert_eq!(mock.call_count("ohlcv", "BTC/USDT"), 2);
        let record = state.monitor.get(download.diagnostics.operation_id).unwrap();
        assert_eq!(record.stats.get("overlap_dropped"), Some(&2.0));
    }

    #[tokio::test]
    async fn test_overlapping_page_rows_are_counted() {
        let (state, mock, _dir) = setup(MockGateway::new("binance").with_page_size(2));
        let start = 1622505600000;
        mock.push_ohlcv("BTC/USDT", Ok(days(start, 2)));
        // Second page starts one candle early
        mock.push_ohlcv("BTC/USDT", Ok(days(start + DAY, 2)));

        let download = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                since: Some(start),
                limit: Some(3),
                use_cache: false,
            },
        )
        .await
        .unwrap();

        let timestamps: Vec<i64> = download.data.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![start, start + DAY, start + 2 * DAY]);
        assert!(download.diagnostics.is_valid());

        let record = state.monitor.get(download.diagnostics.operation_id).unwrap();
        assert_eq!(record.stats.get("overlap_dropped"), Some(&1.0));
        assert_eq!(record.stats.get("pages"), Some(&2.0));
    }

    #[tokio::test]
    async fn test_contiguous_pages_record_no_overlap() {
        let (state, mock, _dir) = setup(MockGateway::new("binance").with_page_size(2));
        let start = 1622505600000;
        mock.push_ohlcv("BTC/USDT", Ok(days(start, 2)));
        mock.push_ohlcv("BTC/USDT", Ok(days(start + 2 * DAY, 1)));

        let download = DownloadService::download(
            &state,
            "BTC/USDT",
            "binance",
            "1d",
            DownloadOptions {
                since: Some(start),
                limit: Some(3),
                use_cache: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(download.data.len(), 3);
        let record = state.monitor.get(download.diagnostics.operation_id).unwrap();
        assert!(!record.stats.contains_key("overlap_dropped"));
    }

    #[tokio::test]
    async fn test_batch_isolation() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_ohlcv("A", Err(FetchError::permanent("invalid symbol")));
        mock.always_ohlcv("B", Ok(days(1622505600000, 2)));

        let results = DownloadService::download_many(&state, &["A", "B"], "binance", "1d", 5).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results["B"].len(), 2);
        assert!(!results.contains_key("A"));
        assert_eq!(mock.call_count("ohlcv", "A"), 1);
    }

    #[tokio::test]
    async fn test_groups_run_in_order_with_pause() {
        let (mut state, mock, _dir) = setup(MockGateway::new("binance").with_latency(Duration::from_millis(20)));
        Arc::get_mut(&mut state.config).unwrap().batch.pause_ms = 30;
        for symbol in ["A", "B", "C"] {
            mock.always_ohlcv(symbol, Ok(days(1622505600000, 1)));
        }

        let started = Instant::now();
        let results = DownloadService::download_many(&state, &["A", "B", "C"], "binance", "1d", 2).await;

        assert_eq!(results.len(), 3);
        // A and B fan out together, C runs alone
        assert_eq!(mock.peak_in_flight(), 2);

        let events = mock.events();
        assert_eq!(events.len(), 6);
        let position = |event: FetchEvent| events.iter().position(|e| *e == event).unwrap();
        let c_started = position(FetchEvent::Started("C".to_string()));
        assert!(position(FetchEvent::Started("A".to_string())) < position(FetchEvent::Finished("B".to_string())));
        assert!(position(FetchEvent::Started("B".to_string())) < position(FetchEvent::Finished("A".to_string())));
        assert!(position(FetchEvent::Finished("A".to_string())) < c_started);
        assert!(position(FetchEvent::Finished("B".to_string())) < c_started);

        // Two groups of ~20ms plus one 30ms pause
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_single_group_runs_concurrently() {
        let (state, mock, _dir) = setup(MockGateway::new("binance").with_latency(Duration::from_millis(20)));
        let symbols = ["A", "B", "C", "D"];
        for symbol in symbols {
            mock.always_ohlcv(symbol, Ok(days(1622505600000, 1)));
        }

        let results = DownloadService::download_many(&state, &symbols, "binance", "1d", 4).await;

        assert_eq!(results.len(), 4);
        assert_eq!(mock.peak_in_flight(), 4);
        let events = mock.events();
        let first_finish = events
            .iter()
            .position(|e| matches!(e, FetchEvent::Finished(_)))
            .unwrap();
        assert_eq!(first_finish, 4, "every fetch starts before any finishes");
    }

    #[tokio::test]
    async fn test_trades_download_not_cached() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_trades(
            "BTC/USDT",
            Ok(vec![
                TradeRecord::new("1", 1000, "BTC/USDT", Side::Buy, 40000.0, 0.5),
                TradeRecord::new("2", 1001, "BTC/USDT", Side::Sell, 40001.0, 0.25),
            ]),
        );

        let first = DownloadService::download_trades(&state, "BTC/USDT", "binance", None, None)
            .await
            .unwrap();
        assert_eq!(first.data.len(), 2);
        assert!(first.diagnostics.persisted);
        assert_eq!(
            state.store.sqlite().unwrap().count_rows("binance_BTC_USDT_trades").unwrap(),
            2
        );

        DownloadService::download_trades(&state, "BTC/USDT", "binance", None, None)
            .await
            .unwrap();
        assert_eq!(mock.call_count("trades", "BTC/USDT"), 2);
    }

    #[tokio::test]
    async fn test_trades_permanent_failure_single_attempt() {
        let (state, mock, _dir) = setup(MockGateway::new("binance"));
        mock.always_trades("BTC/USDT", Err(FetchError::permanent("bad symbol")));

        let results = DownloadService::download_many_trades(&state, &["BTC/USDT"], "binance", 5).await;
        assert!(results.is_empty());
        assert_eq!(mock.call_count("trades", "BTC/USDT"), 1);
    }
}
