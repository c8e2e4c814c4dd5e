//! Application state shared by every download of a run

use crate::config::Config;
use crate::error::Result;
use crate::exchanges::ExchangeConnections;
use crate::services::cache::ResultCache;
use crate::services::monitor::PerformanceMonitor;
use crate::services::retry::{RetryCoordinator, RetryPolicy};
use crate::storage::DataStore;
use std::path::PathBuf;
use std::sync::Arc;

pub const CACHE_DIR: &str = "cache";
pub const METRICS_DIR: &str = "metrics";

/// Explicitly constructed context handed to the services
pub struct AppState {
    /// Immutable for the run
    pub config: Arc<Config>,

    /// One open gateway per configured exchange
    pub connections: Arc<ExchangeConnections>,

    /// Latest validated OHLCV per series
    pub cache: Arc<ResultCache>,

    /// Per-operation metrics ledger
    pub monitor: Arc<PerformanceMonitor>,

    /// CSV + SQLite sinks
    pub store: Arc<DataStore>,

    pub retry: Arc<RetryCoordinator>,

    /// Storage root
    pub data_dir: PathBuf,
}

impl AppState {
    /// Build the run context over already-open connections.
    ///
    /// Creates the storage layout, opens `data.db` and the metrics ledger, and
    /// reloads persisted cache entries.
    pub fn new(config: Config, connections: Arc<ExchangeConnections>) -> Result<Self> {
        let data_dir = config.storage.path.clone();
        std::fs::create_dir_all(&data_dir)?;

        tracing::info!("Data directory: {:?}", data_dir);

        let store = DataStore::open(&config.storage)?;

        let cache = if config.cache.persist {
            let cache = ResultCache::with_persistence(config.cache.max_age(), data_dir.join(CACHE_DIR));
            if let Err(e) = cache.load_persisted() {
                tracing::warn!("Could not reload persisted cache: {}", e);
            }
            cache
        } else {
            ResultCache::new(config.cache.max_age())
        };

        let monitor = PerformanceMonitor::with_ledger(&data_dir.join(METRICS_DIR))?;
        let retry = RetryCoordinator::new(RetryPolicy::from_config(&config));

        Ok(Self {
            config: Arc::new(config),
            connections,
            cache: Arc::new(cache),
            monitor: Arc::new(monitor),
            store: Arc::new(store),
            retry: Arc::new(retry),
            data_dir,
        })
    }
}
