//! Run configuration loaded from a TOML file.
//!
//! Loaded once at startup and never mutated afterwards. Every field has a
//! default, so an empty file (or `Config::default()`) is a valid configuration.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

/// Requested data kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Ohlcv,
    Trades,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Ohlcv => "ohlcv",
            DataKind::Trades => "trades",
        }
    }
}

/// Per-exchange connection settings.
///
/// Only public market-data endpoints are used, so an API key is the only
/// credential forwarded; a `secret` key in the file is accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: Option<String>,
    pub enable_rate_limit: bool,
    /// Override of the exchange's public REST endpoint
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            enable_rate_limit: true,
            base_url: None,
            timeout_secs: 30,
        }
    }
}

impl ExchangeConfig {
    /// API key, unless missing or still the template placeholder
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty() && *k != PLACEHOLDER_API_KEY)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub csv_enabled: bool,
    pub sqlite_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            csv_enabled: true,
            sqlite_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_age_secs: u64,
    /// Mirror entries under `<storage>/cache/` so they survive restarts
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 30 * 60,
            persist: true,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 5,
            pause_ms: 1000,
        }
    }
}

impl BatchConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

/// Scaling method for ML preprocessing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMethod {
    Minmax,
    Standard,
    Robust,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub enabled: bool,
    pub method: NormalizationMethod,
    pub feature_range: (f64, f64),
    pub with_mean: bool,
    pub with_std: bool,
    pub quantile_range: (f64, f64),
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: NormalizationMethod::Minmax,
            feature_range: (0.0, 1.0),
            with_mean: true,
            with_std: true,
            quantile_range: (25.0, 75.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorsConfig {
    pub enabled: bool,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub active_exchange: String,
    pub exchanges: HashMap<String, ExchangeConfig>,
    pub default_symbols: Vec<String>,
    pub data_types: Vec<DataKind>,
    pub timeframe: String,
    pub max_retries: u32,
    /// Base backoff delay, seconds
    pub retry_delay: f64,
    /// Backoff cap, seconds
    pub max_retry_delay: f64,
    /// Rows requested per download
    pub limit: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub normalization: NormalizationConfig,
    pub indicators: IndicatorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert("bybit".to_string(), ExchangeConfig::default());

        Self {
            active_exchange: "bybit".to_string(),
            exchanges,
            default_symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            data_types: vec![DataKind::Ohlcv],
            timeframe: "1d".to_string(),
            max_retries: 3,
            retry_delay: 5.0,
            max_retry_delay: 60.0,
            limit: 100,
            log_level: "INFO".to_string(),
            log_file: None,
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            normalization: NormalizationConfig::default(),
            indicators: IndicatorsConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AppError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot drive a run
    pub fn validate(&self) -> Result<()> {
        if self.active_exchange.trim().is_empty() {
            return Err(AppError::Config("active_exchange must not be empty".to_string()));
        }
        if !self.exchanges.contains_key(&self.active_exchange) {
            return Err(AppError::Config(format!(
                "active_exchange '{}' has no [exchanges.{}] section",
                self.active_exchange, self.active_exchange
            )));
        }
        if self.max_retries == 0 {
            return Err(AppError::Config("max_retries must be at least 1".to_string()));
        }
        for (name, secs) in [("retry_delay", self.retry_delay), ("max_retry_delay", self.max_retry_delay)] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(AppError::Config(format!(
                    "{} must be a finite, non-negative number of seconds (got {})",
                    name, secs
                )));
            }
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(AppError::Config(format!(
                "retry_delay ({}) exceeds max_retry_delay ({})",
                self.retry_delay, self.max_retry_delay
            )));
        }
        if self.limit == 0 {
            return Err(AppError::Config("limit must be at least 1".to_string()));
        }
        if self.batch.size == 0 {
            return Err(AppError::Config("batch.size must be at least 1".to_string()));
        }
        if self.timeframe.trim().is_empty() {
            return Err(AppError::Config("timeframe must not be empty".to_string()));
        }

        let (lo, hi) = self.normalization.feature_range;
        if lo >= hi {
            return Err(AppError::Config(format!(
                "normalization.feature_range ({}, {}) is empty",
                lo, hi
            )));
        }
        let (q_lo, q_hi) = self.normalization.quantile_range;
        if !(0.0..=100.0).contains(&q_lo) || !(0.0..=100.0).contains(&q_hi) || q_lo >= q_hi {
            return Err(AppError::Config(format!(
                "normalization.quantile_range ({}, {}) must be ordered within [0, 100]",
                q_lo, q_hi
            )));
        }

        Ok(())
    }

    /// Base backoff; clamps values `validate` would reject
    pub fn retry_delay(&self) -> Duration {
        clamped_secs(self.retry_delay)
    }

    pub fn max_retry_delay(&self) -> Duration {
        clamped_secs(self.max_retry_delay)
    }

    /// Settings for a named exchange, defaults when not configured
    pub fn exchange(&self, name: &str) -> ExchangeConfig {
        self.exchanges.get(name).cloned().unwrap_or_default()
    }
}

/// NaN and negatives become zero, anything too large `Duration::MAX`
fn clamped_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cache.max_age(), Duration::from_secs(1800));
        assert_eq!(config.batch.size, 5);
    }

    #[test]
    fn test_parse_full_file() {
        let raw = r#"
            active_exchange = "binance"
            default_symbols = ["BTC/USDT", "SOL/USDT"]
            data_types = ["ohlcv", "trades"]
            timeframe = "1h"
            max_retries = 5
            retry_delay = 0.5

            [exchanges.binance]
            api_key = "your_api_key_here"
            secret = "s3cret"

            [storage]
            path = "/tmp/market"
            csv_enabled = false

            [normalization]
            method = "robust"
            quantile_range = [10.0, 90.0]
        "#;

        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.active_exchange, "binance");
        assert_eq!(config.data_types, vec![DataKind::Ohlcv, DataKind::Trades]);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert!(!config.storage.csv_enabled);
        assert!(config.storage.sqlite_enabled);
        assert_eq!(config.normalization.method, NormalizationMethod::Robust);

        let binance = config.exchange("binance");
        assert_eq!(binance.effective_api_key(), None);
        assert!(binance.enable_rate_limit);
    }

    #[test]
    fn test_rejects_zero_retries() {
        let raw = r#"
            max_retries = 0
            [exchanges.bybit]
        "#;
        assert!(matches!(Config::from_toml_str(raw), Err(AppError::Config(_))));
    }

    #[test]
    fn test_rejects_unconfigured_active_exchange() {
        let raw = r#"
            active_exchange = "kraken"
            [exchanges.bybit]
        "#;
        assert!(matches!(Config::from_toml_str(raw), Err(AppError::Config(_))));
    }

    #[test]
    fn test_rejects_unrepresentable_delays() {
        for raw in [
            "retry_delay = inf\nmax_retry_delay = inf\n[exchanges.bybit]\n",
            "retry_delay = 1e30\nmax_retry_delay = 1e30\n[exchanges.bybit]\n",
            "max_retry_delay = nan\n[exchanges.bybit]\n",
            "retry_delay = -1.0\n[exchanges.bybit]\n",
        ] {
            match Config::from_toml_str(raw) {
                Err(AppError::Config(msg)) => assert!(msg.contains("retry_delay"), "{}", msg),
                other => panic!("expected config error for {:?}, got {:?}", raw, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_delay_accessors_clamp() {
        let mut config = Config::default();
        config.retry_delay = f64::INFINITY;
        config.max_retry_delay = 1e30;
        assert_eq!(config.retry_delay(), Duration::MAX);
        assert_eq!(config.max_retry_delay(), Duration::MAX);

        config.retry_delay = f64::NAN;
        config.max_retry_delay = -3.0;
        assert_eq!(config.retry_delay(), Duration::ZERO);
        assert_eq!(config.max_retry_delay(), Duration::ZERO);
    }

    #[test]
    fn test_rejects_bad_quantile_range() {
        let mut config = Config::default();
        config.normalization.quantile_range = (80.0, 20.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[exchanges.bybit]\n[cache]\nmax_age_secs = 60\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache.max_age_secs, 60);
    }
}
