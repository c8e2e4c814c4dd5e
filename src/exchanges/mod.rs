//! Exchange gateways
//!
//! Every supported exchange implements [`ExchangeGateway`]. Gateways are built
//! by name through a closed [`ExchangeRegistry`] of factories and held open for
//! the whole run by [`ExchangeConnections`].

pub mod types;
pub mod http;
pub mod binance;
pub mod bybit;

#[cfg(test)]
pub(crate) mod mock;

use crate::config::{Config, ExchangeConfig};
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use types::*;

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Uniform access to one exchange's public market data.
///
/// Implementations must tolerate concurrent calls: every fetch is an
/// independent request/response exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Registry name (e.g., "binance", "bybit")
    fn id(&self) -> &str;

    /// Most rows a single request may return
    fn max_page_size(&self) -> usize;

    /// Fetch up to `limit` candles starting at `since` (ms), oldest first
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<OhlcvRow>>;

    /// Fetch up to `limit` executed trades starting at `since` (ms), oldest first
    async fn fetch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<TradeRecord>>;

    /// Release the connection; later fetches fail permanently
    async fn close(&self);
}

/// Builds a gateway from its configuration
pub type GatewayFactory =
    Arc<dyn Fn(&ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>> + Send + Sync>;

/// Closed name -> factory table
pub struct ExchangeRegistry {
    factories: HashMap<String, GatewayFactory>,
}

impl ExchangeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in exchanges
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("binance", |cfg| {
            Ok(Arc::new(binance::BinanceGateway::new(cfg)?) as Arc<dyn ExchangeGateway>)
        });
        registry.register("bybit", |cfg| {
            Ok(Arc::new(bybit::BybitGateway::new(cfg)?) as Arc<dyn ExchangeGateway>)
        });

        registry
    }

    /// Register (or replace) a factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a gateway by name
    pub fn create(&self, name: &str, config: &ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FetchError::permanent(format!("exchange not found: {}", name)))?;
        factory(config)
    }

    /// Registered exchange names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// The open gateways of one run, one per configured exchange
pub struct ExchangeConnections {
    gateways: HashMap<String, Arc<dyn ExchangeGateway>>,
    closed: AtomicBool,
}

impl ExchangeConnections {
    /// Open one gateway per configured exchange.
    ///
    /// Exchanges that cannot be built are logged and skipped; lookups of them
    /// later fail with a permanent error.
    pub fn open(registry: &ExchangeRegistry, config: &Config) -> Self {
        let mut gateways = HashMap::new();

        for (name, exchange_config) in &config.exchanges {
            match registry.create(name, exchange_config) {
                Ok(gateway) => {
                    tracing::info!("Initialized {} exchange", name);
                    gateways.insert(name.clone(), gateway);
                }
                Err(e) => {
                    tracing::error!("Error initializing {}: {}", name, e);
                }
            }
        }

        Self::from_gateways(gateways)
    }

    /// Wrap already-built gateways
    pub fn from_gateways(gateways: HashMap<String, Arc<dyn ExchangeGateway>>) -> Self {
        Self {
            gateways,
            closed: AtomicBool::new(false),
        }
    }

    /// Gateway for an exchange name
    pub fn get(&self, name: &str) -> FetchResult<Arc<dyn ExchangeGateway>> {
        if self.is_closed() {
            return Err(FetchError::permanent(format!(
                "exchange connections closed: {}",
                name
            )));
        }
        self.gateways
            .get(name)
            .cloned()
            .ok_or_else(|| FetchError::permanent(format!("exchange not found: {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.gateways.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every gateway exactly once
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (name, gateway) in &self.gateways {
            gateway.close().await;
            tracing::debug!("Closed {} exchange", name);
        }
        tracing::info!("All exchange sessions closed");
    }
}

impl Drop for ExchangeConnections {
    fn drop(&mut self) {
        if !self.is_closed() && !self.gateways.is_empty() {
            tracing::warn!("Exchange connections dropped without close_all()");
        }
    }
}

/// Open connections, run `body`, then close them whatever `body` returned.
pub async fn with_connections<F, Fut, T>(registry: &ExchangeRegistry, config: &Config, body: F) -> T
where
    F: FnOnce(Arc<ExchangeConnections>) -> Fut,
    Fut: Future<Output = T>,
{
    let connections = Arc::new(ExchangeConnections::open(registry, config));
    let output = body(connections.clone()).await;
    connections.close_all().await;
    output
}

#[cfg(test)]
mod tests {
    use super::mock::MockGateway;
    use super::*;
    use crate::error::AppError;

    fn registry_with_mock(mock: Arc<MockGateway>) -> ExchangeRegistry {
        let mut registry = ExchangeRegistry::new();
        registry.register("binance", move |_| Ok(mock.clone() as Arc<dyn ExchangeGateway>));
        registry
    }

    fn config_for(names: &[&str]) -> Config {
        let mut config = Config::default();
        config.exchanges.clear();
        for name in names {
            config.exchanges.insert(name.to_string(), ExchangeConfig::default());
        }
        config.active_exchange = names[0].to_string();
        config
    }

    #[test]
    fn test_default_registry_names() {
        let registry = ExchangeRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["binance".to_string(), "bybit".to_string()]);
    }

    #[test]
    fn test_unregistered_exchange_is_permanent() {
        let registry = ExchangeRegistry::new();
        let err = registry
            .create("kraken", &ExchangeConfig::default())
            .err()
            .unwrap();
        match err {
            AppError::Exchange(FetchError::Permanent(msg)) => assert!(msg.contains("exchange not found")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_open_skips_unknown_and_closes_once() {
        let mock = Arc::new(MockGateway::new("binance"));
        let registry = registry_with_mock(mock.clone());
        let connections = ExchangeConnections::open(&registry, &config_for(&["binance", "kraken"]));

        assert!(connections.get("binance").is_ok());
        assert!(matches!(connections.get("kraken"), Err(FetchError::Permanent(_))));

        connections.close_all().await;
        connections.close_all().await;
        assert_eq!(mock.close_count(), 1);
        assert!(connections.get("binance").is_err());
    }

    #[tokio::test]
    async fn test_with_connections_closes_on_error_path() {
        let mock = Arc::new(MockGateway::new("binance"));
        let registry = registry_with_mock(mock.clone());

        let result: std::result::Result<(), String> =
            with_connections(&registry, &config_for(&["binance"]), |_conns| async {
                Err("boom".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(mock.close_count(), 1);
    }
}
