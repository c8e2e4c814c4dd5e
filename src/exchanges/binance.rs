//! Binance spot gateway (public market-data endpoints)

use super::http::{parse_candle, value_as_f64, RestClient};
use super::types::{market_id, OhlcvRow, Side, TradeRecord};
use super::{ExchangeGateway, FetchResult};
use crate::config::ExchangeConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BASE_URL: &str = "https://api.binance.com";
const MAX_LIMIT: usize = 1000;
/// Weight budget is 6000/min; one klines call costs 2
const REQUEST_SPACING: Duration = Duration::from_millis(50);

const INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// Aggregated trade as returned by `/api/v3/aggTrades`
#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "a")]
    id: i64,
    #[serde(rename = "p")]
    price: Value,
    #[serde(rename = "q")]
    quantity: Value,
    #[serde(rename = "T")]
    time: i64,
    /// Buyer was the maker, so the taker sold
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Binance spot market data
pub struct BinanceGateway {
    rest: RestClient,
    closed: AtomicBool,
}

impl BinanceGateway {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config, BASE_URL, REQUEST_SPACING, "X-MBX-APIKEY")?,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> FetchResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::permanent("binance connection closed"));
        }
        Ok(())
    }

    fn interval(timeframe: &str) -> FetchResult<&str> {
        INTERVALS
            .iter()
            .find(|i| **i == timeframe)
            .copied()
            .ok_or_else(|| FetchError::permanent(format!("binance does not support timeframe {}", timeframe)))
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    fn id(&self) -> &str {
        "binance"
    }

    fn max_page_size(&self) -> usize {
        MAX_LIMIT
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<OhlcvRow>> {
        self.ensure_open()?;
        let interval = Self::interval(timeframe)?;

        let mut query = vec![
            ("symbol", market_id(symbol)),
            ("interval", interval.to_string()),
            ("limit", limit.clamp(1, MAX_LIMIT).to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime", since.to_string()));
        }

        let raw: Vec<Vec<Value>> = self.rest.get_json("/api/v3/klines", &query).await?;

        raw.iter()
            .map(|candle| parse_candle(candle).map(OhlcvRow::from_array))
            .collect()
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<TradeRecord>> {
        self.ensure_open()?;

        let mut query = vec![
            ("symbol", market_id(symbol)),
            ("limit", limit.clamp(1, MAX_LIMIT).to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime", since.to_string()));
        }

        let raw: Vec<AggTrade> = self.rest.get_json("/api/v3/aggTrades", &query).await?;

        Ok(raw
            .into_iter()
            .map(|t| {
                let side = if t.buyer_is_maker { Side::Sell } else { Side::Buy };
                TradeRecord::new(
                    t.id.to_string(),
                    t.time,
                    symbol,
                    side,
                    value_as_f64(&t.price).unwrap_or(f64::NAN),
                    value_as_f64(&t.quantity).unwrap_or(f64::NAN),
                )
            })
            .collect())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Binance session closed");
        }
    }
}
