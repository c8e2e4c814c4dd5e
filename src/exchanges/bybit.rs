//! Bybit v5 spot gateway (public market-data endpoints)

use super::http::{parse_candle, value_as_f64, value_as_i64, RestClient};
use super::types::{market_id, timeframe_millis, OhlcvRow, Side, TradeRecord};
use super::{ExchangeGateway, FetchResult};
use crate::config::ExchangeConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BASE_URL: &str = "https://api.bybit.com";
const CATEGORY: &str = "spot";
const MAX_KLINE_LIMIT: usize = 1000;
const MAX_SPOT_TRADE_LIMIT: usize = 60;
/// Public endpoints allow 600 requests per 5s per IP
const REQUEST_SPACING: Duration = Duration::from_millis(20);

/// retCodes that clear up on their own: "too many visits" and IP rate limit
const TRANSIENT_RET_CODES: &[i64] = &[10006, 10018];

/// Standard v5 response envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct TradeResult {
    #[serde(default)]
    list: Vec<RecentTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentTrade {
    exec_id: String,
    price: Value,
    size: Value,
    side: String,
    time: Value,
}

/// Bybit unified (v5) spot market data
pub struct BybitGateway {
    rest: RestClient,
    closed: AtomicBool,
}

impl BybitGateway {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config, BASE_URL, REQUEST_SPACING, "X-BAPI-API-KEY")?,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> FetchResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::permanent("bybit connection closed"));
        }
        Ok(())
    }

    /// Bybit kline interval code for a timeframe
    fn interval(timeframe: &str) -> FetchResult<&'static str> {
        let code = match timeframe {
            "1m" => "1",
            "3m" => "3",
            "5m" => "5",
            "15m" => "15",
            "30m" => "30",
            "1h" => "60",
            "2h" => "120",
            "4h" => "240",
            "6h" => "360",
            "12h" => "720",
            "1d" => "D",
            "1w" => "W",
            "1M" => "M",
            _ => {
                return Err(FetchError::permanent(format!(
                    "bybit does not support timeframe {}",
                    timeframe
                )))
            }
        };
        Ok(code)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> FetchResult<T> {
        let envelope: Envelope<T> = self.rest.get_json(path, query).await?;
        unwrap_envelope(envelope, path)
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>, path: &str) -> FetchResult<T> {
    if envelope.ret_code != 0 {
        let msg = format!("{} retCode {}: {}", path, envelope.ret_code, envelope.ret_msg);
        return Err(if TRANSIENT_RET_CODES.contains(&envelope.ret_code) {
            FetchError::Transient(msg)
        } else {
            FetchError::Permanent(msg)
        });
    }
    envelope
        .result
        .ok_or_else(|| FetchError::permanent(format!("{} returned no result", path)))
}

fn parse_klines(list: &[Vec<Value>]) -> FetchResult<Vec<OhlcvRow>> {
    let mut rows = list
        .iter()
        .map(|candle| parse_candle(candle).map(OhlcvRow::from_array))
        .collect::<FetchResult<Vec<_>>>()?;
    // Bybit lists newest first
    rows.sort_by_key(|r| r.timestamp);
    Ok(rows)
}

fn parse_trades(list: Vec<RecentTrade>, symbol: &str, since: Option<i64>) -> Vec<TradeRecord> {
    let mut trades: Vec<TradeRecord> = list
        .into_iter()
        .filter_map(|t| {
            let timestamp = value_as_i64(&t.time)?;
            let side = if t.side.eq_ignore_ascii_case("sell") {
                Side::Sell
            } else {
                Side::Buy
            };
            Some(TradeRecord::new(
                t.exec_id,
                timestamp,
                symbol,
                side,
                value_as_f64(&t.price).unwrap_or(f64::NAN),
                value_as_f64(&t.size).unwrap_or(f64::NAN),
            ))
        })
        // recent-trade has no start parameter
        .filter(|t| since.map_or(true, |s| t.timestamp >= s))
        .collect();
    trades.sort_by_key(|t| t.timestamp);
    trades
}

#[async_trait]
impl ExchangeGateway for BybitGateway {
    fn id(&self) -> &str {
        "bybit"
    }

    fn max_page_size(&self) -> usize {
        MAX_KLINE_LIMIT
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
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);

        let mut query = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", market_id(symbol)),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("start", since.to_string()));
            // Without an end bound Bybit returns the newest candles, not the ones after start
            if let Some(width) = timeframe_millis(timeframe) {
                query.push(("end", (since + width * limit as i64 - 1).to_string()));
            }
        }

        let result: KlineResult = self.get("/v5/market/kline", &query).await?;
        parse_klines(&result.list)
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: usize,
    ) -> FetchResult<Vec<TradeRecord>> {
        self.ensure_open()?;

        let query = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", market_id(symbol)),
            ("limit", limit.clamp(1, MAX_SPOT_TRADE_LIMIT).to_string()),
        ];

        let result: TradeResult = self.get("/v5/market/recent-trade", &query).await?;
        Ok(parse_trades(result.list, symbol, since))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Bybit session closed");
        }
    }
}
