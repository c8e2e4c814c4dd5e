//! Common exchange row types

use serde::{Deserialize, Serialize};
use std::fmt;

/// One OHLCV observation.
///
/// `low <= open, close <= high` is expected of well-formed market data but is
/// not enforced here; the validator checks it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRow {
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl OhlcvRow {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Build from the positional `[ts, o, h, l, c, v]` layout exchanges return
    pub fn from_array(raw: [f64; 6]) -> Self {
        Self::new(raw[0] as i64, raw[1], raw[2], raw[3], raw[4], raw[5])
    }

    /// The numeric columns in output order
    pub fn values(&self) -> [f64; 5] {
        [self.open, self.high, self.low, self.close, self.volume]
    }
}

/// Trade direction from the taker's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    /// price * amount
    pub cost: f64,
}

impl TradeRecord {
    pub fn new(
        id: impl Into<String>,
        timestamp: i64,
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        amount: f64,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            symbol: symbol.into(),
            side,
            price,
            amount,
            cost: price * amount,
        }
    }
}

/// Candle width in milliseconds for a `1m`..`1M` style timeframe
pub fn timeframe_millis(timeframe: &str) -> Option<i64> {
    let (unit_at, _) = timeframe.char_indices().last()?;
    let (count, unit) = timeframe.split_at(unit_at);
    let count: i64 = count.parse().ok().filter(|c| *c > 0)?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => return None,
    };
    Some(count * unit_ms)
}

/// `BTC/USDT` -> `BTCUSDT`
pub fn market_id(symbol: &str) -> String {
    symbol.replace('/', "").to_ascii_uppercase()
}
