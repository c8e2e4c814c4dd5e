//! Data Validator
//!
//! Integrity checks on fetched datasets. Validation never errors: it returns
//! a verdict plus counters, and the orchestrator decides what to do with it.

use crate::exchanges::types::{OhlcvRow, TradeRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Relative tolerance for `cost == price * amount`
const COST_TOLERANCE: f64 = 1e-9;

/// Verdict on one dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub errors: Vec<String>,
    pub stats: BTreeMap<String, f64>,
}

impl ValidationResult {
    fn new(rows: usize) -> Self {
        let mut stats = BTreeMap::new();
        stats.insert("rows".to_string(), rows as f64);
        Self {
            passed: true,
            errors: Vec::new(),
            stats,
        }
    }

    /// Record a violated check; zero counts are ignored
    fn violation(&mut self, stat: &str, count: usize, message: String) {
        if count == 0 {
            return;
        }
        self.passed = false;
        self.stats.insert(stat.to_string(), count as f64);
        self.errors.push(message);
    }

    fn fail(&mut self, message: &str) {
        self.passed = false;
        self.errors.push(message.to_string());
    }

    pub fn stat(&self, name: &str) -> Option<f64> {
        self.stats.get(name).copied()
    }
}

/// Stateless validation service
pub struct DataValidator;

impl DataValidator {
    /// Check an OHLCV dataset.
    ///
    /// Counters: `null_values`, `ohlc_violations` (rows with high < low),
    /// `open_close_out_of_range`, `negative_volume`, `duplicate_timestamps`,
    /// `unordered_timestamps`.
    pub fn validate_ohlcv(rows: &[OhlcvRow]) -> ValidationResult {
        let mut result = ValidationResult::new(rows.len());

        if rows.is_empty() {
            result.fail("dataset is empty");
            return result;
        }

        let mut null_values = 0;
        let mut high_below_low = 0;
        let mut out_of_range = 0;
        let mut negative_volume = 0;

        for row in rows {
            let nulls = row.values().iter().filter(|v| v.is_nan()).count();
            null_values += nulls;

            if row.high < row.low {
                high_below_low += 1;
            } else if nulls == 0 {
                let within = |v: f64| row.low <= v && v <= row.high;
                if !within(row.open) || !within(row.close) {
                    out_of_range += 1;
                }
            }

            if row.volume < 0.0 {
                negative_volume += 1;
            }
        }

        let (duplicates, unordered) = timestamp_violations(rows.iter().map(|r| r.timestamp));

        result.violation(
            "null_values",
            null_values,
            format!("{} null/NaN values in price or volume columns", null_values),
        );
        result.violation(
            "ohlc_violations",
            high_below_low,
            format!("{} rows with high < low", high_below_low),
        );
        result.violation(
            "open_close_out_of_range",
            out_of_range,
            format!("{} rows with open or close outside [low, high]", out_of_range),
        );
        result.violation(
            "negative_volume",
            negative_volume,
            format!("{} rows with negative volume", negative_volume),
        );
        result.violation(
            "duplicate_timestamps",
            duplicates,
            format!("{} duplicate timestamps", duplicates),
        );
        result.violation(
            "unordered_timestamps",
            unordered,
            format!("{} timestamps not strictly increasing", unordered),
        );

        if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
            result
                .stats
                .insert("first_timestamp".to_string(), first.timestamp as f64);
            result
                .stats
                .insert("last_timestamp".to_string(), last.timestamp as f64);
        }

        result
    }

    /// Check a trades dataset.
    ///
    /// Trades may share a timestamp, so ordering only needs to be
    /// non-decreasing.
    pub fn validate_trades(trades: &[TradeRecord]) -> ValidationResult {
        let mut result = ValidationResult::new(trades.len());

        if trades.is_empty() {
            result.fail("dataset is empty");
            return result;
        }

        let bad_price = trades.iter().filter(|t| !(t.price > 0.0)).count();
        let bad_amount = trades.iter().filter(|t| !(t.amount > 0.0)).count();
        let cost_mismatch = trades
            .iter()
            .filter(|t| {
                let expected = t.price * t.amount;
                !((t.cost - expected).abs() <= COST_TOLERANCE * expected.abs().max(1.0))
            })
            .count();
        let unordered = trades
            .windows(2)
            .filter(|w| w[1].timestamp < w[0].timestamp)
            .count();

        result.violation(
            "non_positive_price",
            bad_price,
            format!("{} trades with non-positive price", bad_price),
        );
        result.violation(
            "non_positive_amount",
            bad_amount,
            format!("{} trades with non-positive amount", bad_amount),
        );
        result.violation(
            "cost_mismatch",
            cost_mismatch,
            format!("{} trades where cost != price * amount", cost_mismatch),
        );
        result.violation(
            "unordered_timestamps",
            unordered,
            format!("{} trades out of timestamp order", unordered),
        );

        result
    }
}

/// (repeated timestamps, adjacent pairs that go backwards)
fn timestamp_violations(timestamps: impl Iterator<Item = i64>) -> (usize, usize) {
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    let mut unordered = 0;
    let mut previous: Option<i64> = None;

    for ts in timestamps {
        if !seen.insert(ts) {
            duplicates += 1;
        }
        if let Some(prev) = previous {
            if ts < prev {
                unordered += 1;
            }
        }
        previous = Some(ts);
    }

    (duplicates, unordered)
}
