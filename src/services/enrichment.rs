//! ML preprocessing: column scaling and technical indicators over OHLCV rows.
//!
//! Timestamps are never scaled. NaN inputs stay NaN in every output.

use crate::config::{NormalizationConfig, NormalizationMethod};
use crate::error::{AppError, Result};
use crate::exchanges::types::OhlcvRow;
use crate::storage::{format_number, Table};

/// Scaled columns, in `OhlcvRow::values()` order
pub const FEATURE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// `y = (x - shift) * factor + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
struct ColumnScaler {
    shift: f64,
    factor: f64,
    offset: f64,
}

impl ColumnScaler {
    fn transform(&self, x: f64) -> f64 {
        (x - self.shift) * self.factor + self.offset
    }

    fn inverse(&self, y: f64) -> f64 {
        (y - self.offset) / self.factor + self.shift
    }
}

/// Zero spread would divide by zero; treat it as unit spread
fn non_zero(spread: f64) -> f64 {
    if spread == 0.0 {
        1.0
    } else {
        spread
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linear-interpolated percentile of sorted values, `q` in [0, 100]
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Per-column scaler fitted on one dataset
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizationConfig,
    scalers: Option<[ColumnScaler; 5]>,
}

impl Normalizer {
    pub fn new(config: NormalizationConfig) -> Self {
        Self {
            config,
            scalers: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.scalers.is_some()
    }

    pub fn fit(&mut self, rows: &[OhlcvRow]) -> Result<()> {
        let mut scalers = [ColumnScaler {
            shift: 0.0,
            factor: 1.0,
            offset: 0.0,
        }; 5];

        for (col, scaler) in scalers.iter_mut().enumerate() {
            let mut values: Vec<f64> = rows
                .iter()
                .map(|r| r.values()[col])
                .filter(|v| !v.is_nan())
                .collect();
            if values.is_empty() {
                return Err(AppError::Validation(format!(
                    "no values to fit column '{}'",
                    FEATURE_COLUMNS[col]
                )));
            }
            *scaler = self.fit_column(&mut values);
        }

        tracing::debug!(
            "Fitted {:?} scaler on {} rows for {:?}",
            self.config.method,
            rows.len(),
            FEATURE_COLUMNS
        );
        self.scalers = Some(scalers);
        Ok(())
    }

    fn fit_column(&self, values: &mut [f64]) -> ColumnScaler {
        match self.config.method {
            NormalizationMethod::Minmax => {
                let (lo, hi) = self.config.feature_range;
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                ColumnScaler {
                    shift: min,
                    factor: (hi - lo) / non_zero(max - min),
                    offset: lo,
                }
            }
            NormalizationMethod::Standard => {
                let mean = mean(values);
                let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / values.len() as f64)
                    .sqrt();
                ColumnScaler {
                    shift: if self.config.with_mean { mean } else { 0.0 },
                    factor: if self.config.with_std { 1.0 / non_zero(std) } else { 1.0 },
                    offset: 0.0,
                }
            }
            NormalizationMethod::Robust => {
                values.sort_by(|a, b| a.total_cmp(b));
                let (q_lo, q_hi) = self.config.quantile_range;
                let iqr = percentile(values, q_hi) - percentile(values, q_lo);
                ColumnScaler {
                    shift: percentile(values, 50.0),
                    factor: 1.0 / non_zero(iqr),
                    offset: 0.0,
                }
            }
        }
    }

    fn apply(&self, rows: &[OhlcvRow], f: impl Fn(&ColumnScaler, f64) -> f64) -> Result<Vec<OhlcvRow>> {
        let scalers = self
            .scalers
            .as_ref()
            .ok_or_else(|| AppError::Internal("normalizer used before fit".to_string()))?;

        Ok(rows
            .iter()
            .map(|r| {
                let v = r.values();
                OhlcvRow::new(
                    r.timestamp,
                    f(&scalers[0], v[0]),
                    f(&scalers[1], v[1]),
                    f(&scalers[2], v[2]),
                    f(&scalers[3], v[3]),
                    f(&scalers[4], v[4]),
                )
            })
            .collect())
    }

    pub fn transform(&self, rows: &[OhlcvRow]) -> Result<Vec<OhlcvRow>> {
        self.apply(rows, ColumnScaler::transform)
    }

    pub fn fit_transform(&mut self, rows: &[OhlcvRow]) -> Result<Vec<OhlcvRow>> {
        self.fit(rows)?;
        self.transform(rows)
    }

    pub fn inverse_transform(&self, rows: &[OhlcvRow]) -> Result<Vec<OhlcvRow>> {
        self.apply(rows, ColumnScaler::inverse)
    }
}

/// Mean of each full `window`; NaN during warm-up or when the window holds a NaN
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, mean)
}

/// Sample (n-1) standard deviation over each full `window`
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |w| {
        if w.len() < 2 {
            return f64::NAN;
        }
        let m = mean(w);
        (w.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (w.len() - 1) as f64).sqrt()
    })
}

fn rolling(values: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for (i, w) in values.windows(window).enumerate() {
        if w.iter().all(|v| !v.is_nan()) {
            out[i + window - 1] = f(w);
        }
    }
    out
}

/// Bias-adjusted exponential moving average with `alpha = 2 / (span + 1)`.
///
/// Every output is the weighted mean of all observations so far, with weight
/// `(1 - alpha)^age`. A NaN input repeats the previous output.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let decay = 1.0 - 2.0 / (span as f64 + 1.0);
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    values
        .iter()
        .map(|&x| {
            weighted_sum *= decay;
            weight_total *= decay;
            if !x.is_nan() {
                weighted_sum += x;
                weight_total += 1.0;
            }
            if weight_total > 0.0 {
                weighted_sum / weight_total
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// RSI from simple rolling means of gains and losses
pub fn rsi(close: &[f64], period: usize) -> Vec<f64> {
    let mut gains = vec![0.0; close.len()];
    let mut losses = vec![0.0; close.len()];
    for i in 1..close.len() {
        let delta = close[i] - close[i - 1];
        if delta > 0.0 {
            gains[i] = delta;
        } else if delta < 0.0 {
            losses[i] = -delta;
        }
    }

    rolling_mean(&gains, period)
        .into_iter()
        .zip(rolling_mean(&losses, period))
        .map(|(gain, loss)| 100.0 - 100.0 / (1.0 + gain / loss))
        .collect()
}

/// OHLCV rows plus named indicator columns of the same length
#[derive(Debug, Clone)]
pub struct IndicatorFrame {
    pub rows: Vec<OhlcvRow>,
    pub columns: Vec<(&'static str, Vec<f64>)>,
}

impl IndicatorFrame {
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn to_table(&self) -> Table {
        let mut header = vec!["timestamp", "open", "high", "low", "close", "volume"];
        header.extend(self.columns.iter().map(|(name, _)| *name));

        let mut table = Table::new(header);
        for (i, row) in self.rows.iter().enumerate() {
            let mut cells = Vec::with_capacity(6 + self.columns.len());
            cells.push(row.timestamp.to_string());
            cells.extend(row.values().iter().map(|v| format_number(*v)));
            cells.extend(self.columns.iter().map(|(_, values)| format_number(values[i])));
            table.push_row(cells);
        }
        table
    }
}

/// SMA 20/50, EMA 12/26, MACD + signal, RSI 14, Bollinger(20, 2), volume SMA 20
pub fn technical_indicators(rows: &[OhlcvRow]) -> IndicatorFrame {
    let close: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let volume: Vec<f64> = rows.iter().map(|r| r.volume).collect();

    let ema_12 = ema(&close, 12);
    let ema_26 = ema(&close, 26);
    let macd: Vec<f64> = ema_12.iter().zip(&ema_26).map(|(a, b)| a - b).collect();
    let macd_signal = ema(&macd, 9);

    let bb_middle = rolling_mean(&close, 20);
    let bb_std = rolling_std(&close, 20);
    let bb_upper: Vec<f64> = bb_middle.iter().zip(&bb_std).map(|(m, s)| m + 2.0 * s).collect();
    let bb_lower: Vec<f64> = bb_middle.iter().zip(&bb_std).map(|(m, s)| m - 2.0 * s).collect();

    IndicatorFrame {
        rows: rows.to_vec(),
        columns: vec![
            ("sma_20", bb_middle.clone()),
            ("sma_50", rolling_mean(&close, 50)),
            ("ema_12", ema_12),
            ("ema_26", ema_26),
            ("macd", macd),
            ("macd_signal", macd_signal),
            ("rsi", rsi(&close, 14)),
            ("bb_middle", bb_middle),
            ("bb_upper", bb_upper),
            ("bb_lower", bb_lower),
            ("volume_sma_20", rolling_mean(&volume, 20)),
        ],
    }
}
