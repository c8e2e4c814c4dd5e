//! Performance Monitor
//!
//! One record per logical download. Records are mutable while in flight and
//! frozen once completed; completed records are appended to
//! `metrics/operations.jsonl` and never rewritten.

use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LEDGER_FILE: &str = "operations.jsonl";

/// Opaque handle to one started operation
pub type OperationId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub symbol: String,
    pub exchange: String,
    pub rows_downloaded: usize,
    pub validation_passed: bool,
    pub errors: Vec<String>,
    pub stats: BTreeMap<String, f64>,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0)
    }
}

/// A change to an in-flight record
#[derive(Debug, Clone, PartialEq)]
pub enum MetricUpdate {
    RowsDownloaded(usize),
    ValidationPassed(bool),
    /// Appended to the error list
    Error(String),
    /// Set (or overwrite) one stat
    Stat(String, f64),
    /// Merge a stats map, overwriting same-named entries
    Stats(BTreeMap<String, f64>),
}

/// Aggregate over completed operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Percent of completed operations that succeeded
    pub success_rate: f64,
    pub total_rows: usize,
    pub mean_duration_ms: f64,
}

pub struct PerformanceMonitor {
    in_flight: DashMap<OperationId, OperationRecord>,
    completed: Mutex<Vec<OperationRecord>>,
    ledger: Option<Mutex<File>>,
    ledger_path: Option<PathBuf>,
}

impl PerformanceMonitor {
    /// Monitor without a durable ledger
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            ledger: None,
            ledger_path: None,
        }
    }

    /// Monitor appending completed records to `<dir>/operations.jsonl`
    pub fn with_ledger(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LEDGER_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            ledger: Some(Mutex::new(file)),
            ledger_path: Some(path),
            ..Self::new()
        })
    }

    pub fn ledger_path(&self) -> Option<&Path> {
        self.ledger_path.as_deref()
    }

    pub fn start_operation(&self, symbol: &str, exchange: &str) -> OperationId {
        let id = Uuid::new_v4();
        self.in_flight.insert(
            id,
            OperationRecord {
                id,
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
                rows_downloaded: 0,
                validation_passed: false,
                errors: Vec::new(),
                stats: BTreeMap::new(),
                success: false,
                started_at: Utc::now(),
                ended_at: None,
            },
        );
        debug!("Started operation {} for {} on {}", id, symbol, exchange);
        id
    }

    /// Apply `updates` to an in-flight record; unknown or completed ids are logged and ignored
    pub fn update_metrics(&self, id: OperationId, updates: impl IntoIterator<Item = MetricUpdate>) {
        let Some(mut record) = self.in_flight.get_mut(&id) else {
            warn!("update_metrics: no in-flight operation {}", id);
            return;
        };

        for update in updates {
            match update {
                MetricUpdate::RowsDownloaded(rows) => record.rows_downloaded = rows,
                MetricUpdate::ValidationPassed(passed) => record.validation_passed = passed,
                MetricUpdate::Error(error) => record.errors.push(error),
                MetricUpdate::Stat(name, value) => {
                    record.stats.insert(name, value);
                }
                MetricUpdate::Stats(stats) => record.stats.extend(stats),
            }
        }
    }

    /// Freeze the record and flush it to the ledger
    pub fn complete_operation(&self, id: OperationId, success: bool) -> Option<OperationRecord> {
        let Some((_, mut record)) = self.in_flight.remove(&id) else {
            warn!("complete_operation: no in-flight operation {}", id);
            return None;
        };

        record.success = success;
        record.ended_at = Some(Utc::now());

        if let Some(ledger) = &self.ledger {
            let appended = serde_json::to_string(&record)
                .map_err(crate::error::AppError::from)
                .and_then(|line| {
                    let mut file = ledger.lock();
                    writeln!(file, "{}", line)?;
                    Ok(())
                });
            if let Err(e) = appended {
                warn!("Failed to append operation {} to metrics ledger: {}", id, e);
            }
        }

        debug!(
            "Completed operation {} ({} {}): success={}, rows={}",
            id, record.exchange, record.symbol, success, record.rows_downloaded
        );

        self.completed.lock().push(record.clone());
        Some(record)
    }

    /// In-flight or completed record
    pub fn get(&self, id: OperationId) -> Option<OperationRecord> {
        if let Some(record) = self.in_flight.get(&id) {
            return Some(record.clone());
        }
        self.completed.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn completed(&self) -> Vec<OperationRecord> {
        self.completed.lock().clone()
    }

    pub fn summary(&self) -> MonitorSummary {
        let completed = self.completed.lock();
        let total = completed.len();
        let succeeded = completed.iter().filter(|r| r.success).count();
        let total_rows = completed.iter().map(|r| r.rows_downloaded).sum();

        let durations: Vec<f64> = completed.iter().filter_map(|r| r.duration_ms()).collect();
        let mean_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        MonitorSummary {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: if total > 0 {
                (succeeded as f64 / total as f64) * 100.0
            } else {
                0.0
            },
            total_rows,
            mean_duration_ms,
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
