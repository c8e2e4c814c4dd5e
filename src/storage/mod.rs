//! Persistent store
//!
//! Every dataset lands in two sinks under the storage root:
//! `csv/<name>.csv` (rewritten on each save) and table `<name>` in `data.db`
//! (appended). Either sink can be switched off in configuration.

mod csv;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::config::{DataKind, StorageConfig};
use crate::error::{AppError, Result};
use crate::exchanges::types::{OhlcvRow, TradeRecord};
use std::path::{Path, PathBuf};

pub const CSV_DIR: &str = "csv";
pub const DB_FILE: &str = "data.db";

/// Identity of one persisted dataset
#[derive(Debug, Clone, Copy)]
pub struct DatasetName<'a> {
    pub exchange: &'a str,
    pub symbol: &'a str,
    /// Present for OHLCV only
    pub timeframe: Option<&'a str>,
    pub kind: DataKind,
    /// Derived datasets, e.g. `normalized` or `indicators`
    pub suffix: Option<&'a str>,
}

impl<'a> DatasetName<'a> {
    pub fn ohlcv(exchange: &'a str, symbol: &'a str, timeframe: &'a str) -> Self {
        Self {
            exchange,
            symbol,
            timeframe: Some(timeframe),
            kind: DataKind::Ohlcv,
            suffix: None,
        }
    }

    pub fn trades(exchange: &'a str, symbol: &'a str) -> Self {
        Self {
            exchange,
            symbol,
            timeframe: None,
            kind: DataKind::Trades,
            suffix: None,
        }
    }

    pub fn with_suffix(self, suffix: &'a str) -> Self {
        Self {
            suffix: Some(suffix),
            ..self
        }
    }

    /// `<exchange>_<symbol / -> _>[_<timeframe>]_<kind>[_<suffix>]`
    pub fn render(&self) -> String {
        let mut name = format!("{}_{}", self.exchange, self.symbol.replace('/', "_"));
        if let Some(tf) = self.timeframe {
            name.push('_');
            name.push_str(tf);
        }
        name.push('_');
        name.push_str(self.kind.as_str());
        if let Some(suffix) = self.suffix {
            name.push('_');
            name.push_str(suffix);
        }
        name
    }
}

/// Column-named rows of text cells, the shape both sinks store
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn from_ohlcv(rows: &[OhlcvRow]) -> Self {
        let mut table = Self::new(["timestamp", "open", "high", "low", "close", "volume"]);
        for row in rows {
            let mut cells = Vec::with_capacity(6);
            cells.push(row.timestamp.to_string());
            cells.extend(row.values().iter().map(|v| format_number(*v)));
            table.push_row(cells);
        }
        table
    }

    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let mut table = Self::new(["id", "timestamp", "symbol", "side", "price", "amount", "cost"]);
        for t in trades {
            table.push_row(vec![
                t.id.clone(),
                t.timestamp.to_string(),
                t.symbol.clone(),
                t.side.to_string(),
                format_number(t.price),
                format_number(t.amount),
                format_number(t.cost),
            ]);
        }
        table
    }
}

/// Text cell for a numeric value; NaN is an empty cell
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

/// Rows written per sink by one save
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    pub name: String,
    pub csv_rows: Option<usize>,
    pub db_rows: Option<usize>,
}

/// CSV directory + SQLite database under one root
pub struct DataStore {
    root: PathBuf,
    csv_enabled: bool,
    sqlite: Option<SqliteStore>,
}

impl DataStore {
    /// Create the directory layout and open `data.db` when enabled
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let root = config.path.clone();
        std::fs::create_dir_all(&root)?;

        if config.csv_enabled {
            std::fs::create_dir_all(root.join(CSV_DIR))?;
        }

        let sqlite = if config.sqlite_enabled {
            Some(SqliteStore::open(&root.join(DB_FILE))?)
        } else {
            None
        };

        tracing::info!(
            "Data store ready at {} (csv: {}, sqlite: {})",
            root.display(),
            config.csv_enabled,
            config.sqlite_enabled
        );

        Ok(Self {
            root,
            csv_enabled: config.csv_enabled,
            sqlite,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn csv_path(&self, name: &str) -> PathBuf {
        self.root.join(CSV_DIR).join(format!("{}.csv", name))
    }

    pub fn sqlite(&self) -> Option<&SqliteStore> {
        self.sqlite.as_ref()
    }

    /// Write `table` to every enabled sink.
    ///
    /// Fails with `AppError::Storage` naming the sink that failed; a CSV
    /// failure does not stop the SQLite write.
    pub fn save(&self, name: &DatasetName<'_>, table: &Table) -> Result<SaveReport> {
        let rendered = name.render();
        let mut report = SaveReport {
            name: rendered.clone(),
            ..SaveReport::default()
        };
        let mut failures = Vec::new();

        if self.csv_enabled {
            let path = self.csv_path(&rendered);
            match csv::write_table(&path, table) {
                Ok(rows) => {
                    tracing::info!("Saved {} rows to {}", rows, path.display());
                    report.csv_rows = Some(rows);
                }
                Err(e) => failures.push(format!("csv {}: {}", path.display(), e)),
            }
        }

        if let Some(sqlite) = &self.sqlite {
            match sqlite.append_table(&rendered, table) {
                Ok(rows) => {
                    tracing::info!("Saved {} rows to table {}", rows, rendered);
                    report.db_rows = Some(rows);
                }
                Err(e) => failures.push(format!("sqlite {}: {}", rendered, e)),
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(AppError::Storage(failures.join("; ")))
        }
    }
}
