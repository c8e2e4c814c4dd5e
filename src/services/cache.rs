//! Result Cache
//!
//! Keeps the latest validated OHLCV dataset per (exchange, symbol, timeframe).
//! Staleness is checked when an entry is read; stale entries stay in the map
//! until the next `put` for the same key replaces them.
//!
//! With persistence enabled every `put` is mirrored to
//! `<dir>/<exchange>_<symbol>_<timeframe>_ohlcv_<keyhash>.json`, written atomically
//! (`.tmp` then rename) and checksummed, so a later run can reload it.

use crate::error::{AppError, Result};
use crate::exchanges::types::OhlcvRow;
use crate::storage::DatasetName;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Series identity; `since`/`limit` are deliberately not part of it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
}

impl CacheKey {
    pub fn new(exchange: &str, symbol: &str, timeframe: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        }
    }

    /// Readable dataset name plus a short key digest; `/` and `_` both
    /// render as `_`, so the name alone is not unique.
    fn file_stem(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.exchange, &self.symbol, &self.timeframe] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}_{}",
            DatasetName::ohlcv(&self.exchange, &self.symbol, &self.timeframe).render(),
            &digest[..12]
        )
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    rows: Arc<Vec<OhlcvRow>>,
    fetched_at: DateTime<Utc>,
}

/// On-disk form of one entry
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: CacheKey,
    fetched_at: DateTime<Utc>,
    /// Hex SHA-256 of the JSON-encoded rows
    checksum: String,
    rows: Vec<OhlcvRow>,
}

fn rows_checksum(rows: &[OhlcvRow]) -> Result<String> {
    let encoded = serde_json::to_vec(rows)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_age: Duration,
    persist_dir: Option<PathBuf>,
}

impl ResultCache {
    /// In-memory cache
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
            persist_dir: None,
        }
    }

    /// Cache mirrored to `dir`
    pub fn with_persistence(max_age: Duration, dir: impl Into<PathBuf>) -> Self {
        Self {
            persist_dir: Some(dir.into()),
            ..Self::new(max_age)
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh dataset for `key`, if any
    pub fn get(&self, key: &CacheKey) -> Option<Vec<OhlcvRow>> {
        self.get_at(key, Utc::now())
    }

    /// `get` as seen at time `now`
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Vec<OhlcvRow>> {
        let entry = self.entries.get(key)?;
        // An entry stamped in the future counts as brand new
        let age = (now - entry.fetched_at).to_std().unwrap_or_default();
        if age > self.max_age {
            tracing::debug!(
                "Cache entry {}/{}/{} is stale ({:?} old)",
                key.exchange,
                key.symbol,
                key.timeframe,
                age
            );
            return None;
        }
        Some(entry.rows.as_ref().clone())
    }

    /// Store `rows` for `key`, replacing any previous entry
    pub fn put(&self, key: CacheKey, rows: Vec<OhlcvRow>) {
        self.put_at(key, rows, Utc::now());
    }

    /// `put` stamped with `fetched_at`
    pub fn put_at(&self, key: CacheKey, rows: Vec<OhlcvRow>, fetched_at: DateTime<Utc>) {
        let rows = Arc::new(rows);

        if let Some(dir) = &self.persist_dir {
            if let Err(e) = write_entry(dir, &key, &rows, fetched_at) {
                tracing::warn!("Failed to persist cache entry {}: {}", key.file_stem(), e);
            }
        }

        self.entries.insert(key, CacheEntry { rows, fetched_at });
    }

    /// Reload entries written by earlier runs.
    ///
    /// Files that fail to parse or whose checksum does not match are renamed
    /// with a `.quarantined` suffix. An entry already in memory wins when it is
    /// at least as new as the file. Returns the number of entries restored.
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(dir) = &self.persist_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut restored = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match read_entry(&path) {
                Ok(persisted) => {
                    let newer = self
                        .entries
                        .get(&persisted.key)
                        .map_or(true, |current| current.fetched_at < persisted.fetched_at);
                    if newer {
                        self.entries.insert(
                            persisted.key,
                            CacheEntry {
                                rows: Arc::new(persisted.rows),
                                fetched_at: persisted.fetched_at,
                            },
                        );
                        restored += 1;
                    }
                }
                Err(e) => {
                    let quarantine = quarantine_path(&path);
                    tracing::warn!(
                        "Quarantining corrupt cache file {}: {}",
                        path.display(),
                        e
                    );
                    if let Err(rename_err) = fs::rename(&path, &quarantine) {
                        tracing::error!(
                            "Failed to quarantine {}: {}",
                            path.display(),
                            rename_err
                        );
                    }
                }
            }
        }

        tracing::info!("Restored {} cache entries from {}", restored, dir.display());
        Ok(restored)
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".quarantined");
    PathBuf::from(name)
}

fn write_entry(dir: &Path, key: &CacheKey, rows: &[OhlcvRow], fetched_at: DateTime<Utc>) -> Result<()> {
    fs::create_dir_all(dir)?;

    let persisted = PersistedEntry {
        key: key.clone(),
        fetched_at,
        checksum: rows_checksum(rows)?,
        rows: rows.to_vec(),
    };

    let path = dir.join(format!("{}.json", key.file_stem()));
    let tmp_path = path.with_extension("json.tmp");

    fs::write(&tmp_path, serde_json::to_vec(&persisted)?)?;
    fs::rename(&tmp_path, &path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        AppError::Storage(format!("atomic rename of {} failed: {}", path.display(), e))
    })?;

    Ok(())
}

fn read_entry(path: &Path) -> Result<PersistedEntry> {
    let raw = fs::read(path)?;
    let persisted: PersistedEntry = serde_json::from_slice(&raw)?;

    let actual = rows_checksum(&persisted.rows)?;
    if actual != persisted.checksum {
        return Err(AppError::Validation(format!(
            "checksum mismatch (expected {}, got {})",
            persisted.checksum, actual
        )));
    }

    Ok(persisted)
}
