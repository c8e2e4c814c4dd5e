//! CSV sink

use super::Table;
use crate::error::Result;
use std::path::Path;

/// Replace `path` with a header row plus one record per table row
pub fn write_table(path: &Path, table: &Table) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = ::csv::Writer::from_path(path)?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;

    Ok(table.len())
}
