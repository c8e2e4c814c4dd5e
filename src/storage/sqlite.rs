//! SQLite sink (`data.db`)
//!
//! One table per dataset, every column TEXT. Concurrent downloads share the
//! single connection; the mutex serializes their writes.

use super::Table;
use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Double-quote an identifier
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        tracing::debug!("Opened SQLite store {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create `name` if missing and append every row in one transaction
    pub fn append_table(&self, name: &str, table: &Table) -> Result<usize> {
        let table_ident = quote_ident(name);
        let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                table_ident,
                columns
                    .iter()
                    .map(|c| format!("{} TEXT", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            [],
        )?;

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table_ident,
            columns.join(", "),
            placeholders
        ))?;

        for row in &table.rows {
            stmt.execute(params_from_iter(row.iter()))?;
        }

        drop(stmt);
        tx.commit()?;

        Ok(table.len())
    }

    pub fn count_rows(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All rows of `name` in insertion order
    pub fn read_table(&self, name: &str) -> Result<Vec<Vec<String>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote_ident(name)))?;
        let width = stmt.column_count();

        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i).map(|v| v.unwrap_or_default()))
                    .collect::<rusqlite::Result<Vec<String>>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}
