//! Database module for the offer sync
//!
//! This module provides:
//! 1. A SQLite store with schema versioning
//! 2. Batched, idempotent upserts keyed on each table's conflict column
//! 3. Key lookups and filtered deletes for stale-row cleanup

mod records;
mod schema;

#[cfg(test)]
mod tests;

pub use schema::{SCHEMA_VERSION, verify_schema_integrity};

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, params_from_iter};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Rows per transaction and keys per `IN (...)` lookup
pub const BATCH_SIZE: usize = 500;

const PRAGMAS: &[(&str, &str)] = &[
    ("busy_timeout", "5000"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("temp_store", "MEMORY"),
];

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// A row type that lives in one table.
pub trait Record: Sized {
    const TABLE: &'static str;
    /// Column the upsert conflicts on
    const CONFLICT_KEY: &'static str;
    /// Columns written by an upsert, in the order of [`Record::values`]
    const COLUMNS: &'static [&'static str];

    fn values(&self) -> DatabaseResult<Vec<SqlValue>>;

    /// Build from a `SELECT *` row
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// `eq.0 = eq.1 AND lt.0 < lt.1`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteFilter {
    pub eq: (String, SqlValue),
    pub lt: (String, SqlValue),
}

impl DeleteFilter {
    pub fn new(eq_column: &str, eq: impl Into<SqlValue>, lt_column: &str, lt: impl Into<SqlValue>) -> Self {
        Self {
            eq: (eq_column.to_string(), eq.into()),
            lt: (lt_column.to_string(), lt.into()),
        }
    }
}

/// Persistence operations used by the sync.
pub trait Store: Send + Sync {
    /// Insert or update by conflict key. Returns the number of rows written.
    fn upsert_batch<R: Record>(&self, rows: &[R]) -> DatabaseResult<usize>;

    fn select_by_keys<R: Record>(&self, column: &str, keys: &[String]) -> DatabaseResult<Vec<R>>;

    /// Returns the number of deleted rows.
    fn delete_where(&self, table: &str, filter: &DeleteFilter) -> DatabaseResult<usize>;
}

/// Identifiers are interpolated into SQL, so only plain names are accepted.
fn check_identifier(name: &str) -> DatabaseResult<&str> {
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(DatabaseError::Schema(format!("invalid identifier: {name:?}")))
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn upsert_sql<R: Record>() -> String {
    let updates: Vec<String> = R::COLUMNS
        .iter()
        .filter(|column| **column != R::CONFLICT_KEY)
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        R::TABLE,
        R::COLUMNS.join(", "),
        placeholders(R::COLUMNS.len()),
        R::CONFLICT_KEY,
        updates.join(", ")
    )
}

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and bring the schema up to date
    pub fn open(db_path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        Self::configure(&conn)?;
        schema::initialize_schema(&conn)?;

        info!("Database initialized: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> DatabaseResult<()> {
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Journal mode set to: {}", mode);

        // Some pragmas answer with a row, others with nothing
        for (pragma, value) in PRAGMAS {
            match conn.query_row(&format!("PRAGMA {pragma} = {value}"), [], |_| Ok(())) {
                Ok(()) | Err(rusqlite::Error::QueryReturnedNoRows) => {
                    debug!("PRAGMA {} = {}", pragma, value)
                }
                Err(e) => warn!("Failed to set pragma {}: {}", pragma, e),
            }
        }
        Ok(())
    }

    pub fn count(&self, table: &str) -> DatabaseResult<u64> {
        let table = check_identifier(table)?;
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn schema_ok(&self) -> DatabaseResult<bool> {
        verify_schema_integrity(&self.conn.lock())
    }
}

impl Store for SqliteStore {
    fn upsert_batch<R: Record>(&self, rows: &[R]) -> DatabaseResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql::<R>();
        let mut conn = self.conn.lock();
        let mut written = 0;

        for chunk in rows.chunks(BATCH_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in chunk {
                    written += stmt.execute(params_from_iter(row.values()?))?;
                }
            }
            tx.commit()?;
        }

        debug!(table = R::TABLE, rows = rows.len(), "Upserted batch");
        Ok(written)
    }

    fn select_by_keys<R: Record>(&self, column: &str, keys: &[String]) -> DatabaseResult<Vec<R>> {
        let column = check_identifier(column)?;
        let conn = self.conn.lock();
        let mut found = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(BATCH_SIZE) {
            let sql = format!(
                "SELECT * FROM {} WHERE {column} IN ({})",
                R::TABLE,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| R::from_row(row))?;
            for row in rows {
                found.push(row?);
            }
        }
        Ok(found)
    }

    fn delete_where(&self, table: &str, filter: &DeleteFilter) -> DatabaseResult<usize> {
        let table = check_identifier(table)?;
        let eq_column = check_identifier(&filter.eq.0)?;
        let lt_column = check_identifier(&filter.lt.0)?;

        let conn = self.conn.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {table} WHERE {eq_column} = ?1 AND {lt_column} < ?2"),
            [&filter.eq.1, &filter.lt.1],
        )?;
        Ok(deleted)
    }
}
