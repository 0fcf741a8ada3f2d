//! Database schema management
//!
//! Creates the sync tables and tracks the schema version.

use rusqlite::Connection;
use tracing::{error, info, warn};

use super::{DatabaseError, DatabaseResult};

/// Database schema version
pub const SCHEMA_VERSION: u32 = 1;

const REQUIRED_TABLES: [&str; 4] = ["stores", "products", "offers", "schema_version"];

/// Create or migrate the schema
pub fn initialize_schema(conn: &Connection) -> DatabaseResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_initial_schema(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Database schema initialized to version {}", SCHEMA_VERSION);
    } else if current_version > SCHEMA_VERSION {
        error!(
            "Database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        );
        return Err(DatabaseError::Schema(
            "Database schema is newer than supported version".to_string(),
        ));
    }

    Ok(())
}

fn create_initial_schema(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stores (
            id TEXT PRIMARY KEY,
            remote_id TEXT NOT NULL,
            source TEXT NOT NULL,
            name TEXT NOT NULL,
            slug TEXT,
            brand TEXT,
            street_address TEXT,
            postcode TEXT,
            city TEXT,
            latitude REAL,
            longitude REAL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_seen_at TEXT NOT NULL,
            raw_data TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ean TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            image_url TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS offers (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL REFERENCES stores(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            price REAL NOT NULL,
            unit_price REAL,
            unit TEXT,
            normal_price REAL,
            quantity_required INTEGER NOT NULL DEFAULT 1,
            source_url TEXT,
            image_url TEXT,
            categories TEXT,
            valid_from TEXT,
            valid_to TEXT,
            canonical_product_id INTEGER REFERENCES products(id) ON DELETE SET NULL,
            needs_review INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_offers_store_updated ON offers(store_id, updated_at);
        CREATE INDEX IF NOT EXISTS idx_offers_product ON offers(canonical_product_id);
        CREATE INDEX IF NOT EXISTS idx_offers_review ON offers(needs_review);",
    )?;

    info!("Initial database schema created successfully");
    Ok(())
}

fn get_schema_version(conn: &Connection) -> DatabaseResult<u32> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| {
            let count: i64 = row.get(0)?;
            Ok(count > 0)
        },
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .unwrap_or(0);
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> DatabaseResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        [version],
    )?;
    Ok(())
}

/// Check that every table exists and SQLite reports no corruption
pub fn verify_schema_integrity(conn: &Connection) -> DatabaseResult<bool> {
    for table_name in REQUIRED_TABLES {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table_name],
            |row| {
                let count: i64 = row.get(0)?;
                Ok(count > 0)
            },
        )?;

        if !exists {
            error!("Required table '{}' does not exist", table_name);
            return Ok(false);
        }
    }

    let fk_enabled: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if fk_enabled != 1 {
        warn!("Foreign key constraints are not enabled");
    }

    let integrity: String = conn.query_row("PRAGMA integrity_check(1)", [], |row| row.get(0))?;
    if integrity != "ok" {
        error!("Database integrity check failed: {}", integrity);
        return Ok(false);
    }

    Ok(true)
}
