//! Local SQLite database layer for the offline transaction engine.
//!
//! Uses rusqlite with WAL mode and `synchronous = FULL` so an acknowledged
//! enqueue survives a crash. Provides schema migrations, settings helpers,
//! and the shared connection state used by the queue and wallet reconciler.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Persistence(format!("db lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs pending migrations. Unlike a cache database the queue file is never
/// deleted on open failure: it may hold unsynced sales.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Persistence(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                error = %first_err,
                "Database open failed, retrying once without touching the file"
            );
            open_and_configure(&db_path).map_err(|e| {
                error!(error = %e, "Database open failed after retry");
                e
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database with the full schema. Used by tests and demos.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| SyncError::Persistence(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )
    .map_err(|e| SyncError::Persistence(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Persistence(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the offline transaction queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- offline_transactions (durable sale/recharge queue)
        CREATE TABLE IF NOT EXISTS offline_transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            receipt_id TEXT NOT NULL UNIQUE,
            wallet_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            payment_method TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK(status IN ('PENDING', 'SYNCING', 'SYNCED', 'FAILED')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_offline_tx_status_created
            ON offline_transactions(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_offline_tx_wallet
            ON offline_transactions(wallet_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Persistence(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (settings + offline transaction queue)");
    Ok(())
}

/// Migration v2: server-confirmed wallet balances.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS wallet_balances (
            wallet_id TEXT PRIMARY KEY,
            confirmed_balance INTEGER NOT NULL,
            source_receipt_id TEXT,
            confirmed_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Persistence(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (wallet_balances table)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v3: retry scheduling, operator attention flag and server
/// confirmation fields on the queue.
fn migrate_v3(conn: &Connection) -> Result<()> {
    let columns = [
        ("next_retry_at", "TEXT"),
        ("needs_attention", "INTEGER NOT NULL DEFAULT 0"),
        ("server_id", "TEXT"),
        ("balance_after", "INTEGER"),
    ];
    for (column, decl) in columns {
        if !column_exists(conn, "offline_transactions", column)? {
            conn.execute_batch(&format!(
                "ALTER TABLE offline_transactions ADD COLUMN {column} {decl};"
            ))
            .map_err(|e| SyncError::Persistence(format!("migration v3 add {column}: {e}")))?;
        }
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_offline_tx_next_retry
            ON offline_transactions(status, next_retry_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        SyncError::Persistence(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (retry scheduling + attention flag)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| SyncError::Persistence(format!("set_setting: {e}")))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
