//! Database module for Applitrack
//!
//! Provides pooled SQLite access for the sync engine and the keyed
//! settings table. Entity tables (applications, companies, contacts,
//! reminders, attachments) belong to the repository layer; the engine
//! only owns the tables created by `schema.sql`.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe SQLite handle backed by an r2d2 connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database at `db_path` and bootstrap the schema.
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// The pool is capped at a single connection so every caller sees the
    /// same in-memory database.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool.
    ///
    /// Public so repositories can run their entity mutation and the outbox
    /// append inside one transaction.
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for databases created by older releases.
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1 (v1.2): add force_push column for conflict resolutions
        let has_force_push: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('sync_outbox') WHERE name = 'force_push'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_force_push {
            log::info!("Running migration: adding force_push column to sync_outbox");
            conn.execute(
                "ALTER TABLE sync_outbox ADD COLUMN force_push INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }

        Ok(())
    }

    // =========================================================================
    // GENERIC HELPERS
    // =========================================================================

    /// Execute a statement, returning the number of affected rows.
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT, returning the new rowid.
    pub fn insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Run a query, mapping each row through `f`.
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Run a query expected to return exactly one row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute a batch of statements.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql).map_err(DbError::from)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Read a JSON-serialized setting, `None` when the key is absent.
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a JSON-serialized setting.
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }
}

/// Default location of the Applitrack database file.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("applitrack")
        .join("applitrack.db")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_schema() {
        let db = Database::in_memory().unwrap();

        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::in_memory().unwrap();

        assert!(db.get_setting::<String>("missing").unwrap().is_none());

        db.set_setting("greeting", &"hello".to_string()).unwrap();
        let value: Option<String> = db.get_setting("greeting").unwrap();
        assert_eq!(value, Some("hello".to_string()));

        // Overwrite
        db.set_setting("greeting", &"hi".to_string()).unwrap();
        let value: Option<String> = db.get_setting("greeting").unwrap();
        assert_eq!(value, Some("hi".to_string()));
    }

    #[test]
    fn test_insert_returns_rowid() {
        let db = Database::in_memory().unwrap();

        let id = db
            .insert(
                "INSERT INTO sync_outbox (entity_kind, entity_id, operation, enqueued_at)
                 VALUES ('contact', 'c-1', 'create', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        assert_eq!(id, 1);

        let id2 = db
            .insert(
                "INSERT INTO sync_outbox (entity_kind, entity_id, operation, enqueued_at)
                 VALUES ('contact', 'c-2', 'create', '2026-01-01T00:00:01Z')",
                [],
            )
            .unwrap();
        assert_eq!(id2, 2);
    }

    #[test]
    fn test_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db")).unwrap();

        db.set_setting("key", &42i64).unwrap();
        let value: Option<i64> = db.get_setting("key").unwrap();
        assert_eq!(value, Some(42));
    }
}
