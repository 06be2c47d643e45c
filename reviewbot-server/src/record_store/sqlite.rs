//! SQLite implementation of `RecordStore`.
//!
//! This is the durable source of truth for "already reviewed": it survives
//! restarts, so a webhook redelivered after a crash is still recognised.
//!
//! # Schema Versioning
//!
//! The schema version is tracked with SQLite's `user_version` pragma. When the
//! schema changes, increment `SCHEMA_VERSION` and add a migration step in
//! `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reviewbot_core::PullRequestId;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use super::{ProcessedRecord, RecordStore, StoreError};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed record store.
///
/// `rusqlite::Connection` is not `Sync`, so it sits behind a `Mutex`; every
/// operation runs on the blocking pool via `spawn_blocking`.
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open or create the database at `path`.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL` for crash safety
    /// - `synchronous = FULL` so a committed record survives power loss
    /// - `busy_timeout = 5000ms`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::storage(
                        "create database directory",
                        format!("{}: {}", parent.display(), e),
                    )
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| StoreError::storage("open database", e))?;

        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(
                "SQLite refused WAL mode for {} (using {}), continuing",
                path.display(),
                journal_mode
            );
        }
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| StoreError::storage("set synchronous", e))?;
        conn.busy_timeout(Duration::from_millis(5000))
            .map_err(|e| StoreError::storage("set busy_timeout", e))?;

        init_schema(&conn)?;
        info!("Opened record store at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::storage("open database", e))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&conn).map_err(|e| StoreError::storage(operation, e))
        })
        .await
        .map_err(|e| StoreError::storage(operation, e))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| StoreError::storage("read schema version", e))?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::storage(
            "check schema version",
            format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            ),
        ));
    }

    if current_version < SCHEMA_VERSION {
        run_migrations(conn, current_version)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| StoreError::storage("write schema version", e))?;
    }

    Ok(())
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processed_prs (
                repository_name TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (repository_name, pr_number)
            );
            "#,
        )
        .map_err(|e| StoreError::storage("migrate v0 -> v1", e))?;
    }

    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn has_record(&self, pr: &PullRequestId) -> Result<bool, StoreError> {
        let repository = pr.repository.clone();
        let number = pr.number as i64;
        self.with_conn("has_record", move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM processed_prs WHERE repository_name = ?1 AND pr_number = ?2)",
                params![repository, number],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn insert_record(&self, pr: &PullRequestId) -> Result<(), StoreError> {
        let repository = pr.repository.clone();
        let number = pr.number as i64;
        let processed_at = chrono::Utc::now().to_rfc3339();
        self.with_conn("insert_record", move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_prs (repository_name, pr_number, processed_at) VALUES (?1, ?2, ?3)",
                params![repository, number, processed_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn list_records(&self) -> Result<Vec<ProcessedRecord>, StoreError> {
        self.with_conn("list_records", |conn| {
            let mut stmt = conn.prepare(
                "SELECT repository_name, pr_number, processed_at FROM processed_prs \
                 ORDER BY processed_at, rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ProcessedRecord {
                    repository_name: row.get(0)?,
                    pr_number: row.get::<_, i64>(1)? as u64,
                    processed_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}
