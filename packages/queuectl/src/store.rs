//! SQLite storage backend.
//!
//! A single on-disk database file holds the whole queue: the `jobs` table,
//! the `dead_letter_queue` table and the `config` key/value table. Schema
//! upgrades are additive-only; older databases gain missing columns on open
//! without data loss.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Columns added after the first schema generation, with their defaults.
/// Opening an old database adds whichever of these are missing.
const ADDITIVE_JOB_COLUMNS: &[(&str, &str)] = &[
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
    ("timeout_seconds", "INTEGER NOT NULL DEFAULT 300"),
    ("run_at", "TEXT"),
    ("output", "TEXT"),
    ("execution_time_ms", "INTEGER"),
];

/// SQLite-backed store for jobs, DLQ entries and config.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    ///
    /// Pinned to a single connection: every SQLite `:memory:` connection is
    /// its own database, so a larger pool would scatter the tables.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing WAL state to the main database file.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                run_at TEXT,
                next_retry_at TEXT,
                error_message TEXT,
                output TEXT,
                execution_time_ms INTEGER,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, priority, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_queue (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.add_missing_job_columns().await?;

        Ok(())
    }

    /// Additive migration pass for databases created by older builds.
    async fn add_missing_job_columns(&self) -> Result<()> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('jobs')")
                .fetch_all(&self.pool)
                .await?;

        for (name, ddl) in ADDITIVE_JOB_COLUMNS {
            if !existing.iter().any(|c| c == name) {
                sqlx::query(&format!("ALTER TABLE jobs ADD COLUMN {name} {ddl}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }
}
