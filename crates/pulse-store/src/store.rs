//! Store handle, connection setup, and schema migration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Statements applied by [`PulseStore::migrate`]. Every statement is
/// idempotent so migration can run on each boot.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS instances (
        instance_id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL UNIQUE,
        site_url TEXT,
        status TEXT NOT NULL DEFAULT 'pending_url',
        pending_reason TEXT,
        site_pub_key TEXT NOT NULL,
        site_key_alg TEXT NOT NULL DEFAULT 'ed25519',
        minute_of_day INTEGER NOT NULL,
        next_run_at TEXT,
        last_seen_at TEXT,
        last_success_at TEXT,
        app_version TEXT,
        build_id TEXT,
        commit_sha TEXT,
        built_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_instances_due
        ON instances (status, next_run_at)",
    "CREATE TABLE IF NOT EXISTS build_events (
        instance_id TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        app_version TEXT,
        build_id TEXT,
        commit_sha TEXT,
        built_at TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (instance_id, idempotency_key)
    )",
    "CREATE TABLE IF NOT EXISTS deliveries (
        id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        scheduled_for TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        response_status INTEGER,
        accepted INTEGER,
        dedup_hit INTEGER,
        last_error_code TEXT,
        last_error_message TEXT,
        completed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_instance
        ON deliveries (instance_id, scheduled_for)",
    "CREATE TABLE IF NOT EXISTS delivery_attempts (
        delivery_id TEXT NOT NULL,
        attempt_no INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER,
        http_status INTEGER,
        timed_out INTEGER NOT NULL DEFAULT 0,
        error_code TEXT,
        error_message TEXT,
        PRIMARY KEY (delivery_id, attempt_no)
    )",
    "CREATE TABLE IF NOT EXISTS dispatch_minute_load (
        minute_start TEXT PRIMARY KEY,
        scheduled_count INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        total_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS telemetry_samples (
        delivery_id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        collected_at TEXT NOT NULL,
        schema_ver INTEGER NOT NULL,
        accepted INTEGER NOT NULL DEFAULT 0,
        dedup_hit INTEGER NOT NULL DEFAULT 0,
        verify_ms INTEGER,
        items_checked INTEGER,
        items_failed INTEGER,
        total_ms INTEGER,
        app_version TEXT,
        error_code TEXT,
        raw_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_samples_instance
        ON telemetry_samples (instance_id, collected_at)",
    "CREATE TABLE IF NOT EXISTS telemetry_hourly (
        instance_id TEXT NOT NULL,
        bucket_hour TEXT NOT NULL,
        sample_count INTEGER NOT NULL DEFAULT 0,
        accepted_count INTEGER NOT NULL DEFAULT 0,
        dedup_count INTEGER NOT NULL DEFAULT 0,
        avg_verify_ms INTEGER,
        max_verify_ms INTEGER,
        sum_items_checked INTEGER,
        sum_items_failed INTEGER,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (instance_id, bucket_hour)
    )",
    "CREATE TABLE IF NOT EXISTS cloud_signing_keys (
        kid TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'active',
        public_jwk TEXT NOT NULL,
        created_at TEXT NOT NULL,
        retire_at TEXT
    )",
];

/// Handle to the Pulse SQLite store.
///
/// Cloning is cheap; all clones share one connection pool. SQLite permits
/// limited write concurrency, so the pool is capped at a single connection
/// and relies on WAL mode plus a busy timeout to absorb contention.
#[derive(Debug, Clone)]
pub struct PulseStore {
    pool: SqlitePool,
}

impl PulseStore {
    /// Opens (creating if missing) a file-backed store and runs migration.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or migrated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap_or_default()
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(opts).await
    }

    /// Opens an in-memory store and runs migration (tests, debug mode).
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or migrated.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap_or_default()
            .foreign_keys(true);
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self> {
        // One pinned connection: SQLite permits limited write concurrency,
        // and an in-memory database must never be recycled by the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Applies the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when a schema statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Checks database connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
