//! Persistence for per-client rate-limit records.
//!
//! [`RecordStore`] is the only path through which the limiter touches
//! durable state. [`SqliteStore`] keeps one row per client key in the
//! `rate_limit_records` table so counters survive restarts.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::Result;

/// Database path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// One persisted accounting row per distinct client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// The client key.
    pub identity: String,
    /// Start of the current window, in Unix seconds.
    pub window_start: i64,
    /// Requests allowed since `window_start`.
    pub access_count: i64,
}

/// Durable storage for [`RateLimitRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the record for `identity`, or `None` if the client has never
    /// been seen.
    async fn load(&self, identity: &str) -> Result<Option<RateLimitRecord>>;

    /// Creates or overwrites the record keyed by `record.identity`.
    async fn save(&self, record: &RateLimitRecord) -> Result<()>;

    /// Deletes every record whose window started at or before `cutoff`
    /// (Unix seconds), returning the number removed.
    async fn purge_expired(&self, cutoff: i64) -> Result<u64>;
}

/// SQLite-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path` and runs the
    /// schema migration. [`IN_MEMORY`] opens a private in-memory database.
    pub async fn open(path: &str) -> Result<Self> {
        if path == IN_MEMORY {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        debug!(path, "opened record store");
        Self::from_pool(pool).await
    }

    /// Opens a fresh in-memory database.
    ///
    /// Every SQLite connection to `:memory:` sees its own database, so the
    /// pool is pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and runs the schema migration.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Creates the records table if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_limit_records (
                identity     TEXT    NOT NULL PRIMARY KEY,
                window_start INTEGER NOT NULL,
                access_count INTEGER NOT NULL,
                created_at   TEXT    NOT NULL,
                updated_at   TEXT    NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn load(&self, identity: &str) -> Result<Option<RateLimitRecord>> {
        let row = sqlx::query(
            "SELECT identity, window_start, access_count
             FROM rate_limit_records
             WHERE identity = ?1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<RateLimitRecord> {
            Ok(RateLimitRecord {
                identity: row.try_get("identity")?,
                window_start: row.try_get("window_start")?,
                access_count: row.try_get("access_count")?,
            })
        })
        .transpose()
    }

    async fn save(&self, record: &RateLimitRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO rate_limit_records
                 (identity, window_start, access_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(identity) DO UPDATE SET
                 window_start = excluded.window_start,
                 access_count = excluded.access_count,
                 updated_at   = excluded.updated_at",
        )
        .bind(&record.identity)
        .bind(record.window_start)
        .bind(record.access_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_records WHERE window_start <= ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
