//! Sidecar metadata index for the cache.
//!
//! A `SQLite`-backed mapping from resource id to the cached file's local
//! path, modification time, storage priority, and source mirror. WAL mode
//! keeps concurrent readers cheap; the schema is applied at connect time.
//! An in-memory variant backs tests.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::FromRow;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::error::DownloadError;
use crate::options::StoragePriority;

/// Maximum connections in the pool.
/// Kept low for `SQLite` since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// `SQLite` busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA: &str = r"CREATE TABLE IF NOT EXISTS cache_entries (
    resource_id      TEXT PRIMARY KEY,
    local_path       TEXT NOT NULL,
    modified_at      INTEGER NOT NULL,
    storage_priority TEXT NOT NULL,
    mirror_id        TEXT NOT NULL
)";

/// One cached resource as recorded in the index.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntry {
    /// The resource this entry maps.
    pub resource_id: String,
    /// Local path of the cached file.
    pub local_path: String,
    /// Unix seconds of the last promotion.
    pub modified_at: i64,
    /// Storage priority (stored as text, parsed via `storage_priority()`).
    #[sqlx(rename = "storage_priority")]
    pub storage_priority_str: String,
    /// The mirror the bytes came from.
    pub mirror_id: String,
}

impl CacheEntry {
    /// Builds an entry stamped with the current time.
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        local_path: &Path,
        storage_priority: StoragePriority,
        mirror_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            local_path: local_path.to_string_lossy().into_owned(),
            modified_at: unix_seconds(SystemTime::now()),
            storage_priority_str: storage_priority.as_str().to_string(),
            mirror_id: mirror_id.into(),
        }
    }

    /// The cached file's path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.local_path)
    }

    /// Returns the parsed storage priority.
    ///
    /// Falls back to `Cached` if the stored string is invalid.
    #[must_use]
    pub fn storage_priority(&self) -> StoragePriority {
        self.storage_priority_str
            .parse()
            .unwrap_or(StoragePriority::Cached)
    }
}

/// Converts a system time to unix seconds, clamping pre-epoch times to 0.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `SQLite`-backed resource-id to file mapping.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    pool: SqlitePool,
}

impl CacheIndex {
    /// Opens (creating if needed) the index at the given path.
    ///
    /// Enables WAL mode, sets a busy timeout, and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the connection or schema setup
    /// fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn new(path: &Path) -> Result<Self, DownloadError> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory index for testing.
    ///
    /// A single connection keeps the database alive for the pool's
    /// lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the connection or schema setup
    /// fails.
    pub async fn in_memory() -> Result<Self, DownloadError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Looks up the entry for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the query fails.
    pub async fn entry(&self, resource_id: &str) -> Result<Option<CacheEntry>, DownloadError> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            r"SELECT * FROM cache_entries WHERE resource_id = ?",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Inserts or replaces the entry for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the write fails.
    #[instrument(skip(self, entry), fields(resource_id = %entry.resource_id))]
    pub async fn upsert(&self, entry: &CacheEntry) -> Result<(), DownloadError> {
        sqlx::query(
            r"INSERT INTO cache_entries (resource_id, local_path, modified_at, storage_priority, mirror_id)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(resource_id) DO UPDATE SET
                local_path = excluded.local_path,
                modified_at = excluded.modified_at,
                storage_priority = excluded.storage_priority,
                mirror_id = excluded.mirror_id",
        )
        .bind(&entry.resource_id)
        .bind(&entry.local_path)
        .bind(entry.modified_at)
        .bind(&entry.storage_priority_str)
        .bind(&entry.mirror_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes the entry for a resource, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the delete fails.
    pub async fn remove(&self, resource_id: &str) -> Result<bool, DownloadError> {
        let result = sqlx::query(r"DELETE FROM cache_entries WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes every entry pointing at the given local path.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the delete fails.
    pub async fn remove_by_path(&self, path: &Path) -> Result<u64, DownloadError> {
        let result = sqlx::query(r"DELETE FROM cache_entries WHERE local_path = ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Lists all entries.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the query fails.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, DownloadError> {
        let entries = sqlx::query_as::<_, CacheEntry>(
            r"SELECT * FROM cache_entries ORDER BY resource_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}
