//! Persistent record of completed downloads.
//!
//! The store answers one question for the worker pool: has this dedup key
//! already been downloaded successfully? Keys come from [`dedup_key`], which
//! hashes the canonicalized resolved URL. Reads go straight to the pool;
//! inserts and deletes are serialized behind a single async lock.
//!
//! # Example
//!
//! ```no_run
//! use mediagrab_core::{Database, DedupStore, dedup_key};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("mediagrab.db")).await?;
//! let store = DedupStore::new(db);
//! let key = dedup_key("https://cdn.example.com/a.jpg");
//! if !store.exists(&key).await? {
//!     // download, then:
//!     store
//!         .record(&key, "https://cdn.example.com/a.jpg", Path::new("a.jpg"), 1024, None)
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod key;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::{FromRow, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::db::{Database, DbErrorKind};

pub use error::StoreError;
pub use key::{canonicalize_url, dedup_key, hex_encode};

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    /// Dedup key (hex SHA-256 of the canonical URL).
    pub key: String,
    /// Resolved URL that was fetched.
    pub url: String,
    /// Where the file was written.
    pub path: PathBuf,
    /// Completion time, `SQLite` `datetime('now')` format (UTC).
    pub completed_at: String,
    /// File size in bytes.
    pub size: u64,
    /// SHA-256 of the content, when computed.
    pub content_hash: Option<String>,
}

#[derive(FromRow)]
struct DedupRow {
    dedup_key: String,
    url: String,
    path: String,
    size_bytes: i64,
    content_hash: Option<String>,
    completed_at: String,
}

impl From<DedupRow> for DedupRecord {
    fn from(row: DedupRow) -> Self {
        Self {
            key: row.dedup_key,
            url: row.url,
            path: PathBuf::from(row.path),
            completed_at: row.completed_at,
            size: u64::try_from(row.size_bytes).unwrap_or(0),
            content_hash: row.content_hash,
        }
    }
}

/// SQLite-backed dedup store.
///
/// Cheap to clone; clones share the pool and the write lock.
#[derive(Debug, Clone)]
pub struct DedupStore {
    db: Database,
    write_lock: Arc<Mutex<()>>,
}

impl DedupStore {
    /// Builds a store over an opened (and migrated) database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Whether a completed download is recorded for `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(r"SELECT 1 FROM dedup_records WHERE dedup_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Fetches the record for `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<DedupRecord>, StoreError> {
        let row = sqlx::query_as::<_, DedupRow>(
            r"SELECT dedup_key, url, path, size_bytes, content_hash, completed_at
              FROM dedup_records WHERE dedup_key = ?",
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(DedupRecord::from))
    }

    /// Records a completed download.
    ///
    /// The file must exist at `path`.
    ///
    /// # Errors
    ///
    /// - `StoreError::MissingFile` if `path` is not a file on disk
    /// - `StoreError::Duplicate` if `key` is already recorded
    /// - `StoreError::Database` on any other write failure
    #[instrument(skip(self, url, path, content_hash), fields(path = %path.display()))]
    pub async fn record(
        &self,
        key: &str,
        url: &str,
        path: &Path,
        size: u64,
        content_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(StoreError::missing_file(key, path));
        }

        let size_bytes = i64::try_from(size).unwrap_or(i64::MAX);

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r"INSERT INTO dedup_records (dedup_key, url, path, size_bytes, content_hash)
              VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(url)
        .bind(path.to_string_lossy().as_ref())
        .bind(size_bytes)
        .bind(content_hash)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => {
                debug!(size, "recorded completed download");
                Ok(())
            }
            Err(err) if DbErrorKind::from_sqlx(&err) == DbErrorKind::ConstraintViolation => {
                Err(StoreError::Duplicate {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the record for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the delete fails.
    #[instrument(skip(self))]
    pub async fn forget(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(r"DELETE FROM dedup_records WHERE dedup_key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the record for the dedup key derived from `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the delete fails.
    pub async fn forget_url(&self, url: &str) -> Result<bool, StoreError> {
        self.forget(&dedup_key(url)).await
    }

    /// Number of recorded downloads.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM dedup_records")
            .fetch_one(self.db.pool())
            .await?;
        let count: i64 = row.get("count");
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Deletes every record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(r"DELETE FROM dedup_records")
            .execute(self.db.pool())
            .await?;
        debug!(removed = result.rows_affected(), "cleared dedup records");
        Ok(result.rows_affected())
    }
}
