//! Error types for dedup store operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbErrorKind;

/// Errors returned by [`DedupStore`](super::DedupStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("dedup store database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: DbErrorKind,
        /// Database error text.
        message: String,
    },

    /// `record` was called for a file that is not on disk.
    #[error("cannot record {key}: file {path} is missing")]
    MissingFile {
        /// Dedup key being recorded.
        key: String,
        /// Path that was checked.
        path: PathBuf,
    },

    /// A record already exists for the key.
    #[error("dedup record already exists for {key}")]
    Duplicate {
        /// Conflicting key.
        key: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Creates a missing-file error.
    pub fn missing_file(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingFile {
            key: key.into(),
            path: path.into(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::MissingFile { .. } | Self::Duplicate { .. } => None,
        }
    }
}
