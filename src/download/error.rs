//! Error types for the download module.
//!
//! Every transfer failure is a [`DownloadError`] carrying the URL or path it
//! concerns. [`DownloadError::kind`] reduces it to the coarse [`ErrorKind`]
//! that the retry policy and batch reports work with.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::parse_retry_after;

/// Coarse failure classification shared by the executor, retry policy and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient connectivity problem, timeout, or truncated body.
    Network,
    /// Client error response other than 429.
    Http4xx,
    /// Server error response.
    Http5xx,
    /// HTTP 429 Too Many Requests.
    RateLimited,
    /// Local filesystem failure.
    Disk,
    /// The batch was cancelled while the transfer was in progress.
    Cancelled,
    /// Malformed or unsupported URL.
    Invalid,
}

impl ErrorKind {
    /// Returns the stable lowercase label used in logs and JSON reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::RateLimited => "rate_limited",
            Self::Disk => "disk",
            Self::Cancelled => "cancelled",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during a single file transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The raw Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// File system error during download (create file, write, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Received byte count does not match the server's Content-Length.
    #[error(
        "integrity check failed for {url}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// URL whose body was truncated or oversized.
        url: String,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// The batch cancellation signal fired mid-transfer.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// URL whose transfer was aborted.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Classifies this error for retry decisions and reporting.
    ///
    /// | Error | Kind |
    /// |-------|------|
    /// | Network, Timeout, Integrity | `Network` |
    /// | HTTP 429 | `RateLimited` |
    /// | other HTTP 4xx | `Http4xx` |
    /// | HTTP 5xx | `Http5xx` |
    /// | Io | `Disk` |
    /// | InvalidUrl | `Invalid` |
    /// | Cancelled | `Cancelled` |
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Integrity { .. } => {
                ErrorKind::Network
            }
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Io { .. } => ErrorKind::Disk,
            Self::InvalidUrl { .. } => ErrorKind::Invalid,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns the parsed Retry-After hint for HTTP errors that carried one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        }
    }
}

// Anything outside 4xx/5xx that still reached the error path (a 3xx the
// client refused to follow, for instance) is treated as a permanent client error.
fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Http5xx,
        _ => ErrorKind::Http4xx,
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs the url
// or path, so callers go through the constructors above.
