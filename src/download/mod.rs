//! Single-file HTTP transfers and the retry policy around them.
//!
//! # Features
//!
//! - Streaming downloads into `.part` files (memory-efficient for large media)
//! - SHA-256 content hashing while streaming
//! - Per-host request headers
//! - Filename derivation and configurable collision policies
//! - Structured errors reduced to an [`ErrorKind`] for retry decisions
//!
//! # Example
//!
//! ```no_run
//! use mediagrab_core::download::{ErrorKind, HttpClient, RetryPolicy};
//!
//! let client = HttpClient::new();
//! let policy = RetryPolicy::default();
//! assert!(policy.should_retry(ErrorKind::Http5xx, 1, None).is_retry());
//! ```

mod client;
mod constants;
mod error;
mod filename;
mod retry;

pub use client::{
    ClientOptions, HostHeaders, HttpClient, ProgressFn, TransferDisposition, TransferOutcome,
};
pub use constants::{CONNECT_TIMEOUT_SECS, MAX_RETRY_AFTER, READ_TIMEOUT_SECS};
pub use error::{DownloadError, ErrorKind};
pub use filename::{NameResolution, NamingPolicy, hash_file, sanitize_filename};
pub use retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_JITTER, RetryDecision, RetryPolicy, parse_retry_after,
};
