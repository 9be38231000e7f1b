//! Constants for the download module (timeouts, progress cadence).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Emit a progress callback at least every this many bytes.
pub const PROGRESS_BYTES_THRESHOLD: u64 = 256 * 1024;

/// Emit a progress callback at least this often while bytes are flowing.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix appended to in-progress files.
pub const PART_SUFFIX: &str = ".part";
