//! HTTP transfer executor.
//!
//! [`HttpClient::execute`] performs one file transfer for a
//! [`DownloadTask`]: it streams the body into a `.part` file next to the
//! destination, hashes it on the way, checks the byte count against
//! Content-Length, and only then moves the file to the name chosen by the
//! configured [`NamingPolicy`]. The temporary file is removed on every
//! failure path, including cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER,
};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, PART_SUFFIX, PROGRESS_BYTES_THRESHOLD, PROGRESS_INTERVAL,
    READ_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::filename::{
    NameResolution, NamingPolicy, filename_from_url, parse_content_disposition,
    sanitize_filename, timestamp_filename,
};
use crate::dedup::hex_encode;
use crate::task::DownloadTask;
use crate::user_agent;

/// Progress callback: `(bytes_delta, total_bytes_if_known)`.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + Send + 'a;

/// Per-host request headers, keyed by lowercase host name.
pub type HostHeaders = HashMap<String, Vec<(String, String)>>;

/// Construction options for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Maximum idle time between body reads.
    pub read_timeout: Duration,
    /// Extra request headers applied when the URL's host matches.
    pub host_headers: HostHeaders,
    /// How filename collisions are resolved.
    pub naming: NamingPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            host_headers: HostHeaders::new(),
            naming: NamingPolicy::default(),
        }
    }
}

/// How a successful [`HttpClient::execute`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDisposition {
    /// New file written at `path`.
    Written,
    /// Identical content already existed at `path`; the new copy was discarded.
    ReusedExisting,
    /// Skip-if-exists policy found `path` present; nothing was written.
    SkippedExisting,
}

/// Result of one transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Final file path.
    pub path: PathBuf,
    /// Bytes received from the server.
    pub bytes: u64,
    /// SHA-256 of the received body, lowercase hex.
    pub content_hash: Option<String>,
    /// What happened to the file.
    pub disposition: TransferDisposition,
}

impl TransferOutcome {
    fn skipped(path: PathBuf) -> Self {
        Self {
            path,
            bytes: 0,
            content_hash: None,
            disposition: TransferDisposition::SkippedExisting,
        }
    }
}

/// HTTP client for streaming transfers.
///
/// Create once and share; clones reuse the connection pool and the
/// finalize lock that keeps two transfers from claiming the same filename.
///
/// # Example
///
/// ```no_run
/// use mediagrab_core::download::HttpClient;
///
/// let client = HttpClient::new();
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    host_headers: Arc<HashMap<String, HeaderMap>>,
    naming: NamingPolicy,
    finalize_lock: Arc<Mutex<()>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts and the sequential-suffix policy.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static default
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client from explicit options.
    ///
    /// Header entries whose name or value is not valid HTTP are dropped with
    /// a warning.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` builder error (e.g. TLS backend init failure).
    pub fn with_options(options: ClientOptions) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_download_user_agent())
            .build()?;

        let host_headers = options
            .host_headers
            .iter()
            .map(|(host, pairs)| (host.to_ascii_lowercase(), build_header_map(host, pairs)))
            .collect();

        Ok(Self {
            client,
            host_headers: Arc::new(host_headers),
            naming: options.naming,
            finalize_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Naming policy in effect.
    #[must_use]
    pub fn naming_policy(&self) -> NamingPolicy {
        self.naming
    }

    /// GET request for `url` carrying the headers configured for its host.
    #[must_use]
    pub fn get(&self, url: &Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url.clone());
        match url
            .host_str()
            .and_then(|host| self.host_headers.get(&host.to_ascii_lowercase()))
        {
            Some(headers) => request.headers(headers.clone()),
            None => request,
        }
    }

    /// File the skip-if-exists policy would keep for `task`, when the target
    /// name is known without a request.
    pub async fn existing_target(&self, task: &DownloadTask) -> Option<PathBuf> {
        let parsed = Url::parse(task.item.download_url()).ok()?;
        let name = known_filename(task, &parsed)?;
        self.naming.existing_to_skip(&task.dest_dir, &name).await
    }

    /// Transfers `task`'s download URL into `task.dest_dir`.
    ///
    /// `on_progress` receives byte deltas at most every 256 KiB or 250 ms,
    /// plus one final flush.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` for unparseable or non-HTTP(S) URLs
    /// - `Network` / `Timeout` for connectivity failures
    /// - `HttpStatus` for non-success responses (Retry-After captured)
    /// - `Integrity` when the body length differs from Content-Length
    /// - `Io` for filesystem failures
    /// - `Cancelled` when `task.cancel` fires mid-transfer
    #[instrument(skip(self, task, on_progress), fields(task = %task.id, url = %task.item.download_url()))]
    pub async fn execute(
        &self,
        task: &DownloadTask,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<TransferOutcome, DownloadError> {
        let url = task.item.download_url();
        let cancel = &task.cancel;
        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(url));
        }

        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let dir = task.dest_dir.as_path();
        let known_name = known_filename(task, &parsed);

        if let Some(name) = known_name.as_deref()
            && let Some(existing) = self.naming.existing_to_skip(dir, name).await
        {
            debug!(path = %existing.display(), "target exists, skipping before request");
            return Ok(TransferOutcome::skipped(existing));
        }

        let response = self.send(&parsed, url, cancel).await?;
        let total = response.content_length();
        let filename = known_name.unwrap_or_else(|| response_filename(&response));

        if let Some(existing) = self.naming.existing_to_skip(dir, &filename).await {
            debug!(path = %existing.display(), "target exists, skipping before body");
            return Ok(TransferOutcome::skipped(existing));
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DownloadError::io(dir, e))?;

        let part_path = dir.join(format!("{filename}.{}{PART_SUFFIX}", task.id.0));
        let streamed = stream_to_part(response, url, &part_path, total, cancel, on_progress).await;
        let (bytes, hash) = match streamed {
            Ok(done) => done,
            Err(err) => {
                debug!(path = %part_path.display(), "removing partial file after error");
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(err);
            }
        };

        if let Some(expected) = total
            && expected != bytes
        {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(DownloadError::integrity(url, expected, bytes));
        }

        let outcome = self.finalize(dir, &filename, &part_path, bytes, hash).await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        outcome
    }

    async fn send(
        &self,
        parsed: &Url,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DownloadError> {
        let request = self.get(parsed);
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            sent = request.send() => sent.map_err(|e| map_reqwest_error(url, e))?,
        };

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }

    /// Moves the verified `.part` file into place according to the naming policy.
    async fn finalize(
        &self,
        dir: &Path,
        filename: &str,
        part_path: &Path,
        bytes: u64,
        hash: String,
    ) -> Result<TransferOutcome, DownloadError> {
        let _guard = self.finalize_lock.lock().await;

        let resolution = self
            .naming
            .resolve(dir, filename, Some(&hash))
            .await
            .map_err(|e| DownloadError::io(dir.join(filename), e))?;

        let (path, disposition) = match resolution {
            NameResolution::Write(path) => {
                tokio::fs::rename(part_path, &path)
                    .await
                    .map_err(|e| DownloadError::io(path.clone(), e))?;
                (path, TransferDisposition::Written)
            }
            NameResolution::ReuseExisting(path) => {
                tokio::fs::remove_file(part_path)
                    .await
                    .map_err(|e| DownloadError::io(part_path, e))?;
                (path, TransferDisposition::ReusedExisting)
            }
            NameResolution::SkipExisting(path) => {
                tokio::fs::remove_file(part_path)
                    .await
                    .map_err(|e| DownloadError::io(part_path, e))?;
                (path, TransferDisposition::SkippedExisting)
            }
        };

        info!(path = %path.display(), bytes, ?disposition, "transfer complete");

        Ok(TransferOutcome {
            path,
            bytes,
            content_hash: Some(hash),
            disposition,
        })
    }
}

/// Suggested filename if usable, else the URL's last path segment.
fn known_filename(task: &DownloadTask, parsed: &Url) -> Option<String> {
    task.item
        .suggested_filename
        .as_deref()
        .map(sanitize_filename)
        .filter(|name| !name.trim_matches('_').is_empty())
        .or_else(|| filename_from_url(parsed))
}

/// Streams the body into `part_path`, returning bytes written and hex SHA-256.
async fn stream_to_part(
    response: reqwest::Response,
    url: &str,
    part_path: &Path,
    total: Option<u64>,
    cancel: &CancellationToken,
    on_progress: &mut ProgressFn<'_>,
) -> Result<(u64, String), DownloadError> {
    let file = File::create(part_path)
        .await
        .map_err(|e| DownloadError::io(part_path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;
    let mut pending: u64 = 0;
    let mut last_emit = Instant::now();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            next = stream.next() => next,
        };
        let Some(chunk_result) = next else { break };
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(part_path, e))?;
        hasher.update(&chunk);

        let len = chunk.len() as u64;
        bytes_written += len;
        pending += len;
        if pending >= PROGRESS_BYTES_THRESHOLD || last_emit.elapsed() >= PROGRESS_INTERVAL {
            on_progress(pending, total);
            pending = 0;
            last_emit = Instant::now();
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(part_path, e))?;

    if pending > 0 {
        on_progress(pending, total);
    }

    Ok((bytes_written, hex_encode(&hasher.finalize())))
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Filename from Content-Disposition, else `download_<timestamp><ext>`.
fn response_filename(response: &reqwest::Response) -> String {
    if let Some(name) = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|cd| cd.to_str().ok())
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.trim_matches('_').is_empty())
    {
        return name;
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok());
    timestamp_filename(content_type)
}

fn build_header_map(host: &str, pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(host, header = %name, "ignoring invalid request header"),
        }
    }
    map
}
