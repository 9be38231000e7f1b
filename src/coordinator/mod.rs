//! Job coordinator: media items in, one terminal [`BatchReport`] out.
//!
//! On submit the coordinator builds one [`DownloadTask`] per item, applies
//! the batch filters, consults the dedup store and the in-flight key set, and
//! queues what is left on the shared [`WorkerPool`]. Items skipped here never
//! reach the queue. The report is persisted to batch history once every task
//! is terminal.
//!
//! # Example
//!
//! ```no_run
//! use mediagrab_core::{BatchOptions, Coordinator, Database, DedupStore, EngineConfig, MediaItem};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("mediagrab.db")).await?;
//! let coordinator = Coordinator::new(DedupStore::new(db), EngineConfig::default())?;
//!
//! let items = vec![MediaItem::new("https://cdn.example.com/a.jpg", "direct")];
//! let handle = coordinator.submit(items, BatchOptions::default()).await;
//! let report = handle.wait().await?;
//! println!("completed {}", report.counts.completed);
//! # Ok(())
//! # }
//! ```

pub(crate) mod batch;

pub use batch::{
    BatchCounts, BatchHandle, BatchId, BatchOptions, BatchReport, BatchSnapshot, BatchState,
    DiscoveryFailure,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::dedup::{DedupStore, dedup_key};
use crate::download::HttpClient;
use crate::extract::{ExtractError, ExtractorRegistry};
use crate::history::{BatchEventKind, BatchHistory};
use crate::media::MediaItem;
use crate::pool::{PoolError, QueuedTask, WorkerPool};
use crate::progress::ProgressAggregator;
use crate::task::{DownloadTask, SkipReason, TaskId, TaskStatus};
use batch::{BatchContext, unix_now};

/// Errors from building a coordinator or waiting on a batch.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid engine configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker pool rejected its settings.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The batch driver stopped before producing a report.
    #[error("batch {batch} aborted: {reason}")]
    BatchAborted {
        /// Batch identifier.
        batch: String,
        /// Join failure description.
        reason: String,
    },
}

/// Accepts batches and runs them on one shared worker pool.
#[derive(Debug)]
pub struct Coordinator {
    pool: WorkerPool,
    client: HttpClient,
    history: BatchHistory,
    config: EngineConfig,
    next_task: AtomicU64,
    next_batch: AtomicU64,
}

impl Coordinator {
    /// Builds a coordinator over `store` with an immutable `config`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for out-of-range settings, `Pool` for an invalid
    /// worker count and `Client` if the HTTP client cannot be built.
    pub fn new(store: DedupStore, config: EngineConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let client = HttpClient::with_options(config.client_options())?;
        let history = BatchHistory::new(store.database().clone());
        let pool = WorkerPool::new(
            config.workers,
            client.clone(),
            store,
            config.retry_policy(),
        )?;

        Ok(Self {
            pool,
            client,
            history,
            config,
            next_task: AtomicU64::new(1),
            next_batch: AtomicU64::new(1),
        })
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The transfer client, for building extractors that share its settings.
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// The dedup store.
    #[must_use]
    pub fn store(&self) -> &DedupStore {
        self.pool.store()
    }

    /// Batch history.
    #[must_use]
    pub fn history(&self) -> &BatchHistory {
        &self.history
    }

    /// Submits `items` as one batch.
    pub async fn submit(&self, items: Vec<MediaItem>, options: BatchOptions) -> BatchHandle {
        self.submit_with_failures(items, options, Vec::new()).await
    }

    /// Runs the matching extractor for every URL, then submits what they
    /// found. Extraction failures are carried in the batch report.
    ///
    /// If the options carry a cancellation token and it fires during
    /// extraction, the remaining URLs are not extracted and the items found
    /// so far end `Cancelled`.
    pub async fn submit_urls(
        &self,
        registry: &ExtractorRegistry,
        urls: &[String],
        options: BatchOptions,
    ) -> BatchHandle {
        let (items, failures) = discover_until(registry, urls, options.cancel.as_ref()).await;
        self.submit_with_failures(items, options, failures).await
    }

    #[instrument(skip_all, fields(items = items.len(), dry_run = options.dry_run))]
    async fn submit_with_failures(
        &self,
        items: Vec<MediaItem>,
        options: BatchOptions,
        failures: Vec<DiscoveryFailure>,
    ) -> BatchHandle {
        let id = BatchId::generate(
            unix_now().as_millis(),
            self.next_batch.fetch_add(1, Ordering::Relaxed),
        );
        let ctx = Arc::new(BatchContext::new(
            id,
            items.len(),
            ProgressAggregator::new(self.config.progress_interval, self.config.speed_window),
            failures,
            options
                .cancel
                .as_ref()
                .map_or_else(CancellationToken::new, CancellationToken::child_token),
        ));
        let dest_dir = options
            .subdir
            .as_ref()
            .map_or_else(|| self.config.dest_root.clone(), |sub| self.config.dest_root.join(sub));

        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = self.pool.in_flight();
        let mut dry_run_seen = HashSet::new();
        let mut queued = 0usize;

        for item in items {
            let key = dedup_key(item.download_url());
            let mut task = DownloadTask::new(
                TaskId(self.next_task.fetch_add(1, Ordering::Relaxed)),
                item,
                key,
                dest_dir.clone(),
                ctx.cancel.clone(),
            );

            if let Some(reason) = self.skip_reason(&task, &options, &mut dry_run_seen).await {
                debug!(task = %task.id, %reason, "skipping at submit");
                ctx.skip(&mut task, reason);
                ctx.archive(&task);
                continue;
            }

            if let Some(size) = task.item.expected_size {
                ctx.progress.set_expected(task.id, size);
            }
            let requeue = tx.clone();
            if let Err(mpsc::error::SendError(mut returned)) = tx.send(QueuedTask { task, requeue }) {
                warn!("batch queue closed during submit");
                in_flight.release(&returned.task.dedup_key);
                ctx.transition(&mut returned.task, TaskStatus::Cancelled);
                ctx.archive(&returned.task);
                continue;
            }
            queued += 1;
        }
        drop(tx);

        let counts = ctx.state.counts();
        info!(
            batch = %ctx.id,
            total = counts.total,
            queued,
            skipped = counts.skipped,
            "batch submitted"
        );

        let submitted = json!({
            "total": counts.total,
            "queued": queued,
            "skipped": counts.skipped,
            "dry_run": options.dry_run,
        });
        let pool = self.pool.clone();
        let history = self.history.clone();
        let driver_ctx = Arc::clone(&ctx);
        let join = tokio::spawn(async move {
            let batch = &driver_ctx.id.0;
            if let Err(e) = history
                .append_event(batch, BatchEventKind::Submitted, &submitted)
                .await
            {
                warn!(batch = %batch, error = %e, "failed to record submission event");
            }
            pool.run_batch(Arc::clone(&driver_ctx), rx).await;
            let report = driver_ctx.report();
            // Best-effort: a history failure does not change the outcome.
            if let Err(e) = history.record(&report).await {
                warn!(batch = %report.batch_id, error = %e, "failed to persist batch report");
            }
            report
        });

        BatchHandle::new(ctx, join)
    }

    /// Decides submit-time skips. Claims the key for tasks that will be queued.
    async fn skip_reason(
        &self,
        task: &DownloadTask,
        options: &BatchOptions,
        dry_run_seen: &mut HashSet<String>,
    ) -> Option<SkipReason> {
        if let Some(why) = options.exclusion(&task.item) {
            return Some(SkipReason::Filtered(why));
        }

        match self.store().exists(&task.dedup_key).await {
            Ok(true) => return Some(SkipReason::AlreadyRecorded),
            Ok(false) => {}
            Err(e) => warn!(task = %task.id, error = %e, "dedup lookup failed, treating key as new"),
        }

        let in_flight = self.pool.in_flight();
        if options.dry_run {
            let duplicate =
                in_flight.contains(&task.dedup_key) || !dry_run_seen.insert(task.dedup_key.clone());
            return Some(if duplicate {
                SkipReason::InFlight
            } else {
                SkipReason::DryRun
            });
        }

        if in_flight.claim(&task.dedup_key) {
            None
        } else {
            Some(SkipReason::InFlight)
        }
    }
}

/// Runs the matching extractor for each URL.
///
/// Items without a resolved URL go through the extractor's resolve step.
/// Every URL that yields an error is reported once; items found before the
/// error are kept.
#[instrument(skip_all, fields(urls = urls.len()))]
pub async fn discover(
    registry: &ExtractorRegistry,
    urls: &[String],
) -> (Vec<MediaItem>, Vec<DiscoveryFailure>) {
    discover_until(registry, urls, None).await
}

/// [`discover`] that stops early once `cancel` fires.
async fn discover_until(
    registry: &ExtractorRegistry,
    urls: &[String],
    cancel: Option<&CancellationToken>,
) -> (Vec<MediaItem>, Vec<DiscoveryFailure>) {
    let mut items = Vec::new();
    let mut failures = Vec::new();
    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);

    for url in urls {
        if cancel.is_cancelled() {
            info!(found = items.len(), "extraction interrupted");
            break;
        }
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        let Some(extractor) = registry.find(url) else {
            let error = ExtractError::unsupported(url);
            warn!(url, error = %error, "no extractor for URL");
            failures.push(failure(url, None, &error));
            continue;
        };

        let mut stream = extractor.extract(url);
        let mut found = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(next) = next else { break };
            let resolved = match next {
                Ok(item) if item.resolved_url.is_none() => extractor.resolve(item).await,
                other => other,
            };
            match resolved {
                Ok(item) => {
                    found += 1;
                    items.push(item);
                }
                Err(error) => {
                    warn!(url, extractor = extractor.name(), error = %error, "extraction failed");
                    failures.push(failure(url, Some(extractor.name()), &error));
                    break;
                }
            }
        }
        debug!(url, extractor = extractor.name(), found, "extraction finished");
    }

    (items, failures)
}

fn failure(url: &str, extractor: Option<&str>, error: &ExtractError) -> DiscoveryFailure {
    DiscoveryFailure {
        url: url.to_string(),
        extractor: extractor.map(str::to_string),
        kind: error.kind().to_string(),
        message: error.to_string(),
    }
}
