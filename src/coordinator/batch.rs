//! Per-batch state: options, status counters, reports and the caller's handle.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CoordinatorError;
use crate::media::{MediaItem, MediaKind};
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::task::{DownloadTask, SkipReason, TaskReport, TaskStatus};

/// Batch identifier, unique across runs sharing one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub(crate) fn generate(started_at_millis: u128, seq: u64) -> Self {
        Self(format!("{started_at_millis:x}-{seq}"))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Submission-time options for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Media kinds to keep. Empty keeps everything.
    pub kinds: HashSet<MediaKind>,
    /// Minimum expected size in bytes; 0 means unbounded.
    pub min_size: u64,
    /// Maximum expected size in bytes; 0 means unbounded.
    pub max_size: u64,
    /// Earliest publication date kept, `YYYY-MM-DD`.
    pub date_from: Option<String>,
    /// Latest publication date kept, `YYYY-MM-DD`.
    pub date_to: Option<String>,
    /// Subdirectory under the destination root.
    pub subdir: Option<PathBuf>,
    /// Decide skips and filters without transferring anything.
    pub dry_run: bool,
    /// Outer signal; cancelling it cancels discovery and the batch.
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    /// Restricts the batch to `kinds`.
    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = MediaKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Sets size bounds (0 = unbounded).
    #[must_use]
    pub fn with_size_bounds(mut self, min_size: u64, max_size: u64) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Keeps items published within `from..=to` (inclusive, `YYYY-MM-DD`).
    #[must_use]
    pub fn with_date_range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    /// Writes into `subdir` below the destination root.
    #[must_use]
    pub fn with_subdir(mut self, subdir: impl Into<PathBuf>) -> Self {
        self.subdir = Some(subdir.into());
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Ties the batch to `token`. The batch gets a child token, so
    /// [`BatchHandle::cancel`] stays local to it.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Why `item` is excluded, or `None` if it passes.
    ///
    /// Size and date bounds only apply when the item carries that metadata.
    #[must_use]
    pub fn exclusion(&self, item: &MediaItem) -> Option<String> {
        if !self.kinds.is_empty() && !self.kinds.contains(&item.kind) {
            return Some(format!("kind {} not selected", item.kind));
        }
        if let Some(reason) = self.date_exclusion(item) {
            return Some(reason);
        }
        let size = item.expected_size?;
        if self.min_size > 0 && size < self.min_size {
            return Some(format!("{size} bytes below minimum {}", self.min_size));
        }
        if self.max_size > 0 && size > self.max_size {
            return Some(format!("{size} bytes above maximum {}", self.max_size));
        }
        None
    }

    fn date_exclusion(&self, item: &MediaItem) -> Option<String> {
        // ISO dates compare correctly as strings; time suffixes are ignored.
        let published = item.published.as_deref()?.get(..10)?;
        if let Some(from) = self.date_from.as_deref()
            && published < from
        {
            return Some(format!("published {published} before {from}"));
        }
        if let Some(to) = self.date_to.as_deref()
            && published > to
        {
            return Some(format!("published {published} after {to}"));
        }
        None
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// Tasks in the batch.
    pub total: usize,
    /// Waiting in the queue (or for a retry).
    pub pending: usize,
    /// Held by a worker.
    pub running: usize,
    /// Transferred and recorded.
    pub completed: usize,
    /// Not transferred.
    pub skipped: usize,
    /// Gave up.
    pub failed: usize,
    /// Stopped by cancellation.
    pub cancelled: usize,
}

impl BatchCounts {
    /// Tasks in a terminal status.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.completed + self.skipped + self.failed + self.cancelled
    }
}

/// Lock-free status counters for one batch.
#[derive(Debug, Default)]
pub struct BatchState {
    total: AtomicUsize,
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl BatchState {
    /// State with `total` tasks, all pending.
    #[must_use]
    pub fn new(total: usize) -> Self {
        let state = Self::default();
        state.total.store(total, Ordering::Relaxed);
        state.pending.store(total, Ordering::Relaxed);
        state
    }

    fn counter(&self, status: TaskStatus) -> &AtomicUsize {
        match status {
            TaskStatus::Pending => &self.pending,
            TaskStatus::Running => &self.running,
            TaskStatus::Completed => &self.completed,
            TaskStatus::Skipped => &self.skipped,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Cancelled => &self.cancelled,
        }
    }

    /// Moves one task's count from `from` to `to`.
    pub fn moved(&self, from: TaskStatus, to: TaskStatus) {
        self.counter(to).fetch_add(1, Ordering::AcqRel);
        self.counter(from).fetch_sub(1, Ordering::AcqRel);
    }

    /// Current counts. Individual counters are read one by one, so a count
    /// taken mid-transition may be off by one for a moment.
    #[must_use]
    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            total: self.total.load(Ordering::Acquire),
            pending: self.pending.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
        }
    }
}

/// Batch state plus byte progress, as seen by a presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSnapshot {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Task counts by status.
    pub counts: BatchCounts,
    /// Bytes, speed and ETA.
    pub progress: ProgressSnapshot,
}

impl BatchSnapshot {
    /// Tasks in a terminal status.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.counts.finished()
    }

    /// Tasks in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.total
    }
}

/// A user URL that produced no media items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    /// URL given by the user.
    pub url: String,
    /// Extractor that handled it, if any matched.
    pub extractor: Option<String>,
    /// `unsupported_url`, `page_fetch` or `parse`.
    pub kind: String,
    /// Error text.
    pub message: String,
}

/// Terminal report of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Unix time the batch was submitted.
    pub started_at_unix: u64,
    /// Wall time from submission to the last terminal task.
    pub elapsed: Duration,
    /// Final counts.
    pub counts: BatchCounts,
    /// Bytes received by the attempts that counted.
    pub bytes_transferred: u64,
    /// Whether `cancel()` was called.
    pub was_cancelled: bool,
    /// One entry per task, ordered by task id.
    pub tasks: Vec<TaskReport>,
    /// URLs that failed extraction.
    pub discovery_failures: Vec<DiscoveryFailure>,
}

impl BatchReport {
    /// Whether any task failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }
}

/// Shared runtime state of one batch.
#[derive(Debug)]
pub(crate) struct BatchContext {
    pub(crate) id: BatchId,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: BatchState,
    pub(crate) progress: ProgressAggregator,
    reports: Mutex<Vec<TaskReport>>,
    discovery_failures: Vec<DiscoveryFailure>,
    started: Instant,
    started_at_unix: u64,
}

impl BatchContext {
    pub(crate) fn new(
        id: BatchId,
        total: usize,
        progress: ProgressAggregator,
        discovery_failures: Vec<DiscoveryFailure>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            cancel,
            state: BatchState::new(total),
            progress,
            reports: Mutex::new(Vec::with_capacity(total)),
            discovery_failures,
            started: Instant::now(),
            started_at_unix: unix_now().as_secs(),
        }
    }

    /// Applies a status change to `task` and the counters together.
    pub(crate) fn transition(&self, task: &mut DownloadTask, next: TaskStatus) {
        let from = task.status();
        match task.transition(next) {
            Ok(()) => self.state.moved(from, next),
            Err(e) => warn!(batch = %self.id, error = %e, "rejected task transition"),
        }
    }

    pub(crate) fn skip(&self, task: &mut DownloadTask, reason: SkipReason) {
        let from = task.status();
        match task.skip(reason) {
            Ok(()) => self.state.moved(from, TaskStatus::Skipped),
            Err(e) => warn!(batch = %self.id, error = %e, "rejected task skip"),
        }
    }

    pub(crate) fn skip_existing_target(&self, task: &mut DownloadTask, path: PathBuf) {
        match task.skip_existing_target(path) {
            Ok(()) => self.state.moved(TaskStatus::Running, TaskStatus::Skipped),
            Err(e) => warn!(batch = %self.id, error = %e, "rejected late target skip"),
        }
    }

    /// `Failed -> Pending`. Returns false once the retry budget is spent.
    pub(crate) fn requeue(&self, task: &mut DownloadTask, max_attempts: u32) -> bool {
        match task.requeue(max_attempts) {
            Ok(()) => {
                self.state.moved(TaskStatus::Failed, TaskStatus::Pending);
                true
            }
            Err(_) => false,
        }
    }

    /// Files the terminal task in the report.
    pub(crate) fn archive(&self, task: &DownloadTask) {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task.to_report());
    }

    pub(crate) fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.id.clone(),
            counts: self.state.counts(),
            progress: self.progress.snapshot(),
        }
    }

    pub(crate) fn report(&self) -> BatchReport {
        let mut tasks = std::mem::take(
            &mut *self
                .reports
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        tasks.sort_by_key(|t| t.id);
        let counts = self.state.counts();
        let progress = self.progress.snapshot_now();

        info!(
            batch = %self.id,
            completed = counts.completed,
            skipped = counts.skipped,
            failed = counts.failed,
            cancelled = counts.cancelled,
            bytes = progress.bytes_done,
            "batch finished"
        );

        BatchReport {
            batch_id: self.id.clone(),
            started_at_unix: self.started_at_unix,
            elapsed: self.started.elapsed(),
            counts,
            bytes_transferred: progress.bytes_done,
            was_cancelled: self.cancel.is_cancelled(),
            tasks,
            discovery_failures: self.discovery_failures.clone(),
        }
    }
}

pub(crate) fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Caller's handle on a submitted batch.
#[derive(Debug)]
pub struct BatchHandle {
    ctx: std::sync::Arc<BatchContext>,
    join: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub(crate) fn new(ctx: std::sync::Arc<BatchContext>, join: JoinHandle<BatchReport>) -> Self {
        Self { ctx, join }
    }

    /// Batch identifier.
    #[must_use]
    pub fn id(&self) -> &BatchId {
        &self.ctx.id
    }

    /// Cancels the batch: queued tasks end `Cancelled`, running transfers
    /// abort at their next chunk.
    pub fn cancel(&self) {
        info!(batch = %self.ctx.id, "cancelling batch");
        self.ctx.cancel.cancel();
    }

    /// The batch's cancellation token, for wiring to signal handlers.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Current counts and progress (throttled).
    #[must_use]
    pub fn progress(&self) -> BatchSnapshot {
        self.ctx.snapshot()
    }

    /// Whether every task has reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the terminal report.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::BatchAborted`] if the batch driver panicked.
    pub async fn wait(self) -> Result<BatchReport, CoordinatorError> {
        self.join
            .await
            .map_err(|e| CoordinatorError::BatchAborted {
                batch: self.ctx.id.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_by_kind_and_size() {
        let options = BatchOptions::default()
            .with_kinds([MediaKind::Image])
            .with_size_bounds(10, 100);

        let image = MediaItem::new("https://example.com/a.jpg", "direct");
        assert_eq!(options.exclusion(&image), None, "unknown size passes");
        assert!(options.exclusion(&image.clone().with_expected_size(5)).is_some());
        assert!(options.exclusion(&image.clone().with_expected_size(500)).is_some());
        assert_eq!(options.exclusion(&image.with_expected_size(50)), None);

        let video = MediaItem::new("https://example.com/a.mp4", "direct");
        let reason = options.exclusion(&video).unwrap();
        assert!(reason.contains("video"), "{reason}");
    }

    #[test]
    fn test_exclusion_by_publication_date() {
        let options = BatchOptions::default()
            .with_date_range(Some("2024-01-01".to_string()), Some("2024-06-30".to_string()));
        let item = MediaItem::new("https://example.com/a.jpg", "direct");

        assert_eq!(options.exclusion(&item), None, "undated items pass");
        assert_eq!(
            options.exclusion(&item.clone().with_published("2024-03-05T10:00:00Z")),
            None
        );
        assert!(options.exclusion(&item.clone().with_published("2023-12-31")).is_some());
        assert!(options.exclusion(&item.with_published("2024-07-01")).is_some());
    }

    #[test]
    fn test_zero_bounds_are_unbounded() {
        let options = BatchOptions::default();
        let item = MediaItem::new("https://example.com/a.zip", "direct")
            .with_expected_size(u64::MAX);
        assert_eq!(options.exclusion(&item), None);
    }

    #[test]
    fn test_state_moves_counts() {
        let state = BatchState::new(3);
        state.moved(TaskStatus::Pending, TaskStatus::Running);
        state.moved(TaskStatus::Running, TaskStatus::Completed);
        state.moved(TaskStatus::Pending, TaskStatus::Skipped);

        let counts = state.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.finished(), 2);
    }

    #[test]
    fn test_report_orders_tasks_by_id() {
        let ctx = BatchContext::new(
            BatchId::generate(1, 1),
            2,
            ProgressAggregator::default(),
            Vec::new(),
            CancellationToken::new(),
        );
        for id in [2, 1] {
            let mut task = DownloadTask::new(
                crate::task::TaskId(id),
                MediaItem::new("https://example.com/a.jpg", "direct"),
                "k".to_string(),
                PathBuf::from("/tmp"),
                ctx.cancel.clone(),
            );
            ctx.skip(&mut task, SkipReason::DryRun);
            ctx.archive(&task);
        }

        let report = ctx.report();
        let ids: Vec<u64> = report.tasks.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(report.counts.skipped, 2);
        assert!(!report.was_cancelled);
    }

    #[test]
    fn test_batch_id_display() {
        assert_eq!(BatchId::generate(255, 3).to_string(), "ff-3");
    }
}
