//! Bounded worker pool shared by every batch of a coordinator.
//!
//! # Concurrency Model
//!
//! - One semaphore holds the pool's slots; all batches draw from it
//! - Each batch has a dispatcher draining an unbounded MPSC queue in
//!   submission order
//! - Every queued task carries a sender into its own batch queue, so the queue
//!   closes exactly when the last non-terminal task is done
//! - A retry puts the task back at the tail of the queue after its backoff,
//!   releasing the slot while it waits
//! - Permit acquisition and backoff waits are raced against the batch's
//!   cancellation token
//!
//! # Deduplication
//!
//! Keys are claimed in [`InFlightKeys`] at enqueue time and released when the
//! claiming task reaches a terminal status, after the dedup store write. A
//! second task with a claimed key is skipped instead of queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::batch::BatchContext;
use crate::dedup::DedupStore;
use crate::download::{
    DownloadError, ErrorKind, HttpClient, RetryDecision, RetryPolicy, TransferDisposition,
    TransferOutcome,
};
use crate::task::{DownloadTask, SkipReason, TaskStatus};

/// Minimum allowed worker count.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
pub const MAX_WORKERS: usize = 32;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// Errors from building a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Worker count outside `MIN_WORKERS..=MAX_WORKERS`.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkers {
        /// Rejected value.
        value: usize,
    },
}

/// Dedup keys currently owned by a queued or running task.
#[derive(Debug, Default)]
pub struct InFlightKeys {
    keys: Mutex<HashSet<String>>,
}

impl InFlightKeys {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Claims `key`. Returns false if another task already holds it.
    pub fn claim(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    /// Releases `key`.
    pub fn release(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Whether `key` is held.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Number of held keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no key is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A task sitting in a batch queue, with the sender that can put it back.
pub(crate) struct QueuedTask {
    pub(crate) task: DownloadTask,
    pub(crate) requeue: mpsc::UnboundedSender<QueuedTask>,
}

#[derive(Debug)]
struct Shared {
    client: HttpClient,
    store: DedupStore,
    retry: RetryPolicy,
    in_flight: InFlightKeys,
}

/// Fixed-size pool of transfer slots.
///
/// Cheap to clone; clones share slots and the in-flight key set.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Creates a pool with `workers` slots.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidWorkers`] outside `1..=32`.
    pub fn new(
        workers: usize,
        client: HttpClient,
        store: DedupStore,
        retry: RetryPolicy,
    ) -> Result<Self, PoolError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(PoolError::InvalidWorkers { value: workers });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            shared: Arc::new(Shared {
                client,
                store,
                retry,
                in_flight: InFlightKeys::default(),
            }),
        })
    }

    /// Configured slot count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Slots not currently held by a transfer.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Keys claimed by queued or running tasks.
    #[must_use]
    pub fn in_flight(&self) -> &InFlightKeys {
        &self.shared.in_flight
    }

    /// The dedup store workers consult.
    #[must_use]
    pub fn store(&self) -> &DedupStore {
        &self.shared.store
    }

    /// The retry policy workers follow.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.retry
    }

    /// Drains `queue` until every task of the batch is terminal.
    ///
    /// The caller must have dropped its own sender; the loop ends when the
    /// last task holding one is archived.
    #[instrument(skip(self, ctx, queue), fields(batch = %ctx.id))]
    pub(crate) async fn run_batch(
        &self,
        ctx: Arc<BatchContext>,
        mut queue: mpsc::UnboundedReceiver<QueuedTask>,
    ) {
        let mut handles = Vec::new();
        info!("starting batch dispatch");

        while let Some(queued) = queue.recv().await {
            let mut task = queued.task;
            debug!(task = %task.id, url = %task.item.download_url(), "dequeued task");

            if ctx.cancel.is_cancelled() {
                self.cancel_queued(&ctx, &mut task);
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => None,
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.cancel_queued(&ctx, &mut task);
                continue;
            };

            let shared = Arc::clone(&self.shared);
            let ctx = Arc::clone(&ctx);
            let queued = QueuedTask {
                task,
                requeue: queued.requeue,
            };
            handles.push(tokio::spawn(async move {
                drive(&shared, &ctx, queued, permit).await;
            }));
        }

        debug!(task_count = handles.len(), "queue closed, joining workers");
        for handle in handles {
            // A panicking worker loses its task report but not the batch.
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }

    fn cancel_queued(&self, ctx: &BatchContext, task: &mut DownloadTask) {
        ctx.transition(task, TaskStatus::Cancelled);
        ctx.progress.discard_expected(task.id);
        finish(&self.shared, ctx, task);
    }
}

/// Archives a terminal task and releases its claim.
fn finish(shared: &Shared, ctx: &BatchContext, task: &DownloadTask) {
    ctx.archive(task);
    shared.in_flight.release(&task.dedup_key);
}

/// One slot's worth of work: dedup check, transfer, then record or retry.
#[instrument(skip_all, fields(task = %queued.task.id, url = %queued.task.item.download_url()))]
async fn drive(
    shared: &Shared,
    ctx: &BatchContext,
    queued: QueuedTask,
    permit: OwnedSemaphorePermit,
) {
    let QueuedTask { mut task, requeue } = queued;

    match shared.store.exists(&task.dedup_key).await {
        Ok(true) => {
            debug!("already recorded, skipping");
            ctx.skip(&mut task, SkipReason::AlreadyRecorded);
            ctx.progress.discard_expected(task.id);
            finish(shared, ctx, &task);
            return;
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "dedup lookup failed, treating key as new"),
    }

    if let Some(existing) = shared.client.existing_target(&task).await {
        debug!(path = %existing.display(), "target exists, skipping");
        ctx.skip(&mut task, SkipReason::TargetExists(existing));
        ctx.progress.discard_expected(task.id);
        finish(shared, ctx, &task);
        return;
    }

    ctx.transition(&mut task, TaskStatus::Running);
    task.reset_bytes();
    debug!(attempt = task.attempts(), "attempting download");

    let (result, attempt_bytes) = transfer(shared, ctx, &task).await;
    task.add_bytes(attempt_bytes);

    let error = match result {
        Ok(outcome) if outcome.disposition == TransferDisposition::SkippedExisting => {
            // The existing file is not this key's download; leave it unrecorded.
            debug!(path = %outcome.path.display(), "target exists under response name, skipping");
            ctx.progress.rewind(task.id, attempt_bytes);
            ctx.progress.discard_expected(task.id);
            task.reset_bytes();
            ctx.skip_existing_target(&mut task, outcome.path);
            finish(shared, ctx, &task);
            return;
        }
        Ok(outcome) => {
            complete(shared, ctx, &mut task, outcome).await;
            finish(shared, ctx, &task);
            return;
        }
        Err(error) => error,
    };

    ctx.progress.rewind(task.id, attempt_bytes);
    let kind = error.kind();
    task.set_error(kind, error.to_string());

    if kind == ErrorKind::Cancelled {
        ctx.transition(&mut task, TaskStatus::Cancelled);
        ctx.progress.discard_expected(task.id);
        finish(shared, ctx, &task);
        return;
    }

    ctx.transition(&mut task, TaskStatus::Failed);

    let decision = shared
        .retry
        .should_retry(kind, task.attempts(), error.retry_after());
    let delay = match decision {
        RetryDecision::Retry { delay, attempt } => {
            if !ctx.requeue(&mut task, shared.retry.max_attempts()) {
                warn!(attempts = task.attempts(), error = %error, "download failed after all attempts");
                ctx.progress.discard_expected(task.id);
                finish(shared, ctx, &task);
                return;
            }
            info!(
                attempt,
                max_attempts = shared.retry.max_attempts(),
                delay_ms = delay.as_millis(),
                error = %error,
                "retrying download"
            );
            delay
        }
        RetryDecision::GiveUp { reason } => {
            warn!(attempts = task.attempts(), %reason, error = %error, "download failed");
            ctx.progress.discard_expected(task.id);
            finish(shared, ctx, &task);
            return;
        }
    };

    // The slot is free for other tasks while this one backs off.
    drop(permit);

    let cancelled = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    };
    if cancelled {
        ctx.transition(&mut task, TaskStatus::Cancelled);
        ctx.progress.discard_expected(task.id);
        finish(shared, ctx, &task);
        return;
    }

    let tx = requeue.clone();
    if let Err(mpsc::error::SendError(mut returned)) = tx.send(QueuedTask { task, requeue }) {
        warn!("batch queue closed before retry, cancelling task");
        ctx.transition(&mut returned.task, TaskStatus::Cancelled);
        finish(shared, ctx, &returned.task);
    }
}

/// Runs the executor, feeding the batch aggregator. Returns the outcome and
/// the bytes this attempt received.
async fn transfer(
    shared: &Shared,
    ctx: &BatchContext,
    task: &DownloadTask,
) -> (Result<TransferOutcome, DownloadError>, u64) {
    let id = task.id;
    let progress = &ctx.progress;
    let mut attempt_bytes = 0u64;
    let mut expected_known = false;

    let mut on_progress = |delta: u64, total: Option<u64>| {
        if !expected_known && let Some(total) = total {
            progress.set_expected(id, total);
            expected_known = true;
        }
        attempt_bytes += delta;
        progress.update(id, delta);
    };
    let result = shared.client.execute(task, &mut on_progress).await;
    (result, attempt_bytes)
}

/// Records a successful transfer, then marks the task `Completed`.
///
/// A store failure leaves the file in place and marks the task `Failed`.
async fn complete(
    shared: &Shared,
    ctx: &BatchContext,
    task: &mut DownloadTask,
    outcome: TransferOutcome,
) {
    let recorded = shared
        .store
        .record(
            &task.dedup_key,
            task.item.download_url(),
            &outcome.path,
            outcome.bytes,
            outcome.content_hash.as_deref(),
        )
        .await;
    task.set_output(outcome.path, outcome.bytes, outcome.content_hash);

    match recorded {
        Ok(()) => {
            info!(disposition = ?outcome.disposition, "download completed");
            ctx.transition(task, TaskStatus::Completed);
        }
        Err(e) => {
            warn!(error = %e, "dedup store write failed, file left on disk");
            task.set_error(ErrorKind::Disk, format!("dedup store write failed: {e}"));
            ctx.transition(task, TaskStatus::Failed);
            ctx.progress.discard_expected(task.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn pool(workers: usize) -> Result<WorkerPool, PoolError> {
        let store = DedupStore::new(Database::new_in_memory().await.unwrap());
        WorkerPool::new(workers, HttpClient::new(), store, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_worker_count_validated() {
        assert!(matches!(
            pool(0).await,
            Err(PoolError::InvalidWorkers { value: 0 })
        ));
        assert!(matches!(
            pool(33).await,
            Err(PoolError::InvalidWorkers { value: 33 })
        ));

        let pool = pool(32).await.unwrap();
        assert_eq!(pool.workers(), 32);
        assert_eq!(pool.available_slots(), 32);
    }

    #[test]
    fn test_in_flight_claim_is_exclusive() {
        let keys = InFlightKeys::default();
        assert!(keys.claim("k"));
        assert!(!keys.claim("k"));
        assert!(keys.contains("k"));
        assert_eq!(keys.len(), 1);

        keys.release("k");
        assert!(keys.is_empty());
        assert!(keys.claim("k"));
    }

    #[test]
    fn test_in_flight_claim_under_contention() {
        let keys = Arc::new(InFlightKeys::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keys = Arc::clone(&keys);
                std::thread::spawn(move || keys.claim("same"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
