//! Download tasks and their status state machine.
//!
//! ```text
//! Pending ──> Running ──> Completed
//!    │           ├──────> Failed ──> Pending   (retry, attempts < max)
//!    │           ├──────> Cancelled
//!    │           └──────> Skipped   (target exists, name known from response)
//!    ├──> Skipped
//!    └──> Cancelled
//! ```
//!
//! Every status change goes through [`DownloadTask::transition`] (or
//! [`DownloadTask::requeue`] for the retry edge, and
//! [`DownloadTask::skip_existing_target`] for the late skip); anything else
//! is rejected.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::download::ErrorKind;
use crate::media::MediaItem;

/// Task identifier, unique within one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle status of a [`DownloadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Held by a worker.
    Running,
    /// Transferred and recorded.
    Completed,
    /// Not transferred; see [`SkipReason`].
    Skipped,
    /// Gave up, or waiting for a retry decision.
    Failed,
    /// Stopped by batch cancellation.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status ends the task's life.
    ///
    /// `Failed` counts as terminal; the only way out of it is
    /// [`DownloadTask::requeue`], which is not a plain transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Failed | Self::Cancelled
        )
    }

    /// Whether `self -> next` is an allowed plain transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Running | Self::Skipped | Self::Cancelled
            ) | (
                Self::Running,
                Self::Completed | Self::Failed | Self::Cancelled
            )
        )
    }

    /// Lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task was skipped without a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The dedup store already holds a record for the key.
    AlreadyRecorded,
    /// Another task in this process holds the key.
    InFlight,
    /// Excluded by batch filters.
    Filtered(String),
    /// The skip-if-exists naming policy found the target present.
    TargetExists(PathBuf),
    /// Dry run: would have been downloaded.
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRecorded => f.write_str("already downloaded"),
            Self::InFlight => f.write_str("duplicate in flight"),
            Self::Filtered(why) => write!(f, "filtered: {why}"),
            Self::TargetExists(path) => write!(f, "exists: {}", path.display()),
            Self::DryRun => f.write_str("dry run"),
        }
    }
}

/// Last failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The FSM has no edge between the two statuses.
    #[error("{task}: invalid transition {from} -> {to}")]
    Invalid {
        /// Task that attempted the transition.
        task: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// `Failed -> Pending` requested with no attempts left.
    #[error("{task}: retry budget exhausted ({attempts}/{max_attempts})")]
    RetriesExhausted {
        /// Task that attempted the retry.
        task: TaskId,
        /// Attempts made so far.
        attempts: u32,
        /// Policy limit.
        max_attempts: u32,
    },
}

/// A [`MediaItem`] bound to runtime state.
///
/// Mutated only by the worker currently holding it.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Identifier.
    pub id: TaskId,
    /// The item being downloaded.
    pub item: MediaItem,
    /// Canonical-URL dedup key.
    pub dedup_key: String,
    /// Directory the file is written into.
    pub dest_dir: PathBuf,
    /// Batch cancellation signal.
    pub cancel: CancellationToken,
    attempts: u32,
    status: TaskStatus,
    destination: Option<PathBuf>,
    bytes_transferred: u64,
    content_hash: Option<String>,
    last_error: Option<TaskFailure>,
    skip_reason: Option<SkipReason>,
}

impl DownloadTask {
    /// Creates a `Pending` task.
    #[must_use]
    pub fn new(
        id: TaskId,
        item: MediaItem,
        dedup_key: String,
        dest_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            item,
            dedup_key,
            dest_dir,
            cancel,
            attempts: 0,
            status: TaskStatus::Pending,
            destination: None,
            bytes_transferred: 0,
            content_hash: None,
            last_error: None,
            skip_reason: None,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Moves to `next` if the FSM allows it. Entering `Running` counts an attempt.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] for edges the FSM does not have.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        if next == TaskStatus::Running {
            self.attempts += 1;
        }
        self.status = next;
        Ok(())
    }

    /// `Failed -> Pending` for a retry.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] unless the task is `Failed`, and
    /// [`TransitionError::RetriesExhausted`] once `attempts >= max_attempts`.
    pub fn requeue(&mut self, max_attempts: u32) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Failed {
            return Err(TransitionError::Invalid {
                task: self.id,
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        if self.attempts >= max_attempts {
            return Err(TransitionError::RetriesExhausted {
                task: self.id,
                attempts: self.attempts,
                max_attempts,
            });
        }
        self.status = TaskStatus::Pending;
        Ok(())
    }

    /// `Pending -> Skipped` with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] unless the task is `Pending`.
    pub fn skip(&mut self, reason: SkipReason) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// `Running -> Skipped` when the skip-if-exists policy finds the target
    /// only after the response supplied its name. Nothing is recorded for it.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] unless the task is `Running`.
    pub fn skip_existing_target(&mut self, path: PathBuf) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Running {
            return Err(TransitionError::Invalid {
                task: self.id,
                from: self.status,
                to: TaskStatus::Skipped,
            });
        }
        self.status = TaskStatus::Skipped;
        self.skip_reason = Some(SkipReason::TargetExists(path));
        Ok(())
    }

    /// Records a failure without changing status.
    pub fn set_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.last_error = Some(TaskFailure {
            kind,
            message: message.into(),
        });
    }

    /// Records where the file landed and its content hash.
    pub fn set_output(&mut self, path: PathBuf, bytes: u64, content_hash: Option<String>) {
        self.destination = Some(path);
        self.bytes_transferred = bytes;
        self.content_hash = content_hash;
    }

    /// Adds to the running byte counter of the current attempt.
    pub fn add_bytes(&mut self, delta: u64) {
        self.bytes_transferred += delta;
    }

    /// Resets per-attempt byte counter before a new attempt.
    pub fn reset_bytes(&mut self) {
        self.bytes_transferred = 0;
    }

    /// Bytes transferred by the latest attempt.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Final path, once known.
    #[must_use]
    pub fn destination(&self) -> Option<&PathBuf> {
        self.destination.as_ref()
    }

    /// Last recorded failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&TaskFailure> {
        self.last_error.as_ref()
    }

    /// Skip reason, if skipped.
    #[must_use]
    pub fn skip_reason(&self) -> Option<&SkipReason> {
        self.skip_reason.as_ref()
    }

    /// Archives the task for the batch report.
    #[must_use]
    pub fn to_report(&self) -> TaskReport {
        TaskReport {
            id: self.id,
            source_url: self.item.source_url.clone(),
            download_url: self.item.download_url().to_string(),
            kind: self.item.kind,
            status: self.status,
            attempts: self.attempts,
            path: self.destination.clone(),
            bytes: self.bytes_transferred,
            content_hash: self.content_hash.clone(),
            error: self.last_error.clone(),
            skip_reason: self.skip_reason.clone(),
        }
    }
}

/// Terminal snapshot of one task, embedded in the batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Identifier.
    pub id: TaskId,
    /// Source URL of the item.
    pub source_url: String,
    /// URL that was fetched.
    pub download_url: String,
    /// Media category.
    pub kind: crate::media::MediaKind,
    /// Terminal status.
    pub status: TaskStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Written or reused file.
    pub path: Option<PathBuf>,
    /// Bytes transferred by the final attempt.
    pub bytes: u64,
    /// SHA-256 of the file, when transferred.
    pub content_hash: Option<String>,
    /// Last failure.
    pub error: Option<TaskFailure>,
    /// Why the task was skipped.
    pub skip_reason: Option<SkipReason>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(
            TaskId(1),
            MediaItem::new("https://example.com/a.jpg", "direct"),
            "key".to_string(),
            PathBuf::from("/tmp"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_happy_path_counts_attempts() {
        let mut t = task();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert_eq!(t.status(), TaskStatus::Completed);
        assert_eq!(t.attempts(), 1);
    }

    #[test]
    fn test_retry_cycle_respects_budget() {
        let mut t = task();
        for _ in 0..2 {
            t.transition(TaskStatus::Running).unwrap();
            t.transition(TaskStatus::Failed).unwrap();
            t.requeue(3).unwrap();
        }
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Failed).unwrap();

        let err = t.requeue(3).unwrap_err();
        assert!(matches!(err, TransitionError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(t.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = task();
        assert_err!(t.transition(TaskStatus::Completed));
        assert_err!(t.requeue(3));

        assert_ok!(t.transition(TaskStatus::Running));
        assert_err!(t.transition(TaskStatus::Skipped));
        assert_err!(t.transition(TaskStatus::Pending));

        assert_ok!(t.transition(TaskStatus::Cancelled));
        assert_err!(t.transition(TaskStatus::Running));
    }

    #[test]
    fn test_skip_records_reason_in_report() {
        let mut t = task();
        t.skip(SkipReason::AlreadyRecorded).unwrap();
        let report = t.to_report();
        assert_eq!(report.status, TaskStatus::Skipped);
        assert_eq!(report.skip_reason, Some(SkipReason::AlreadyRecorded));
        assert_eq!(report.attempts, 0);
    }

    #[test]
    fn test_late_target_skip_only_from_running() {
        let mut t = task();
        assert_err!(t.skip_existing_target(PathBuf::from("/tmp/a.jpg")));

        t.transition(TaskStatus::Running).unwrap();
        t.skip_existing_target(PathBuf::from("/tmp/a.jpg")).unwrap();
        let report = t.to_report();
        assert_eq!(report.status, TaskStatus::Skipped);
        assert_eq!(
            report.skip_reason,
            Some(SkipReason::TargetExists(PathBuf::from("/tmp/a.jpg")))
        );
        assert_eq!(report.path, None);
        assert_eq!(report.attempts, 1);

        assert_err!(t.skip_existing_target(PathBuf::from("/tmp/a.jpg")));
    }

    #[test]
    fn test_pending_can_be_cancelled() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        assert!(t.status().is_terminal());
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(7).to_string(), "task-7");
    }
}
