//! Persisted fetch jobs that run once, daily, weekly or every N minutes.
//!
//! [`JobScheduler`] stores [`ScheduledJob`]s in the `scheduled_jobs` table and
//! hands due jobs to a [`Coordinator`] as ordinary batches. Times are unix
//! seconds (UTC). A `once` job is disabled after it runs; recurring jobs move
//! their next run forward by whole periods until it lies in the future, so a
//! scheduler that was down for a while runs each job once, not once per
//! missed period.
//!
//! Changes are announced on a broadcast channel ([`JobScheduler::subscribe`]).
//!
//! # Example
//!
//! ```no_run
//! use mediagrab_core::schedule::{JobScheduler, ScheduledJob};
//! use mediagrab_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("mediagrab.db")).await?;
//! let scheduler = JobScheduler::new(db);
//! let job = ScheduledJob::daily("gallery", vec!["https://example.com/g".into()], 1_700_000_000);
//! scheduler.schedule(&job).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{BatchOptions, BatchReport, Coordinator};
use crate::db::{Database, DbErrorKind};
use crate::extract::ExtractorRegistry;

const DAY_SECS: i64 = 24 * 60 * 60;
const WEEK_SECS: i64 = 7 * DAY_SECS;
const EVENT_CAPACITY: usize = 64;

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Query or write failed.
    #[error("scheduler database error ({kind}): {message}")]
    Database {
        /// Classified failure.
        kind: DbErrorKind,
        /// Driver message.
        message: String,
    },

    /// A job with this id is already stored.
    #[error("a job named {id} already exists")]
    Duplicate {
        /// Conflicting id.
        id: String,
    },

    /// The job cannot run as described.
    #[error("invalid job {id}: {reason}")]
    Invalid {
        /// Job id.
        id: String,
        /// What is wrong.
        reason: String,
    },

    /// A stored row could not be read back.
    #[error("stored job {id} is unreadable: {reason}")]
    Corrupt {
        /// Job id.
        id: String,
        /// What failed to parse.
        reason: String,
    },
}

impl From<sqlx::Error> for ScheduleError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&error),
            message: error.to_string(),
        }
    }
}

/// How often a job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Runs a single time.
    Once,
    /// Every 24 hours.
    Daily,
    /// Every 7 days.
    Weekly,
    /// Every `interval_minutes`.
    Interval,
}

impl ScheduleKind {
    /// Lowercase label stored in the `kind` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Interval => "interval",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "interval" => Ok(Self::Interval),
            other => Err(format!("unknown schedule kind '{other}'")),
        }
    }
}

/// A stored fetch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    /// Unique id.
    pub id: String,
    /// URLs handed to the extractors on each run.
    pub urls: Vec<String>,
    /// Repeat rule.
    pub kind: ScheduleKind,
    /// Period for [`ScheduleKind::Interval`].
    pub interval_minutes: Option<u32>,
    /// Next run, unix seconds.
    pub next_run_at: i64,
    /// Disabled jobs are kept but never due.
    pub enabled: bool,
    /// Last run, unix seconds.
    pub last_run_at: Option<i64>,
    /// Batch id of the last run.
    pub last_batch_id: Option<String>,
}

impl ScheduledJob {
    fn new(id: impl Into<String>, urls: Vec<String>, kind: ScheduleKind, at: i64) -> Self {
        Self {
            id: id.into(),
            urls,
            kind,
            interval_minutes: None,
            next_run_at: at,
            enabled: true,
            last_run_at: None,
            last_batch_id: None,
        }
    }

    /// Runs once at `at`.
    #[must_use]
    pub fn once(id: impl Into<String>, urls: Vec<String>, at: i64) -> Self {
        Self::new(id, urls, ScheduleKind::Once, at)
    }

    /// Runs at `first` and every day after.
    #[must_use]
    pub fn daily(id: impl Into<String>, urls: Vec<String>, first: i64) -> Self {
        Self::new(id, urls, ScheduleKind::Daily, first)
    }

    /// Runs at `first` and every week after.
    #[must_use]
    pub fn weekly(id: impl Into<String>, urls: Vec<String>, first: i64) -> Self {
        Self::new(id, urls, ScheduleKind::Weekly, first)
    }

    /// Runs at `first` and every `minutes` after.
    #[must_use]
    pub fn every(id: impl Into<String>, urls: Vec<String>, first: i64, minutes: u32) -> Self {
        let mut job = Self::new(id, urls, ScheduleKind::Interval, first);
        job.interval_minutes = Some(minutes);
        job
    }

    fn period_secs(&self) -> Option<i64> {
        match self.kind {
            ScheduleKind::Once => None,
            ScheduleKind::Daily => Some(DAY_SECS),
            ScheduleKind::Weekly => Some(WEEK_SECS),
            ScheduleKind::Interval => self
                .interval_minutes
                .filter(|m| *m > 0)
                .map(|m| i64::from(m) * 60),
        }
    }

    /// Next run after a run at `ran_at`, or `None` when the job is done.
    #[must_use]
    pub fn next_after(&self, ran_at: i64) -> Option<i64> {
        let period = self.period_secs()?;
        if self.next_run_at > ran_at {
            return Some(self.next_run_at);
        }
        let missed = (ran_at - self.next_run_at) / period + 1;
        Some(self.next_run_at + missed * period)
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        let invalid = |reason: &str| ScheduleError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("empty id"));
        }
        if self.urls.iter().all(|u| u.trim().is_empty()) {
            return Err(invalid("no URLs"));
        }
        if self.kind == ScheduleKind::Interval && self.period_secs().is_none() {
            return Err(invalid("interval jobs need interval_minutes > 0"));
        }
        Ok(())
    }
}

#[derive(FromRow)]
struct JobRow {
    job_id: String,
    urls_json: String,
    kind: String,
    interval_minutes: Option<i64>,
    next_run_at: i64,
    enabled: bool,
    last_run_at: Option<i64>,
    last_batch_id: Option<String>,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = ScheduleError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| ScheduleError::Corrupt {
            id: row.job_id.clone(),
            reason,
        };
        let urls = serde_json::from_str(&row.urls_json).map_err(|e| corrupt(e.to_string()))?;
        let kind = row.kind.parse::<ScheduleKind>().map_err(corrupt)?;
        Ok(Self {
            urls,
            kind,
            interval_minutes: row.interval_minutes.and_then(|m| u32::try_from(m).ok()),
            next_run_at: row.next_run_at,
            enabled: row.enabled,
            last_run_at: row.last_run_at,
            last_batch_id: row.last_batch_id,
            id: row.job_id,
        })
    }
}

/// Change notifications from a [`JobScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScheduleEvent {
    /// A job was stored.
    Scheduled {
        /// Job id.
        job: String,
    },
    /// A job was removed.
    Cancelled {
        /// Job id.
        job: String,
    },
    /// A job was enabled or disabled.
    Toggled {
        /// Job id.
        job: String,
        /// New state.
        enabled: bool,
    },
    /// A job was made due immediately.
    Triggered {
        /// Job id.
        job: String,
    },
    /// A job's batch finished.
    Ran {
        /// Job id.
        job: String,
        /// Batch that ran.
        batch: String,
        /// Completed tasks.
        completed: usize,
        /// Failed tasks.
        failed: usize,
        /// Next run, if any.
        next_run_at: Option<i64>,
    },
}

/// Job table access plus the run loop.
///
/// Cheap to clone; clones share the event channel.
#[derive(Debug, Clone)]
pub struct JobScheduler {
    db: Database,
    events: broadcast::Sender<ScheduleEvent>,
}

const JOB_COLUMNS: &str = "job_id, urls_json, kind, interval_minutes, next_run_at, enabled, \
                           last_run_at, last_batch_id";

impl JobScheduler {
    /// Builds a scheduler over an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    /// Receives events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ScheduleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Stores `job`.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a job that could never run, `Duplicate` if the
    /// id is taken and `Database` for other failures.
    #[instrument(skip(self, job), fields(job = %job.id, kind = %job.kind))]
    pub async fn schedule(&self, job: &ScheduledJob) -> Result<(), ScheduleError> {
        job.validate()?;
        let urls = serde_json::to_string(&job.urls).map_err(|e| ScheduleError::Invalid {
            id: job.id.clone(),
            reason: e.to_string(),
        })?;

        let result = sqlx::query(
            r"INSERT INTO scheduled_jobs (
                job_id, urls_json, kind, interval_minutes, next_run_at, enabled
              ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(urls)
        .bind(job.kind.as_str())
        .bind(job.interval_minutes.map(i64::from))
        .bind(job.next_run_at)
        .bind(job.enabled)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => {
                info!(next_run_at = job.next_run_at, "job scheduled");
                self.emit(ScheduleEvent::Scheduled {
                    job: job.id.clone(),
                });
                Ok(())
            }
            Err(e) if DbErrorKind::from_sqlx(&e) == DbErrorKind::ConstraintViolation => {
                Err(ScheduleError::Duplicate { id: job.id.clone() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The job named `id`.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails and `Corrupt` for unreadable rows.
    pub async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, ScheduleError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(ScheduledJob::try_from).transpose()
    }

    /// Every stored job, soonest first.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails and `Corrupt` for unreadable rows.
    pub async fn list(&self) -> Result<Vec<ScheduledJob>, ScheduleError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY next_run_at, job_id"
        ))
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    /// Enabled jobs whose next run is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails and `Corrupt` for unreadable rows.
    pub async fn due(&self, now: i64) -> Result<Vec<ScheduledJob>, ScheduleError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs
             WHERE enabled = 1 AND next_run_at <= ?
             ORDER BY next_run_at, job_id"
        ))
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    /// Removes the job. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the delete fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<bool, ScheduleError> {
        let removed = sqlx::query(r"DELETE FROM scheduled_jobs WHERE job_id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?
            .rows_affected()
            > 0;
        if removed {
            info!("job cancelled");
            self.emit(ScheduleEvent::Cancelled { job: id.to_string() });
        }
        Ok(removed)
    }

    /// Enables or disables the job. Returns false if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, ScheduleError> {
        let found = sqlx::query(r"UPDATE scheduled_jobs SET enabled = ? WHERE job_id = ?")
            .bind(enabled)
            .bind(id)
            .execute(self.db.pool())
            .await?
            .rows_affected()
            > 0;
        if found {
            debug!("job toggled");
            self.emit(ScheduleEvent::Toggled {
                job: id.to_string(),
                enabled,
            });
        }
        Ok(found)
    }

    /// Makes the job due at `now` and enables it. Returns false if it does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    #[instrument(skip(self))]
    pub async fn trigger_now(&self, id: &str, now: i64) -> Result<bool, ScheduleError> {
        let found = sqlx::query(
            r"UPDATE scheduled_jobs SET next_run_at = ?, enabled = 1 WHERE job_id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(self.db.pool())
        .await?
        .rows_affected()
            > 0;
        if found {
            info!("job triggered");
            self.emit(ScheduleEvent::Triggered { job: id.to_string() });
        }
        Ok(found)
    }

    /// Stores the outcome of a run at `ran_at` and moves the job to its next
    /// run. A job with no next run is disabled. Returns the next run.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the update fails.
    pub async fn mark_ran(
        &self,
        job: &ScheduledJob,
        ran_at: i64,
        batch_id: &str,
    ) -> Result<Option<i64>, ScheduleError> {
        let next = job.next_after(ran_at);
        sqlx::query(
            r"UPDATE scheduled_jobs
              SET last_run_at = ?, last_batch_id = ?, next_run_at = ?, enabled = ?
              WHERE job_id = ?",
        )
        .bind(ran_at)
        .bind(batch_id)
        .bind(next.unwrap_or(job.next_run_at))
        .bind(next.is_some() && job.enabled)
        .bind(&job.id)
        .execute(self.db.pool())
        .await?;
        Ok(next)
    }

    /// Submits every job due at `now` as its own batch and waits for each.
    /// Returns the finished reports in run order.
    ///
    /// A batch that cannot be awaited still advances its job, so a broken
    /// job does not run in a tight loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the due jobs cannot be read or a run cannot be
    /// stored.
    #[instrument(skip_all, fields(now = now))]
    pub async fn run_due(
        &self,
        coordinator: &Coordinator,
        registry: &ExtractorRegistry,
        options: &BatchOptions,
        now: i64,
    ) -> Result<Vec<BatchReport>, ScheduleError> {
        let mut reports = Vec::new();
        for job in self.due(now).await? {
            info!(job = %job.id, urls = job.urls.len(), "running scheduled job");
            let handle = coordinator
                .submit_urls(registry, &job.urls, options.clone())
                .await;
            let batch = handle.id().0.clone();
            let report = match handle.wait().await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(job = %job.id, error = %e, "scheduled batch aborted");
                    None
                }
            };

            let next_run_at = self.mark_ran(&job, now, &batch).await?;
            let (completed, failed) = report
                .as_ref()
                .map_or((0, 0), |r| (r.counts.completed, r.counts.failed));
            self.emit(ScheduleEvent::Ran {
                job: job.id.clone(),
                batch,
                completed,
                failed,
                next_run_at,
            });
            reports.extend(report);
        }
        Ok(reports)
    }

    /// Checks for due jobs every `poll` until `shutdown` fires.
    ///
    /// Batches get `shutdown` as their cancellation signal, so stopping the
    /// loop also stops a running job.
    pub async fn run(
        &self,
        coordinator: &Coordinator,
        registry: &ExtractorRegistry,
        options: BatchOptions,
        poll: Duration,
        shutdown: CancellationToken,
    ) {
        let options = options.with_cancellation(shutdown.clone());
        info!(poll_secs = poll.as_secs(), "scheduler started");
        loop {
            let now = unix_now_secs();
            if let Err(e) = self.run_due(coordinator, registry, &options, now).await {
                warn!(error = %e, "scheduler pass failed");
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(poll) => {}
            }
        }
        info!("scheduler stopped");
    }
}

/// Current time in unix seconds.
#[must_use]
pub fn unix_now_secs() -> i64 {
    i64::try_from(crate::coordinator::batch::unix_now().as_secs()).unwrap_or(i64::MAX)
}
