//! Persisted terminal reports, one row per batch, plus each batch's event
//! timeline.
//!
//! Counts are stored in columns for cheap listing; the full [`BatchReport`]
//! is kept as JSON for [`BatchHistory::get`]. Events are appended when a
//! batch is submitted and when its report is stored (one per task, then
//! `finished`), and are removed together with the report.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::coordinator::BatchReport;
use crate::db::{Database, DbErrorKind};
use crate::task::TaskStatus;

/// Errors from batch history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Query or write failed.
    #[error("batch history {kind} error: {message}")]
    Database {
        /// Classified failure.
        kind: DbErrorKind,
        /// Driver message.
        message: String,
    },

    /// The report could not be serialized.
    #[error("failed to encode report for batch {batch}: {source}")]
    Encode {
        /// Batch identifier.
        batch: String,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// The stored report JSON could not be read back.
    #[error("stored report for batch {batch} is unreadable: {source}")]
    Decode {
        /// Batch identifier.
        batch: String,
        /// Deserializer error.
        #[source]
        source: serde_json::Error,
    },
}

impl From<sqlx::Error> for HistoryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&error),
            message: error.to_string(),
        }
    }
}

/// One row of [`BatchHistory::list_recent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct BatchSummary {
    /// Batch identifier.
    pub batch_id: String,
    /// Submission time, UTC `YYYY-MM-DD HH:MM:SS`.
    pub started_at: String,
    /// Time the report was stored, same format.
    pub finished_at: String,
    /// Tasks in the batch.
    pub total_tasks: i64,
    /// Completed tasks.
    pub completed: i64,
    /// Skipped tasks.
    pub skipped: i64,
    /// Failed tasks.
    pub failed: i64,
    /// Cancelled tasks.
    pub cancelled: i64,
    /// Bytes transferred.
    pub bytes_transferred: i64,
    /// Whether the batch was cancelled.
    pub was_cancelled: bool,
}

/// Totals across every stored batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    /// Stored batches.
    pub batches: u64,
    /// Completed tasks.
    pub completed: u64,
    /// Failed tasks.
    pub failed: u64,
    /// Bytes transferred.
    pub bytes_transferred: u64,
}

/// What a [`BatchEvent`] marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEventKind {
    /// Tasks were built and queued.
    Submitted,
    /// A task finished with a transfer.
    TaskCompleted,
    /// A task was skipped.
    TaskSkipped,
    /// A task gave up.
    TaskFailed,
    /// A task was cancelled.
    TaskCancelled,
    /// The batch report was stored.
    Finished,
}

impl BatchEventKind {
    /// Snake-case label stored in the `kind` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::TaskCompleted => "task_completed",
            Self::TaskSkipped => "task_skipped",
            Self::TaskFailed => "task_failed",
            Self::TaskCancelled => "task_cancelled",
            Self::Finished => "finished",
        }
    }

    fn for_task(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => Self::TaskCompleted,
            TaskStatus::Skipped => Self::TaskSkipped,
            TaskStatus::Failed => Self::TaskFailed,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Cancelled => {
                Self::TaskCancelled
            }
        }
    }
}

impl fmt::Display for BatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a batch's timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEvent {
    /// Insertion order across all batches.
    pub id: i64,
    /// Batch the event belongs to.
    pub batch_id: String,
    /// UTC `YYYY-MM-DD HH:MM:SS`.
    pub recorded_at: String,
    /// Label from [`BatchEventKind::as_str`].
    pub kind: String,
    /// Event details.
    pub payload: Option<serde_json::Value>,
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    batch_id: String,
    recorded_at: String,
    kind: String,
    payload_json: Option<String>,
}

async fn insert_event(
    conn: &mut SqliteConnection,
    batch_id: &str,
    kind: BatchEventKind,
    payload: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(r"INSERT INTO batch_events (batch_id, kind, payload_json) VALUES (?, ?, ?)")
        .bind(batch_id)
        .bind(kind.as_str())
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}

/// Batch history table access.
#[derive(Debug, Clone)]
pub struct BatchHistory {
    db: Database,
}

fn to_i64(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl BatchHistory {
    /// Builds history access over an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stores `report`, replacing any earlier row for the same batch.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if the report cannot be serialized and `Database`
    /// if the insert fails.
    #[instrument(skip(self, report), fields(batch = %report.batch_id))]
    pub async fn record(&self, report: &BatchReport) -> Result<(), HistoryError> {
        let encode = |source| HistoryError::Encode {
            batch: report.batch_id.to_string(),
            source,
        };
        let json = serde_json::to_string(report).map_err(encode)?;
        let mut events = Vec::with_capacity(report.tasks.len() + 1);
        for task in &report.tasks {
            events.push((
                BatchEventKind::for_task(task.status),
                serde_json::to_string(task).map_err(encode)?,
            ));
        }
        let finished = json!({
            "counts": report.counts,
            "bytes_transferred": report.bytes_transferred,
            "was_cancelled": report.was_cancelled,
            "discovery_failures": report.discovery_failures.len(),
        });
        events.push((BatchEventKind::Finished, finished.to_string()));
        let counts = &report.counts;

        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            r"INSERT OR REPLACE INTO batch_history (
                batch_id, started_at, total_tasks, completed, skipped, failed,
                cancelled, bytes_transferred, was_cancelled, report_json
              ) VALUES (?, datetime(?, 'unixepoch'), ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&report.batch_id.0)
        .bind(to_i64(report.started_at_unix))
        .bind(to_i64(counts.total))
        .bind(to_i64(counts.completed))
        .bind(to_i64(counts.skipped))
        .bind(to_i64(counts.failed))
        .bind(to_i64(counts.cancelled))
        .bind(to_i64(report.bytes_transferred))
        .bind(report.was_cancelled)
        .bind(json)
        .execute(&mut *tx)
        .await?;
        for (kind, payload) in &events {
            insert_event(&mut tx, &report.batch_id.0, *kind, Some(payload.as_str())).await?;
        }
        tx.commit().await?;

        debug!(events = events.len(), "recorded batch report");
        Ok(())
    }

    /// Appends one event to `batch_id`'s timeline.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the insert fails.
    pub async fn append_event(
        &self,
        batch_id: &str,
        kind: BatchEventKind,
        payload: &serde_json::Value,
    ) -> Result<(), HistoryError> {
        let payload = payload.to_string();
        let mut conn = self.db.pool().acquire().await?;
        insert_event(&mut conn, batch_id, kind, Some(payload.as_str())).await?;
        Ok(())
    }

    /// Timeline of `batch_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails and `Decode` if a stored payload
    /// is not valid JSON.
    pub async fn events(&self, batch_id: &str) -> Result<Vec<BatchEvent>, HistoryError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"SELECT id, batch_id, recorded_at, kind, payload_json
              FROM batch_events WHERE batch_id = ? ORDER BY id",
        )
        .bind(batch_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload = row
                    .payload_json
                    .as_deref()
                    .map(serde_json::from_str::<serde_json::Value>)
                    .transpose()
                    .map_err(|source| HistoryError::Decode {
                        batch: row.batch_id.clone(),
                        source,
                    })?;
                Ok(BatchEvent {
                    id: row.id,
                    batch_id: row.batch_id,
                    recorded_at: row.recorded_at,
                    kind: row.kind,
                    payload,
                })
            })
            .collect()
    }

    /// Removes `batch_id`'s report and events. Returns false if neither existed.
    ///
    /// # Errors
    ///
    /// Returns `Database` if a delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, batch_id: &str) -> Result<bool, HistoryError> {
        let mut tx = self.db.pool().begin().await?;
        let events = sqlx::query(r"DELETE FROM batch_events WHERE batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let reports = sqlx::query(r"DELETE FROM batch_history WHERE batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!(events, reports, "deleted batch");
        Ok(events + reports > 0)
    }

    /// Most recent batches first.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<BatchSummary>, HistoryError> {
        let rows = sqlx::query_as::<_, BatchSummary>(
            r"SELECT batch_id, started_at, finished_at, total_tasks, completed, skipped,
                     failed, cancelled, bytes_transferred, was_cancelled
              FROM batch_history
              ORDER BY finished_at DESC, rowid DESC
              LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Full stored report of `batch_id`.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails and `Decode` if the stored JSON
    /// is not a valid report.
    pub async fn get(&self, batch_id: &str) -> Result<Option<BatchReport>, HistoryError> {
        let row = sqlx::query(r"SELECT report_json FROM batch_history WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(json) = row.and_then(|r| r.get::<Option<String>, _>("report_json")) else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| HistoryError::Decode {
                batch: batch_id.to_string(),
                source,
            })
    }

    /// Keeps the `keep_last` most recent batches and deletes the rest,
    /// events included. Returns how many reports were removed.
    ///
    /// Events of batches without a stored report (still running) are kept.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the delete fails.
    #[instrument(skip(self))]
    pub async fn prune(&self, keep_last: u32) -> Result<u64, HistoryError> {
        let keep = i64::from(keep_last);
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            r"DELETE FROM batch_events WHERE batch_id IN (
                SELECT batch_id FROM batch_history WHERE batch_id NOT IN (
                  SELECT batch_id FROM batch_history
                  ORDER BY finished_at DESC, rowid DESC
                  LIMIT ?
                )
              )",
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            r"DELETE FROM batch_history WHERE batch_id NOT IN (
                SELECT batch_id FROM batch_history
                ORDER BY finished_at DESC, rowid DESC
                LIMIT ?
              )",
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(removed = result.rows_affected(), "pruned batch history");
        Ok(result.rows_affected())
    }

    /// Totals over all stored batches.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the query fails.
    pub async fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let row = sqlx::query(
            r"SELECT COUNT(*) AS batches,
                     COALESCE(SUM(completed), 0) AS completed,
                     COALESCE(SUM(failed), 0) AS failed,
                     COALESCE(SUM(bytes_transferred), 0) AS bytes
              FROM batch_history",
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(HistoryStats {
            batches: to_u64(row.get("batches")),
            completed: to_u64(row.get("completed")),
            failed: to_u64(row.get("failed")),
            bytes_transferred: to_u64(row.get("bytes")),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use std::path::PathBuf;

    use super::*;
    use crate::coordinator::{BatchCounts, BatchId};
    use crate::media::MediaKind;
    use crate::task::{TaskId, TaskReport};

    async fn history() -> BatchHistory {
        BatchHistory::new(Database::new_in_memory().await.unwrap())
    }

    fn report(id: &str, completed: usize, failed: usize) -> BatchReport {
        BatchReport {
            batch_id: BatchId(id.to_string()),
            started_at_unix: 1_700_000_000,
            elapsed: Duration::from_millis(1500),
            counts: BatchCounts {
                total: completed + failed,
                completed,
                failed,
                ..BatchCounts::default()
            },
            bytes_transferred: 2048,
            was_cancelled: false,
            tasks: Vec::new(),
            discovery_failures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_record_and_get_round_trip() {
        let history = history().await;
        let original = report("b1", 2, 1);
        history.record(&original).await.unwrap();

        let stored = history.get("b1").await.unwrap().unwrap();
        assert_eq!(stored, original);
        assert!(history.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_newest_first_with_limit() {
        let history = history().await;
        for id in ["b1", "b2", "b3"] {
            history.record(&report(id, 1, 0)).await.unwrap();
        }

        let rows = history.list_recent(2).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b2"]);
        assert_eq!(rows[0].started_at, "2023-11-14 22:13:20");
        assert_eq!(rows[0].bytes_transferred, 2048);
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let history = history().await;
        for id in ["b1", "b2", "b3", "b4"] {
            history.record(&report(id, 1, 0)).await.unwrap();
        }

        assert_eq!(history.prune(1).await.unwrap(), 3);
        let rows = history.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, "b4");
        assert_eq!(history.prune(5).await.unwrap(), 0);
    }

    fn task(id: u64, status: TaskStatus) -> TaskReport {
        TaskReport {
            id: TaskId(id),
            source_url: format!("https://example.com/{id}.jpg"),
            download_url: format!("https://example.com/{id}.jpg"),
            kind: MediaKind::Image,
            status,
            attempts: 1,
            path: Some(PathBuf::from(format!("/media/{id}.jpg"))),
            bytes: 10,
            content_hash: None,
            error: None,
            skip_reason: None,
        }
    }

    #[tokio::test]
    async fn test_record_writes_task_events_after_submission() {
        let history = history().await;
        history
            .append_event("b1", BatchEventKind::Submitted, &json!({ "queued": 2 }))
            .await
            .unwrap();

        let mut finished = report("b1", 1, 1);
        finished.tasks = vec![task(1, TaskStatus::Completed), task(2, TaskStatus::Failed)];
        history.record(&finished).await.unwrap();

        let events = history.events("b1").await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["submitted", "task_completed", "task_failed", "finished"]
        );
        assert_eq!(events[0].payload, Some(json!({ "queued": 2 })));
        let first_task = events[1].payload.as_ref().unwrap();
        assert_eq!(first_task["download_url"], "https://example.com/1.jpg");
        assert_eq!(events[3].payload.as_ref().unwrap()["counts"]["failed"], 1);
        assert!(history.events("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_report_and_events() {
        let history = history().await;
        history.record(&report("b1", 1, 0)).await.unwrap();
        history.record(&report("b2", 1, 0)).await.unwrap();

        assert!(history.delete("b1").await.unwrap());
        assert!(history.get("b1").await.unwrap().is_none());
        assert!(history.events("b1").await.unwrap().is_empty());
        assert_eq!(history.events("b2").await.unwrap().len(), 1);
        assert!(!history.delete("b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_drops_events_of_pruned_batches_only() {
        let history = history().await;
        history.record(&report("old", 1, 0)).await.unwrap();
        history.record(&report("new", 1, 0)).await.unwrap();
        history
            .append_event("running", BatchEventKind::Submitted, &json!({}))
            .await
            .unwrap();

        assert_eq!(history.prune(1).await.unwrap(), 1);
        assert!(history.events("old").await.unwrap().is_empty());
        assert_eq!(history.events("new").await.unwrap().len(), 1);
        assert_eq!(history.events("running").await.unwrap().len(), 1);
    }

    #[test]
    fn test_event_kind_for_task_status() {
        assert_eq!(
            BatchEventKind::for_task(TaskStatus::Skipped),
            BatchEventKind::TaskSkipped
        );
        assert_eq!(BatchEventKind::TaskCancelled.to_string(), "task_cancelled");
    }

    #[tokio::test]
    async fn test_stats_sum_counts() {
        let history = history().await;
        assert_eq!(history.stats().await.unwrap(), HistoryStats::default());

        history.record(&report("b1", 2, 1)).await.unwrap();
        history.record(&report("b2", 3, 0)).await.unwrap();

        let stats = history.stats().await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.bytes_transferred, 4096);
    }
}
