//! Human-readable summaries printed to stdout.

use std::fmt::Write as _;

use indicatif::{HumanBytes, HumanDuration};
use mediagrab_core::{
    BatchEvent, BatchReport, BatchSummary, HistoryStats, ScheduleKind, ScheduledJob, SkipReason,
    TaskStatus,
};

/// Text summary of a finished batch.
pub(crate) fn render_report(report: &BatchReport) -> String {
    let counts = &report.counts;
    let mut out = format!(
        "Batch {}: {} completed, {} skipped, {} failed, {} cancelled ({} in {})\n",
        report.batch_id,
        counts.completed,
        counts.skipped,
        counts.failed,
        counts.cancelled,
        HumanBytes(report.bytes_transferred),
        HumanDuration(report.elapsed),
    );

    for task in &report.tasks {
        match (task.status, &task.skip_reason, &task.error) {
            (TaskStatus::Skipped, Some(SkipReason::DryRun), _) => {
                let _ = writeln!(out, "  would download  {}", task.download_url);
            }
            (TaskStatus::Skipped, Some(reason), _) => {
                let _ = writeln!(out, "  skipped  {} ({reason})", task.download_url);
            }
            (TaskStatus::Failed, _, Some(error)) => {
                let _ = writeln!(
                    out,
                    "  failed  {} after {} attempt(s): [{}] {}",
                    task.download_url, task.attempts, error.kind, error.message
                );
            }
            _ => {}
        }
    }

    for failure in &report.discovery_failures {
        let _ = writeln!(
            out,
            "  not extracted  {} [{}] {}",
            failure.url, failure.kind, failure.message
        );
    }
    if report.was_cancelled {
        out.push_str("Batch was cancelled.\n");
    }
    out
}

/// Table of recent batches followed by lifetime totals.
pub(crate) fn render_history(rows: &[BatchSummary], stats: &HistoryStats) -> String {
    if rows.is_empty() {
        return "No batches recorded.\n".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{}  {}  {}/{} completed, {} skipped, {} failed{}",
            row.batch_id,
            row.finished_at,
            row.completed,
            row.total_tasks,
            row.skipped,
            row.failed,
            if row.was_cancelled { " (cancelled)" } else { "" },
        );
    }
    let _ = writeln!(
        out,
        "{} batches, {} files completed, {} failed, {} transferred",
        stats.batches,
        stats.completed,
        stats.failed,
        HumanBytes(stats.bytes_transferred),
    );
    out
}

/// One line per stored event, oldest first.
pub(crate) fn render_events(events: &[BatchEvent]) -> String {
    if events.is_empty() {
        return "No events recorded.\n".to_string();
    }
    let mut out = String::new();
    for event in events {
        let _ = write!(out, "{}  {}", event.recorded_at, event.kind);
        if let Some(payload) = &event.payload {
            let _ = write!(out, "  {payload}");
        }
        out.push('\n');
    }
    out
}

/// Table of scheduled jobs.
pub(crate) fn render_jobs(jobs: &[ScheduledJob]) -> String {
    if jobs.is_empty() {
        return "No jobs scheduled.\n".to_string();
    }
    let mut out = String::new();
    for job in jobs {
        let every = match (job.kind, job.interval_minutes) {
            (ScheduleKind::Interval, Some(minutes)) => format!("every {minutes}m"),
            (kind, _) => kind.to_string(),
        };
        let _ = write!(
            out,
            "{}  {}  next {}  {} url(s){}",
            job.id,
            every,
            job.next_run_at,
            job.urls.len(),
            if job.enabled { "" } else { " (disabled)" },
        );
        if let Some(batch) = &job.last_batch_id {
            let _ = write!(out, "  last batch {batch}");
        }
        out.push('\n');
    }
    out
}
