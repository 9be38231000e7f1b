//! Mediagrab Core Library
//!
//! Batch media downloading with cross-run deduplication. Site extractors turn
//! user URLs into [`MediaItem`]s; the [`Coordinator`] turns items into tasks,
//! skips anything already recorded in the [`DedupStore`], and runs the rest
//! on a bounded [`WorkerPool`] with per-task retries.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`extract`] - Extractor trait, registry and the built-in extractors
//! - [`coordinator`] - Batch submission, status tracking and reports
//! - [`pool`] - Bounded worker pool and the in-flight key set
//! - [`download`] - Streaming HTTP transfers, naming and retry policy
//! - [`dedup`] - Persistent record of completed downloads
//! - [`history`] - Stored batch reports and per-batch event logs
//! - [`schedule`] - Persisted once/daily/weekly/interval fetch jobs
//! - [`progress`] - Byte totals, speed and ETA across a batch
//! - [`db`] - Database connection and schema management
//! - [`config`] - Engine settings and the TOML config file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod coordinator;
pub mod db;
pub mod dedup;
pub mod download;
pub mod extract;
pub mod history;
pub mod media;
pub mod pool;
pub mod progress;
pub mod schedule;
pub mod task;
mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, FileConfig};
pub use coordinator::{
    BatchCounts, BatchHandle, BatchId, BatchOptions, BatchReport, BatchSnapshot, Coordinator,
    CoordinatorError, DiscoveryFailure, discover,
};
pub use db::{Database, DatabaseOptions, DbError};
pub use dedup::{DedupRecord, DedupStore, StoreError, dedup_key};
pub use download::{
    DownloadError, ErrorKind, HttpClient, NamingPolicy, RetryDecision, RetryPolicy,
};
pub use extract::{
    DirectExtractor, ExtractError, Extractor, ExtractorPriority, ExtractorRegistry,
    PageExtractor, build_default_registry,
};
pub use history::{
    BatchEvent, BatchEventKind, BatchHistory, BatchSummary, HistoryError, HistoryStats,
};
pub use media::{MediaItem, MediaKind};
pub use pool::{InFlightKeys, PoolError, WorkerPool};
pub use progress::{ProgressAggregator, ProgressSnapshot};
pub use schedule::{JobScheduler, ScheduleError, ScheduleEvent, ScheduleKind, ScheduledJob};
pub use task::{DownloadTask, SkipReason, TaskId, TaskReport, TaskStatus};
