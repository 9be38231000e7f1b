//! CLI entry point for the mediagrab tool.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use mediagrab_core::config::{FileConfig, load_default_file_config};
use mediagrab_core::schedule::unix_now_secs;
use mediagrab_core::{
    BatchHistory, BatchOptions, Coordinator, Database, DedupStore, EngineConfig, JobScheduler,
    MediaKind, ScheduleKind, ScheduledJob, build_default_registry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;
mod output;
mod progress_bar;

use cli::{Args, Command, FetchArgs, ScheduleAddArgs, ScheduleCommand};
use progress_bar::BatchProgressBar;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = EngineConfig::default();
    let file = match &args.config {
        Some(path) => Some((path.clone(), FileConfig::load(path)?)),
        None => load_default_file_config()?,
    };
    if let Some((path, file)) = file {
        debug!(path = %path.display(), "loaded config file");
        config.apply_file(&file);
    }
    if let Some(db) = &args.db {
        config.database_path.clone_from(db);
    }

    let db = Database::new_with_options(&config.database_path, config.database)
        .await
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;

    let result = match args.command {
        Command::Fetch(fetch) => run_fetch(fetch, config, db.clone()).await,
        Command::History {
            limit,
            batch,
            events,
        } => run_history(&db, limit, batch.as_deref(), events).await,
        Command::DeleteBatch { batch_id } => run_delete_batch(&db, &batch_id).await,
        Command::Forget { urls } => run_forget(&db, &urls).await,
        Command::ClearHistory { keep } => run_clear_history(&db, keep).await,
        Command::Schedule { action } => run_schedule(action, config, db.clone()).await,
    };
    db.close().await;
    result
}

async fn run_fetch(args: FetchArgs, mut config: EngineConfig, db: Database) -> Result<ExitCode> {
    if let Some(workers) = args.workers {
        config.workers = usize::from(workers);
    }
    if let Some(retries) = args.retries {
        config.max_attempts = retries;
    }
    if let Some(naming) = args.naming {
        config.naming = naming;
    }
    if let Some(output) = &args.output {
        config.dest_root.clone_from(output);
    }

    let urls = read_urls(&args.urls)?;
    if urls.is_empty() {
        info!("No input provided. Pipe URLs via stdin or pass them as arguments.");
        info!("Example: echo 'https://example.com/photo.jpg' | mediagrab fetch");
        return Ok(ExitCode::SUCCESS);
    }
    info!(urls = urls.len(), "fetching");

    // Installed before extraction so an interrupt during page fetches counts.
    let interrupt = interrupt_token("cancelling batch");

    let mut options = BatchOptions::default()
        .with_kinds(args.kinds.iter().copied().map(MediaKind::from))
        .with_size_bounds(args.min_size.unwrap_or(0), args.max_size.unwrap_or(0))
        .with_date_range(args.date_from.clone(), args.date_to.clone())
        .dry_run(args.dry_run)
        .with_cancellation(interrupt);
    if let Some(subdir) = &args.subdir {
        options = options.with_subdir(subdir);
    }

    let progress_interval = config.progress_interval;
    let coordinator = Coordinator::new(DedupStore::new(db), config)
        .context("invalid download settings")?;
    let registry = build_default_registry(coordinator.client());

    let handle = coordinator.submit_urls(&registry, &urls, options).await;

    let show_bar = !args.no_progress && !args.json && io::stderr().is_terminal();
    let bar = BatchProgressBar::new(show_bar, handle.progress().total());
    bar.follow(&handle, progress_interval).await;
    bar.finish();

    let report = handle.wait().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::render_report(&report));
    }

    if report.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Token cancelled on the first Ctrl+C.
fn interrupt_token(action: &'static str) -> CancellationToken {
    let interrupt = CancellationToken::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, {action}");
            on_signal.cancel();
        }
    });
    interrupt
}

/// URLs from the command line, else one per line from piped stdin.
fn read_urls(args: &[String]) -> Result<Vec<String>> {
    let text = if !args.is_empty() {
        args.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read URLs from stdin")?;
        buffer
    } else {
        return Ok(Vec::new());
    };

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn run_history(
    db: &Database,
    limit: u32,
    batch: Option<&str>,
    events: bool,
) -> Result<ExitCode> {
    let history = BatchHistory::new(db.clone());
    if let Some(batch_id) = batch {
        if events {
            let events = history.events(batch_id).await?;
            print!("{}", output::render_events(&events));
            return Ok(ExitCode::SUCCESS);
        }
        let Some(report) = history.get(batch_id).await? else {
            bail!("no batch named {batch_id}");
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let rows = history.list_recent(limit).await?;
    let stats = history.stats().await?;
    print!("{}", output::render_history(&rows, &stats));
    Ok(ExitCode::SUCCESS)
}

async fn run_delete_batch(db: &Database, batch_id: &str) -> Result<ExitCode> {
    if BatchHistory::new(db.clone()).delete(batch_id).await? {
        println!("deleted batch {batch_id}");
        Ok(ExitCode::SUCCESS)
    } else {
        bail!("no batch named {batch_id}");
    }
}

async fn run_forget(db: &Database, urls: &[String]) -> Result<ExitCode> {
    let store = DedupStore::new(db.clone());
    for url in urls {
        if store.forget_url(url).await? {
            println!("forgot {url}");
        } else {
            println!("not recorded: {url}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_clear_history(db: &Database, keep: u32) -> Result<ExitCode> {
    let removed_records = DedupStore::new(db.clone()).clear().await?;
    let removed_batches = BatchHistory::new(db.clone()).prune(keep).await?;
    info!(removed_records, removed_batches, "history cleared");
    println!("removed {removed_records} download record(s) and {removed_batches} batch report(s)");
    Ok(ExitCode::SUCCESS)
}

async fn run_schedule(
    action: ScheduleCommand,
    config: EngineConfig,
    db: Database,
) -> Result<ExitCode> {
    let scheduler = JobScheduler::new(db.clone());
    match action {
        ScheduleCommand::Add(add) => {
            let job = job_from_args(add, unix_now_secs());
            scheduler.schedule(&job).await?;
            println!(
                "scheduled {} ({}), first run at {}",
                job.id, job.kind, job.next_run_at
            );
        }
        ScheduleCommand::List => print!("{}", output::render_jobs(&scheduler.list().await?)),
        ScheduleCommand::Remove { id } => {
            if !scheduler.cancel(&id).await? {
                bail!("no job named {id}");
            }
            println!("removed {id}");
        }
        ScheduleCommand::Enable { id } => {
            if !scheduler.set_enabled(&id, true).await? {
                bail!("no job named {id}");
            }
            println!("enabled {id}");
        }
        ScheduleCommand::Disable { id } => {
            if !scheduler.set_enabled(&id, false).await? {
                bail!("no job named {id}");
            }
            println!("disabled {id}");
        }
        ScheduleCommand::RunNow { id } => {
            let now = unix_now_secs();
            if !scheduler.trigger_now(&id, now).await? {
                bail!("no job named {id}");
            }
            let coordinator = Coordinator::new(DedupStore::new(db), config)
                .context("invalid download settings")?;
            let registry = build_default_registry(coordinator.client());
            let options =
                BatchOptions::default().with_cancellation(interrupt_token("cancelling job"));
            let reports = scheduler
                .run_due(&coordinator, &registry, &options, now)
                .await?;
            for report in &reports {
                print!("{}", output::render_report(report));
            }
            if reports.iter().any(mediagrab_core::BatchReport::has_failures) {
                return Ok(ExitCode::FAILURE);
            }
        }
        ScheduleCommand::Run { poll_secs } => {
            let coordinator = Coordinator::new(DedupStore::new(db), config)
                .context("invalid download settings")?;
            let registry = build_default_registry(coordinator.client());
            let mut events = scheduler.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
            });
            let poll = Duration::from_secs(poll_secs);
            scheduler
                .run(
                    &coordinator,
                    &registry,
                    BatchOptions::default(),
                    poll,
                    interrupt_token("stopping scheduler"),
                )
                .await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn job_from_args(add: ScheduleAddArgs, now: i64) -> ScheduledJob {
    let first = now + i64::from(add.start_in_minutes) * 60;
    match ScheduleKind::from(add.every) {
        ScheduleKind::Once => ScheduledJob::once(add.id, add.urls, first),
        ScheduleKind::Daily => ScheduledJob::daily(add.id, add.urls, first),
        ScheduleKind::Weekly => ScheduledJob::weekly(add.id, add.urls, first),
        ScheduleKind::Interval => {
            ScheduledJob::every(add.id, add.urls, first, add.interval_minutes.unwrap_or(0))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_read_urls_prefers_arguments() {
        let urls = read_urls(&[
            "https://example.com/a.jpg".to_string(),
            "  https://example.com/b.jpg  ".to_string(),
        ])
        .unwrap();
        assert_eq!(urls, vec!["https://example.com/a.jpg", "https://example.com/b.jpg"]);
    }

    #[test]
    fn test_read_urls_drops_blank_and_comment_lines() {
        let urls = read_urls(&[
            "# gallery".to_string(),
            String::new(),
            "https://example.com/a.jpg".to_string(),
        ])
        .unwrap();
        assert_eq!(urls, vec!["https://example.com/a.jpg"]);
    }

    #[test]
    fn test_job_from_args_offsets_first_run() {
        let add = ScheduleAddArgs {
            urls: vec!["https://example.com/g".to_string()],
            id: "g".to_string(),
            every: cli::EveryArg::Interval,
            interval_minutes: Some(15),
            start_in_minutes: 2,
        };
        let job = job_from_args(add, 1_000);
        assert_eq!(job.kind, ScheduleKind::Interval);
        assert_eq!(job.interval_minutes, Some(15));
        assert_eq!(job.next_run_at, 1_120);
        assert!(job.enabled);
    }
}
