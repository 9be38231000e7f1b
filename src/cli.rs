//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use mediagrab_core::{MediaKind, NamingPolicy, ScheduleKind};

/// Batch download media from content hosts.
///
/// Mediagrab finds the media behind each URL, skips anything it has already
/// downloaded in an earlier run, and fetches the rest in parallel.
#[derive(Parser, Debug)]
#[command(name = "mediagrab")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/mediagrab/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Database holding download records and batch history
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the media behind each URL (reads stdin when no URL is given)
    Fetch(FetchArgs),

    /// List recent batches
    History {
        /// Number of batches to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,

        /// Print the full stored report of one batch as JSON
        #[arg(long, value_name = "BATCH_ID")]
        batch: Option<String>,

        /// With --batch, print the batch's event log instead of its report
        #[arg(long, requires = "batch")]
        events: bool,
    },

    /// Delete one stored batch report and its event log
    DeleteBatch {
        /// Batch to delete
        batch_id: String,
    },

    /// Drop download records so the URLs are fetched again next time
    Forget {
        /// Download URLs to forget
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Delete every download record and prune batch history
    ClearHistory {
        /// Batch reports to keep (most recent first)
        #[arg(long, default_value_t = 0)]
        keep: u32,
    },

    /// Manage and run scheduled fetch jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Store a new job
    Add(ScheduleAddArgs),

    /// List stored jobs
    List,

    /// Delete a job
    Remove {
        /// Job id
        id: String,
    },

    /// Re-enable a disabled job
    Enable {
        /// Job id
        id: String,
    },

    /// Keep a job but stop running it
    Disable {
        /// Job id
        id: String,
    },

    /// Make a job due now and run every due job once
    RunNow {
        /// Job id
        id: String,
    },

    /// Run due jobs until interrupted
    Run {
        /// Seconds between checks for due jobs
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
        poll_secs: u64,
    },
}

#[derive(ClapArgs, Debug)]
pub struct ScheduleAddArgs {
    /// Page or media URLs fetched on each run
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Unique job id
    #[arg(long)]
    pub id: String,

    /// How often the job repeats
    #[arg(long, value_enum, default_value_t = EveryArg::Once)]
    pub every: EveryArg,

    /// Period for --every interval
    #[arg(long, value_name = "MINUTES", required_if_eq("every", "interval"))]
    pub interval_minutes: Option<u32>,

    /// Delay before the first run
    #[arg(long, value_name = "MINUTES", default_value_t = 0)]
    pub start_in_minutes: u32,
}

/// Repeat rule accepted by `schedule add --every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EveryArg {
    Once,
    Daily,
    Weekly,
    Interval,
}

impl From<EveryArg> for ScheduleKind {
    fn from(every: EveryArg) -> Self {
        match every {
            EveryArg::Once => Self::Once,
            EveryArg::Daily => Self::Daily,
            EveryArg::Weekly => Self::Weekly,
            EveryArg::Interval => Self::Interval,
        }
    }
}

#[derive(ClapArgs, Debug, Default)]
pub struct FetchArgs {
    /// Page or media URLs
    pub urls: Vec<String>,

    /// Concurrent downloads (1-32)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..=32))]
    pub workers: Option<u16>,

    /// Attempts per file, first try included (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub retries: Option<u32>,

    /// Filename collision policy: sequential-suffix, content-hash, overwrite, skip-if-exists
    #[arg(long, value_parser = parse_naming)]
    pub naming: Option<NamingPolicy>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Subdirectory under the output directory for this batch
    #[arg(long, value_name = "DIR")]
    pub subdir: Option<PathBuf>,

    /// Only download these media kinds (repeatable)
    #[arg(short = 'k', long = "kind", value_enum)]
    pub kinds: Vec<KindArg>,

    /// Skip files smaller than this many bytes, when the size is known
    #[arg(long, value_name = "BYTES")]
    pub min_size: Option<u64>,

    /// Skip files larger than this many bytes, when the size is known
    #[arg(long, value_name = "BYTES")]
    pub max_size: Option<u64>,

    /// Skip items published before this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE", value_parser = parse_date)]
    pub date_from: Option<String>,

    /// Skip items published after this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE", value_parser = parse_date)]
    pub date_to: Option<String>,

    /// Decide what would be downloaded without transferring anything
    #[arg(long)]
    pub dry_run: bool,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Media kind accepted by `--kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Image,
    Video,
    Document,
    Archive,
    Other,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Image => Self::Image,
            KindArg::Video => Self::Video,
            KindArg::Document => Self::Document,
            KindArg::Archive => Self::Archive,
            KindArg::Other => Self::Other,
        }
    }
}

fn parse_naming(raw: &str) -> Result<NamingPolicy, String> {
    raw.parse()
}

fn parse_date(raw: &str) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if well_formed {
        Ok(raw.to_string())
    } else {
        Err(format!("expected YYYY-MM-DD, got '{raw}'"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fetch(argv: &[&str]) -> FetchArgs {
        let args = Args::try_parse_from(argv).unwrap();
        match args.command {
            Command::Fetch(fetch) => fetch,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_fetch_defaults() {
        let args = fetch(&["mediagrab", "fetch", "https://example.com/a.jpg"]);
        assert_eq!(args.urls, vec!["https://example.com/a.jpg"]);
        assert_eq!(args.workers, None);
        assert_eq!(args.retries, None);
        assert!(args.kinds.is_empty());
        assert!(!args.dry_run);
        assert!(!args.json);
    }

    #[test]
    fn test_cli_verbose_flag_is_global() {
        let args = Args::try_parse_from(["mediagrab", "fetch", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["mediagrab", "-q", "history"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_subcommand_required() {
        let err = Args::try_parse_from(["mediagrab"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingSubcommand);
    }

    #[test]
    fn test_cli_workers_range() {
        assert_eq!(fetch(&["mediagrab", "fetch", "-w", "32"]).workers, Some(32));
        assert_eq!(fetch(&["mediagrab", "fetch", "--workers", "1"]).workers, Some(1));

        for bad in ["0", "33"] {
            let err = Args::try_parse_from(["mediagrab", "fetch", "-w", bad]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_retries_range() {
        assert_eq!(fetch(&["mediagrab", "fetch", "-r", "10"]).retries, Some(10));
        let err = Args::try_parse_from(["mediagrab", "fetch", "-r", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_naming_policy() {
        let args = fetch(&["mediagrab", "fetch", "--naming", "skip-if-exists"]);
        assert_eq!(args.naming, Some(NamingPolicy::SkipIfExists));

        let err = Args::try_parse_from(["mediagrab", "fetch", "--naming", "random"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_kind_filter_repeatable() {
        let args = fetch(&["mediagrab", "fetch", "-k", "image", "--kind", "video"]);
        let kinds: Vec<MediaKind> = args.kinds.into_iter().map(MediaKind::from).collect();
        assert_eq!(kinds, vec![MediaKind::Image, MediaKind::Video]);
    }

    #[test]
    fn test_cli_date_validation() {
        let args = fetch(&["mediagrab", "fetch", "--date-from", "2024-01-31"]);
        assert_eq!(args.date_from.as_deref(), Some("2024-01-31"));

        let err =
            Args::try_parse_from(["mediagrab", "fetch", "--date-to", "31/01/2024"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_history_and_clear_defaults() {
        let args = Args::try_parse_from(["mediagrab", "history"]).unwrap();
        assert!(matches!(
            args.command,
            Command::History {
                limit: 20,
                batch: None,
                events: false
            }
        ));

        let args = Args::try_parse_from(["mediagrab", "clear-history", "--keep", "3"]).unwrap();
        assert!(matches!(args.command, Command::ClearHistory { keep: 3 }));
    }

    #[test]
    fn test_cli_forget_requires_url() {
        let err = Args::try_parse_from(["mediagrab", "forget"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_history_events_need_a_batch() {
        let err = Args::try_parse_from(["mediagrab", "history", "--events"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let args =
            Args::try_parse_from(["mediagrab", "history", "--batch", "b-1", "--events"]).unwrap();
        assert!(matches!(args.command, Command::History { events: true, .. }));

        let args = Args::try_parse_from(["mediagrab", "delete-batch", "b-1"]).unwrap();
        assert!(matches!(args.command, Command::DeleteBatch { batch_id } if batch_id == "b-1"));
    }

    fn schedule(argv: &[&str]) -> ScheduleCommand {
        match Args::try_parse_from(argv).unwrap().command {
            Command::Schedule { action } => action,
            other => panic!("expected schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_schedule_add_defaults_to_once() {
        let ScheduleCommand::Add(add) = schedule(&[
            "mediagrab",
            "schedule",
            "add",
            "--id",
            "g",
            "https://example.com/g",
        ]) else {
            panic!("expected add");
        };
        assert_eq!(add.id, "g");
        assert_eq!(add.urls, vec!["https://example.com/g"]);
        assert_eq!(ScheduleKind::from(add.every), ScheduleKind::Once);
        assert_eq!(add.interval_minutes, None);
        assert_eq!(add.start_in_minutes, 0);
    }

    #[test]
    fn test_cli_schedule_interval_needs_minutes() {
        let err = Args::try_parse_from([
            "mediagrab",
            "schedule",
            "add",
            "--id",
            "g",
            "--every",
            "interval",
            "https://example.com/g",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let ScheduleCommand::Add(add) = schedule(&[
            "mediagrab",
            "schedule",
            "add",
            "--id",
            "g",
            "--every",
            "interval",
            "--interval-minutes",
            "15",
            "https://example.com/g",
        ]) else {
            panic!("expected add");
        };
        assert_eq!(add.every, EveryArg::Interval);
        assert_eq!(add.interval_minutes, Some(15));
    }

    #[test]
    fn test_cli_schedule_run_poll_range() {
        assert!(matches!(
            schedule(&["mediagrab", "schedule", "run"]),
            ScheduleCommand::Run { poll_secs: 30 }
        ));
        let err =
            Args::try_parse_from(["mediagrab", "schedule", "run", "--poll-secs", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
