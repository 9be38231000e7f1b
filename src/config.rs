//! Engine configuration and the optional TOML config file.
//!
//! [`EngineConfig`] is an immutable value handed to the coordinator. The CLI
//! builds it from defaults, then the file config, then its own flags.
//!
//! File location:
//! 1. `$XDG_CONFIG_HOME/mediagrab/config.toml`
//! 2. `$HOME/.config/mediagrab/config.toml`
//!
//! ```toml
//! output_dir = "/data/media"
//! workers = 6
//! max_attempts = 5
//! naming = "content-hash"
//!
//! [headers."cdn.example.com"]
//! Referer = "https://example.com/"
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::db::DatabaseOptions;
use crate::download::{
    CONNECT_TIMEOUT_SECS, ClientOptions, DEFAULT_BASE_DELAY, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER, HostHeaders, NamingPolicy,
    READ_TIMEOUT_SECS, RetryPolicy,
};
use crate::pool::{DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS};
use crate::progress::{DEFAULT_REFRESH_INTERVAL, DEFAULT_SPEED_WINDOW};

const APP_DIR: &str = "mediagrab";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "mediagrab.db";

/// Allowed `max_attempts` range.
pub const MAX_ATTEMPTS_RANGE: (u32, u32) = (1, 10);

/// Allowed HTTP timeout range in seconds.
pub const TIMEOUT_SECS_RANGE: (u64, u64) = (1, 3600);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A numeric setting is outside its allowed range.
    #[error("invalid value for `{field}`: {value}. Expected range: {min}..={max}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Rejected value.
        value: u64,
        /// Lower bound.
        min: u64,
        /// Upper bound.
        max: u64,
    },

    /// Retry delays that would not grow from one attempt to the next.
    #[error(
        "invalid retry delays: need jitter ({jitter:?}) < base delay ({base:?}) <= max delay ({max:?})"
    )]
    RetryDelays {
        /// Configured jitter bound.
        jitter: Duration,
        /// First retry delay.
        base: Duration,
        /// Delay cap.
        max: Duration,
    },
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Everything the coordinator needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent transfer slots.
    pub workers: usize,
    /// Filename collision policy.
    pub naming: NamingPolicy,
    /// Root directory downloads are written under.
    pub dest_root: PathBuf,
    /// Extra request headers keyed by lowercase host.
    pub host_headers: HostHeaders,
    /// Attempts per task, first try included.
    pub max_attempts: u32,
    /// First retry delay.
    pub retry_base_delay: Duration,
    /// Retry delay cap.
    pub retry_max_delay: Duration,
    /// Upper bound of random jitter added to each retry delay.
    pub retry_jitter: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Maximum idle time between body reads.
    pub read_timeout: Duration,
    /// Minimum time between recomputed progress snapshots.
    pub progress_interval: Duration,
    /// Width of the speed sliding window.
    pub speed_window: Duration,
    /// `SQLite` file holding dedup records and batch history.
    pub database_path: PathBuf,
    /// Connection pool settings.
    pub database: DatabaseOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            naming: NamingPolicy::default(),
            dest_root: PathBuf::from("."),
            host_headers: HostHeaders::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_BASE_DELAY,
            retry_max_delay: DEFAULT_MAX_DELAY,
            retry_jitter: DEFAULT_MAX_JITTER,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            progress_interval: DEFAULT_REFRESH_INTERVAL,
            speed_window: DEFAULT_SPEED_WINDOW,
            database_path: default_database_path(),
            database: DatabaseOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Checks every ranged setting.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field, and
    /// [`ConfigError::RetryDelays`] unless jitter < base delay <= max delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "workers",
            self.workers as u64,
            MIN_WORKERS as u64,
            MAX_WORKERS as u64,
        )?;
        check_range(
            "max_attempts",
            u64::from(self.max_attempts),
            u64::from(MAX_ATTEMPTS_RANGE.0),
            u64::from(MAX_ATTEMPTS_RANGE.1),
        )?;
        let (min, max) = TIMEOUT_SECS_RANGE;
        check_range("connect_timeout_secs", self.connect_timeout.as_secs(), min, max)?;
        check_range("read_timeout_secs", self.read_timeout.as_secs(), min, max)?;
        if self.retry_jitter >= self.retry_base_delay || self.retry_base_delay > self.retry_max_delay
        {
            return Err(ConfigError::RetryDelays {
                jitter: self.retry_jitter,
                base: self.retry_base_delay,
                max: self.retry_max_delay,
            });
        }
        Ok(())
    }

    /// Retry policy from the retry settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
        .with_jitter(self.retry_jitter)
    }

    /// Transfer client options from the HTTP settings.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            host_headers: self.host_headers.clone(),
            naming: self.naming,
        }
    }

    /// Overlays values present in `file`.
    pub fn apply_file(&mut self, file: &FileConfig) {
        if let Some(dir) = &file.output_dir {
            self.dest_root.clone_from(dir);
        }
        if let Some(workers) = file.workers {
            self.workers = workers;
        }
        if let Some(attempts) = file.max_attempts {
            self.max_attempts = attempts;
        }
        if let Some(naming) = file.naming {
            self.naming = naming;
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.read_timeout_secs {
            self.read_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.progress_interval_ms {
            self.progress_interval = Duration::from_millis(ms);
        }
        if let Some(path) = &file.database {
            self.database_path.clone_from(path);
        }
        for (host, headers) in &file.headers {
            let entry = self.host_headers.entry(host.to_ascii_lowercase()).or_default();
            entry.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Destination root.
    pub output_dir: Option<PathBuf>,
    /// Worker slots.
    pub workers: Option<usize>,
    /// Attempts per task.
    pub max_attempts: Option<u32>,
    /// Naming policy label.
    pub naming: Option<NamingPolicy>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Progress refresh interval in milliseconds.
    pub progress_interval_ms: Option<u64>,
    /// Database file.
    pub database: Option<PathBuf>,
    /// `[headers."host"]` tables of header name to value.
    #[serde(default)]
    pub headers: BTreeMap<String, BTreeMap<String, String>>,
}

impl FileConfig {
    /// Parses TOML text. `path` is only used in errors.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or unknown keys.
    pub fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns `Read` or `Parse` errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }
}

/// Loads the config file from the default location, if one exists.
///
/// # Errors
///
/// Returns `Read` or `Parse` errors for a file that exists but is unusable.
pub fn load_default_file_config() -> Result<Option<(PathBuf, FileConfig)>, ConfigError> {
    let Some(path) = default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        debug!(path = %path.display(), "no config file");
        return Ok(None);
    }
    let config = FileConfig::load(&path)?;
    debug!(path = %path.display(), "loaded config file");
    Ok(Some((path, config)))
}

/// Default config file path from the environment.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE),
    )
}

/// Default database path: `$XDG_DATA_HOME/mediagrab/mediagrab.db`, then
/// `$HOME/.local/share/mediagrab/mediagrab.db`, then `./mediagrab.db`.
#[must_use]
pub fn default_database_path() -> PathBuf {
    database_path_from(
        env_var_non_empty_os("XDG_DATA_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn database_path_from(xdg_data_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(xdg) = xdg_data_home {
        return PathBuf::from(xdg).join(APP_DIR).join(DATABASE_FILE);
    }
    match home {
        Some(home) => PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR)
            .join(DATABASE_FILE),
        None => PathBuf::from(DATABASE_FILE),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = std::env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "workers", .. })
        ));

        let config = EngineConfig {
            max_attempts: 11,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "max_attempts", .. })
        ));

        let config = EngineConfig {
            read_timeout: Duration::from_secs(3601),
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1..=3600"), "{err}");
    }

    #[test]
    fn test_validate_rejects_jitter_not_below_base_delay() {
        let config = EngineConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::RetryDelays { .. }));
        assert!(err.to_string().contains("jitter"), "{err}");

        let config = EngineConfig {
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetryDelays { .. })
        ));

        let config = EngineConfig {
            retry_base_delay: Duration::from_millis(10),
            retry_jitter: Duration::ZERO,
            ..EngineConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_and_apply_file() {
        let raw = r#"
            output_dir = "/data/media"
            workers = 6
            max_attempts = 5
            naming = "content-hash"
            read_timeout_secs = 60

            [headers."CDN.example.com"]
            Referer = "https://example.com/"
        "#;
        let file = FileConfig::parse(raw, Path::new("config.toml")).unwrap();
        let mut config = EngineConfig::default();
        config.apply_file(&file);

        assert_eq!(config.dest_root, PathBuf::from("/data/media"));
        assert_eq!(config.workers, 6);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.naming, NamingPolicy::ContentHash);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(
            config.host_headers.get("cdn.example.com").unwrap(),
            &vec![("Referer".to_string(), "https://example.com/".to_string())]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let err = FileConfig::parse("concurrency = 3", Path::new("c.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = FileConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_config_path_resolution() {
        assert_eq!(
            config_path_from(Some("/xdg".into()), Some("/home/u".into())),
            Some(PathBuf::from("/xdg/mediagrab/config.toml"))
        );
        assert_eq!(
            config_path_from(None, Some("/home/u".into())),
            Some(PathBuf::from("/home/u/.config/mediagrab/config.toml"))
        );
        assert_eq!(config_path_from(None, None), None);
    }

    #[test]
    fn test_database_path_resolution() {
        assert_eq!(
            database_path_from(None, Some("/home/u".into())),
            PathBuf::from("/home/u/.local/share/mediagrab/mediagrab.db")
        );
        assert_eq!(database_path_from(None, None), PathBuf::from("mediagrab.db"));
    }
}
