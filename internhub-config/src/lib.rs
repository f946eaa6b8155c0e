//! Configuration loading for the InternHub bulk import pipeline.
//!
//! Configuration is resolved in three layers, later layers winning:
//! built-in defaults, an optional config file (JSON, YAML or TOML, inferred
//! from the extension), and `INTERNHUB_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Raw, fully-optional view of a config file. Absent sections and fields
/// fall back to defaults during merging.
#[derive(Debug, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub queue: Option<QueueSection>,
    #[serde(default)]
    pub workers: Option<WorkersSection>,
    #[serde(default)]
    pub retention: Option<RetentionSection>,
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_base_secs: Option<u64>,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub completed_keep: Option<usize>,
    #[serde(default)]
    pub completed_max_age_hours: Option<u64>,
    #[serde(default)]
    pub failed_keep: Option<usize>,
    #[serde(default)]
    pub max_pending: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WorkersSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub maintenance_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RetentionSection {
    #[serde(default)]
    pub max_age_days: Option<u64>,
    #[serde(default)]
    pub orphan_timeout_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the
/// extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try to parse config by attempting each enabled format.
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s;
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete pipeline configuration with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub retention: RetentionConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueConfig {
    /// Redelivery attempts after a failed dispatch before an item is parked
    /// as failed.
    pub max_retries: u32,
    /// First backoff delay; doubles on each subsequent retry.
    pub backoff_base_secs: u64,
    /// Heartbeat window for stall detection on active items.
    pub heartbeat_secs: u64,
    pub completed_keep: usize,
    pub completed_max_age_hours: u64,
    pub failed_keep: usize,
    /// Upper bound on pending items; `None` means unbounded.
    pub max_pending: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkersConfig {
    pub concurrency: usize,
    /// Row-failure ratio above which a returned batch is treated as a job
    /// failure. `None` preserves "partial failures still complete".
    pub failure_threshold: Option<f64>,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionConfig {
    pub max_age_days: u64,
    pub orphan_timeout_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                max_retries: 3,
                backoff_base_secs: 5,
                heartbeat_secs: 60,
                completed_keep: 100,
                completed_max_age_hours: 24,
                failed_keep: 50,
                max_pending: None,
            },
            workers: WorkersConfig {
                concurrency: 2,
                failure_threshold: None,
                maintenance_interval_secs: 5,
            },
            retention: RetentionConfig {
                max_age_days: 30,
                orphan_timeout_minutes: 15,
            },
            database: DatabaseConfig {
                driver: "sqlite".to_string(),
                path: Some("internhub.sqlite".to_string()),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(()),
    }
}

/// Helper macro to apply optional value if present.
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        let raw = load_raw_from_file(p)?;
        if let Some(queue) = raw.queue {
            apply_opt!(cfg.queue.max_retries, queue.max_retries);
            apply_opt!(cfg.queue.backoff_base_secs, queue.backoff_base_secs);
            apply_opt!(cfg.queue.heartbeat_secs, queue.heartbeat_secs);
            apply_opt!(cfg.queue.completed_keep, queue.completed_keep);
            apply_opt!(
                cfg.queue.completed_max_age_hours,
                queue.completed_max_age_hours
            );
            apply_opt!(cfg.queue.failed_keep, queue.failed_keep);
            apply_opt!(cfg.queue.max_pending, queue.max_pending, wrap);
        }
        if let Some(workers) = raw.workers {
            apply_opt!(cfg.workers.concurrency, workers.concurrency);
            apply_opt!(
                cfg.workers.failure_threshold,
                workers.failure_threshold,
                wrap
            );
            apply_opt!(
                cfg.workers.maintenance_interval_secs,
                workers.maintenance_interval_secs
            );
        }
        if let Some(retention) = raw.retention {
            apply_opt!(cfg.retention.max_age_days, retention.max_age_days);
            apply_opt!(
                cfg.retention.orphan_timeout_minutes,
                retention.orphan_timeout_minutes
            );
        }
        if let Some(db) = raw.database {
            apply_opt!(cfg.database.driver, db.driver);
            apply_opt!(cfg.database.path, db.path, wrap);
        }
        if let Some(logging) = raw.logging {
            apply_opt!(cfg.logging.level, logging.level);
            apply_opt!(cfg.logging.json, logging.json);
        }
    }

    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;

    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.workers.concurrency == 0 {
        return Err(ConfigError::Validation(
            "workers.concurrency must be at least 1".into(),
        ));
    }
    if let Some(t) = cfg.workers.failure_threshold {
        if !(0.0..=1.0).contains(&t) {
            return Err(ConfigError::Validation(
                "workers.failure_threshold must be between 0.0 and 1.0".into(),
            ));
        }
    }
    Ok(())
}

/// Helper to parse env var as a specific type.
#[inline]
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Helper to parse env var as bool.
#[inline]
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {}", key))),
        Err(_) => Ok(None),
    }
}

#[inline]
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Apply all environment variable overrides to config.
fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    // Queue
    if let Some(v) = env_parse::<u32>("INTERNHUB_QUEUE_MAX_RETRIES")? {
        cfg.queue.max_retries = v;
    }
    if let Some(v) = env_parse::<u64>("INTERNHUB_QUEUE_BACKOFF_BASE_SECS")? {
        cfg.queue.backoff_base_secs = v;
    }
    if let Some(v) = env_parse::<u64>("INTERNHUB_QUEUE_HEARTBEAT_SECS")? {
        cfg.queue.heartbeat_secs = v;
    }
    if let Some(v) = env_parse::<usize>("INTERNHUB_QUEUE_COMPLETED_KEEP")? {
        cfg.queue.completed_keep = v;
    }
    if let Some(v) = env_parse::<u64>("INTERNHUB_QUEUE_COMPLETED_MAX_AGE_HOURS")? {
        cfg.queue.completed_max_age_hours = v;
    }
    if let Some(v) = env_parse::<usize>("INTERNHUB_QUEUE_FAILED_KEEP")? {
        cfg.queue.failed_keep = v;
    }
    if let Some(v) = env_parse::<usize>("INTERNHUB_QUEUE_MAX_PENDING")? {
        cfg.queue.max_pending = Some(v);
    }

    // Workers
    if let Some(v) = env_parse::<usize>("INTERNHUB_WORKERS_CONCURRENCY")? {
        cfg.workers.concurrency = v;
    }
    if let Some(v) = env_parse::<f64>("INTERNHUB_WORKERS_FAILURE_THRESHOLD")? {
        cfg.workers.failure_threshold = Some(v);
    }
    if let Some(v) = env_parse::<u64>("INTERNHUB_WORKERS_MAINTENANCE_INTERVAL_SECS")? {
        cfg.workers.maintenance_interval_secs = v;
    }

    // Retention
    if let Some(v) = env_parse::<u64>("INTERNHUB_RETENTION_MAX_AGE_DAYS")? {
        cfg.retention.max_age_days = v;
    }
    if let Some(v) = env_parse::<u64>("INTERNHUB_RETENTION_ORPHAN_TIMEOUT_MINUTES")? {
        cfg.retention.orphan_timeout_minutes = v;
    }

    // Database
    if let Some(v) = env_str("INTERNHUB_DB_DRIVER") {
        cfg.database.driver = v;
    }
    if let Some(v) = env_str("INTERNHUB_DB_PATH") {
        cfg.database.path = Some(v);
    }

    // Logging
    if let Some(v) = env_str("INTERNHUB_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_bool("INTERNHUB_LOG_JSON")? {
        cfg.logging.json = v;
    }

    Ok(())
}
