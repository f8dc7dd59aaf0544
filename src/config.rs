//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Orchestrator configuration.
///
/// Built once at startup and handed to each component at construction.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often workers (and the heartbeat monitor) are expected to beat.
    pub heartbeat_interval: Duration,
    /// Silence longer than this declares a busy worker failed.
    pub worker_timeout: Duration,
    /// Retries allowed per job before it fails terminally.
    pub max_retries: u32,
    /// Multiplier applied per retry attempt.
    pub backoff_base: f64,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum number of non-terminated workers.
    pub max_concurrent_workers: usize,
    /// Reset timed-out workers straight back to IDLE instead of leaving them FAILED.
    pub auto_recover: bool,
    /// Fallback scheduler tick when no state-change wakes it earlier.
    pub scheduler_interval: Duration,
    /// Restarts of the heartbeat monitor before escalating.
    pub monitor_max_restarts: u32,
    /// SQLite/libSQL database file.
    pub db_path: PathBuf,
    /// HTTP bind address.
    pub http_addr: String,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            worker_timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_base: 2.0,
            initial_delay: Duration::from_secs(1),
            max_concurrent_workers: 32,
            auto_recover: false,
            scheduler_interval: Duration::from_secs(1),
            monitor_max_restarts: 3,
            db_path: PathBuf::from("./data/orchestrator.db"),
            http_addr: "0.0.0.0:8080".to_string(),
            log_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Build config from `ORCH_*` environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup and validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            heartbeat_interval: millis(
                &lookup,
                "ORCH_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            worker_timeout: millis(&lookup, "ORCH_WORKER_TIMEOUT_MS", defaults.worker_timeout)?,
            max_retries: parsed(&lookup, "ORCH_MAX_RETRIES", defaults.max_retries)?,
            backoff_base: parsed(&lookup, "ORCH_BACKOFF_BASE", defaults.backoff_base)?,
            initial_delay: millis(&lookup, "ORCH_INITIAL_DELAY_MS", defaults.initial_delay)?,
            max_concurrent_workers: parsed(
                &lookup,
                "ORCH_MAX_WORKERS",
                defaults.max_concurrent_workers,
            )?,
            auto_recover: parsed(&lookup, "ORCH_AUTO_RECOVER", defaults.auto_recover)?,
            scheduler_interval: millis(
                &lookup,
                "ORCH_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval,
            )?,
            monitor_max_restarts: parsed(
                &lookup,
                "ORCH_MONITOR_MAX_RESTARTS",
                defaults.monitor_max_restarts,
            )?,
            db_path: lookup("ORCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_addr: lookup("ORCH_HTTP_ADDR").unwrap_or(defaults.http_addr),
            log_dir: lookup("ORCH_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the relationships between settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("ORCH_HEARTBEAT_INTERVAL_MS", "must be greater than zero"));
        }
        if self.worker_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutNotAboveInterval {
                timeout: self.worker_timeout,
                interval: self.heartbeat_interval,
            });
        }
        if self.scheduler_interval.is_zero() {
            return Err(invalid("ORCH_SCHEDULER_INTERVAL_MS", "must be greater than zero"));
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(invalid(
                "ORCH_BACKOFF_BASE",
                &format!("must be a finite number >= 1.0, got {}", self.backoff_base),
            ));
        }
        if self.max_concurrent_workers == 0 {
            return Err(invalid("ORCH_MAX_WORKERS", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}
