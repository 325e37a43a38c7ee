//! Job subsystem configuration, resolved from the environment over defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::types::{BackoffPolicy, BackoffStrategy, DEFAULT_MAX_RETRIES};

pub const DATABASE_URL_VAR: &str = "COURIER_DATABASE_URL";
pub const BUSY_TIMEOUT_VAR: &str = "COURIER_DB_BUSY_TIMEOUT_MS";
pub const POLL_INTERVAL_VAR: &str = "COURIER_JOBS_POLL_INTERVAL_MS";
pub const STALE_TIMEOUT_VAR: &str = "COURIER_JOBS_STALE_TIMEOUT_MS";
pub const BACKOFF_BASE_VAR: &str = "COURIER_JOBS_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_VAR: &str = "COURIER_JOBS_BACKOFF_MAX_MS";
pub const MAX_RETRIES_VAR: &str = "COURIER_JOBS_MAX_RETRIES";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/app.db";

#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    pub database_url: String,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub default_max_retries: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            busy_timeout: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(1_000),
            stale_timeout: Duration::from_millis(300_000),
            backoff_base: Duration::from_millis(30_000),
            backoff_max: Duration::from_millis(3_600_000),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl JobsConfig {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from any key lookup. Missing keys take the default; unparseable
    /// values log a warning and take the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parsed::<u64, _>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            database_url: lookup(DATABASE_URL_VAR)
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.database_url),
            busy_timeout: millis(BUSY_TIMEOUT_VAR, defaults.busy_timeout),
            poll_interval: millis(POLL_INTERVAL_VAR, defaults.poll_interval),
            stale_timeout: millis(STALE_TIMEOUT_VAR, defaults.stale_timeout),
            backoff_base: millis(BACKOFF_BASE_VAR, defaults.backoff_base),
            backoff_max: millis(BACKOFF_MAX_VAR, defaults.backoff_max),
            default_max_retries: parsed(&lookup, MAX_RETRIES_VAR)
                .unwrap_or(defaults.default_max_retries),
        }
    }

    /// Exponential backoff from `backoff_base`, capped at `backoff_max`.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: self.backoff_base,
            max_delay: self.backoff_max.max(self.backoff_base),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "invalid config value; using default");
            None
        }
    }
}
