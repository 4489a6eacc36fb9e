//! Queue and worker configuration

use crate::error::{QueueError, Result};
use std::time::Duration;

/// Queue configuration
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Worker loops started when `start_workers` is given no count
    pub max_workers: usize,

    /// Attempts allowed per task unless the task overrides it
    pub max_attempts: u32,

    /// Sleep when no task is eligible
    pub poll_interval: Duration,

    /// Sleep after an unexpected worker loop error (e.g. store unreachable)
    pub error_backoff: Duration,

    /// Backoff base; the n-th retry waits `base * 2^n`
    pub retry_base_delay: Duration,

    /// Backoff ceiling
    pub retry_max_delay: Duration,

    /// How long `stop_workers` waits for in-flight tasks
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Create a new config builder
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Defaults overlaid with TASKQ_* environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize, _>(&lookup, "TASKQ_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "TASKQ_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TASKQ_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TASKQ_RETRY_BASE_SECS")? {
            config.retry_base_delay = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TASKQ_RETRY_MAX_SECS")? {
            config.retry_max_delay = Duration::from_secs(v);
        }

        Ok(config)
    }

    /// Delay before the next run of a task that has used `attempts` attempts
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        // 2^31 * any sane base already saturates the cap
        let factor = 2u32.saturating_pow(attempts.min(31));
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

/// Builder for QueueConfig
#[derive(Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Set default worker count
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Set default max attempts per task
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set poll interval
    pub fn poll_interval(mut self, duration: Duration) -> Self {
        self.config.poll_interval = duration;
        self
    }

    /// Set backoff after worker loop errors
    pub fn error_backoff(mut self, duration: Duration) -> Self {
        self.config.error_backoff = duration;
        self
    }

    /// Set retry backoff base and ceiling
    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
        self
    }

    /// Set shutdown wait
    pub fn shutdown_timeout(mut self, duration: Duration) -> Self {
        self.config.shutdown_timeout = duration;
        self
    }

    /// Build the config
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
