//! Configuration for the queue engine.
//!
//! All knobs can be set programmatically through the builder methods or read
//! from the environment with [`Config::from_env`]. Environment variables share
//! the `CONVEYOR_` prefix; each maps to exactly one field.

use crate::job::{
    DEFAULT_VISIBILITY_TIMEOUT_MS, VISIBILITY_TIMEOUT_MAX_MS, VISIBILITY_TIMEOUT_MIN_MS,
};
use crate::retry::DEFAULT_RETRY_BASE_MS;
use crate::{ConveyorError, Result};
use std::time::Duration;
use uuid::Uuid;

/// Default number of concurrent polling lanes per worker process.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default lane sleep when no queue produced a job, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Default scheduler tick period, in milliseconds.
pub const DEFAULT_SCHEDULER_INTERVAL_MS: u64 = 1_000;
/// Default poison-pill observation window, in milliseconds.
pub const DEFAULT_POISON_WINDOW_MS: u64 = 60_000;
/// Default number of in-window failures that classifies a job as poison.
pub const DEFAULT_POISON_THRESHOLD: u32 = 3;

/// Runtime configuration shared by intake, scheduler and workers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the durable store.
    pub database_url: String,
    /// Connection string for the coordination store.
    pub redis_url: String,
    /// Identity this process claims jobs under.
    pub worker_id: String,
    /// Queues the worker polls, in round-robin order.
    pub queues: Vec<String>,
    /// Number of concurrent polling lanes.
    pub concurrency: usize,
    /// Retry cap applied to jobs that do not specify one.
    pub default_max_retries: i32,
    /// Base delay for the exponential retry backoff, in milliseconds.
    pub retry_base_ms: u64,
    /// Visibility timeout applied to jobs that do not specify one.
    pub default_visibility_timeout_ms: i64,
    /// Poison-pill observation window, in milliseconds.
    pub poison_window_ms: u64,
    /// Failures within the window that classify a job as poison.
    pub poison_threshold: u32,
    /// Lane sleep when a polling pass found no work.
    pub poll_interval: Duration,
    /// Scheduler tick period.
    pub scheduler_interval: Duration,
    /// Log level filter handed to the subscriber at startup.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/conveyor".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            queues: vec!["default".to_string()],
            concurrency: DEFAULT_CONCURRENCY,
            default_max_retries: crate::job::DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            default_visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            poison_window_ms: DEFAULT_POISON_WINDOW_MS,
            poison_threshold: DEFAULT_POISON_THRESHOLD,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            scheduler_interval: Duration::from_millis(DEFAULT_SCHEDULER_INTERVAL_MS),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Build a configuration from `CONVEYOR_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("CONVEYOR_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("CONVEYOR_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(id) = std::env::var("CONVEYOR_WORKER_ID") {
            config.worker_id = id;
        }
        if let Ok(queues) = std::env::var("CONVEYOR_QUEUES") {
            config.queues = queues
                .split(',')
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
        }
        config.concurrency = parse_env("CONVEYOR_CONCURRENCY", config.concurrency)?;
        config.default_max_retries =
            parse_env("CONVEYOR_MAX_RETRIES", config.default_max_retries)?;
        config.retry_base_ms = parse_env("CONVEYOR_RETRY_BASE_MS", config.retry_base_ms)?;
        config.default_visibility_timeout_ms = parse_env(
            "CONVEYOR_VISIBILITY_TIMEOUT_MS",
            config.default_visibility_timeout_ms,
        )?;
        config.poison_window_ms = parse_env("CONVEYOR_POISON_WINDOW_MS", config.poison_window_ms)?;
        config.poison_threshold = parse_env("CONVEYOR_POISON_THRESHOLD", config.poison_threshold)?;
        config.poll_interval = Duration::from_millis(parse_env(
            "CONVEYOR_POLL_INTERVAL_MS",
            config.poll_interval.as_millis() as u64,
        )?);
        config.scheduler_interval = Duration::from_millis(parse_env(
            "CONVEYOR_SCHEDULER_INTERVAL_MS",
            config.scheduler_interval.as_millis() as u64,
        )?);
        if let Ok(level) = std::env::var("CONVEYOR_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the queues polled by the worker.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the number of polling lanes.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the worker identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the poison-pill window and threshold.
    pub fn with_poison_detection(mut self, window_ms: u64, threshold: u32) -> Self {
        self.poison_window_ms = window_ms;
        self.poison_threshold = threshold;
        self
    }

    /// Check invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(ConveyorError::Config {
                message: "at least one queue must be configured".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConveyorError::Config {
                message: "concurrency must be at least 1".to_string(),
            });
        }
        if self.poison_threshold == 0 {
            return Err(ConveyorError::Config {
                message: "poison threshold must be at least 1".to_string(),
            });
        }
        if !(VISIBILITY_TIMEOUT_MIN_MS..=VISIBILITY_TIMEOUT_MAX_MS)
            .contains(&self.default_visibility_timeout_ms)
        {
            return Err(ConveyorError::Config {
                message: format!(
                    "default visibility timeout must be {VISIBILITY_TIMEOUT_MIN_MS}-{VISIBILITY_TIMEOUT_MAX_MS} ms"
                ),
            });
        }
        if self.retry_base_ms == 0 {
            return Err(ConveyorError::Config {
                message: "retry base delay must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConveyorError::Config {
            message: format!("invalid value for {name}: '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_queues() {
        let config = Config::default().with_queues(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let config = Config::default().with_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_poison_threshold() {
        let config = Config::default().with_poison_detection(60_000, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_visibility_timeout() {
        let mut config = Config::default();
        config.default_visibility_timeout_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = Config::default()
            .with_queues(vec!["emails".to_string(), "reports".to_string()])
            .with_concurrency(8)
            .with_worker_id("worker-test");
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.worker_id, "worker-test");
    }
}
