//! Configuration for the scheduler host.
//!
//! Values are layered with the `config` crate: compiled defaults, then an
//! optional file (`config/stackrun.toml` unless another path is given), then
//! environment overrides such as `STACKRUN_SCHEDULER__MAX_TASKS_PER_RUNNER=8`.

use crate::constants::defaults;
use crate::error::{SchedulerError, SchedulerResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/stackrun.toml";
pub const ENV_PREFIX: &str = "STACKRUN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackrunConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub leader: LeaderConfig,
    pub runner: RunnerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
        }
    }
}

/// Tunables for the scheduling loop, executor, and step runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Upper bound of pending tasks fetched per tick
    pub pending_batch_size: usize,
    /// Advisory cap of concurrently dispatched tasks per runner
    pub max_tasks_per_runner: usize,
    pub approval_poll_interval_ms: u64,
    /// Fixed backoff between status-stream reconnects
    pub status_retry_backoff_ms: u64,
    /// Used when a task row carries no positive step timeout
    pub default_step_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: defaults::TICK_INTERVAL_MS,
            pending_batch_size: defaults::PENDING_BATCH_SIZE,
            max_tasks_per_runner: defaults::MAX_TASKS_PER_RUNNER,
            approval_poll_interval_ms: defaults::APPROVAL_POLL_INTERVAL_MS,
            status_retry_backoff_ms: defaults::STATUS_RETRY_BACKOFF_MS,
            default_step_timeout_secs: defaults::STEP_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn approval_poll_interval(&self) -> Duration {
        Duration::from_millis(self.approval_poll_interval_ms)
    }

    pub fn status_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.status_retry_backoff_ms)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub lock_key: String,
    pub retry_backoff_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_key: defaults::LOCK_KEY.to_string(),
            retry_backoff_ms: defaults::LOCK_RETRY_BACKOFF_MS,
            heartbeat_interval_ms: defaults::LOCK_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl LeaderConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Runner id to base URL
    pub addresses: HashMap<String, String>,
    pub request_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            addresses: HashMap::new(),
            request_timeout_ms: defaults::RUNNER_REQUEST_TIMEOUT_MS,
        }
    }
}

impl RunnerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root_dir: String,
    /// Larger artifacts are truncated, keeping the tail
    pub max_content_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: defaults::STORAGE_ROOT_DIR.to_string(),
            max_content_bytes: defaults::MAX_CONTENT_BYTES,
        }
    }
}

impl StackrunConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> SchedulerResult<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit file (which may be absent) and environment
    pub fn load_from(path: &Path) -> SchedulerResult<Self> {
        debug!(path = %path.display(), "Loading scheduler configuration");

        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        let scheduler = &self.scheduler;
        let checks = [
            (scheduler.tick_interval_ms == 0, "scheduler.tick_interval_ms"),
            (scheduler.pending_batch_size == 0, "scheduler.pending_batch_size"),
            (scheduler.max_tasks_per_runner == 0, "scheduler.max_tasks_per_runner"),
            (
                scheduler.approval_poll_interval_ms == 0,
                "scheduler.approval_poll_interval_ms",
            ),
            (
                scheduler.status_retry_backoff_ms == 0,
                "scheduler.status_retry_backoff_ms",
            ),
            (self.leader.retry_backoff_ms == 0, "leader.retry_backoff_ms"),
            (
                self.leader.heartbeat_interval_ms == 0,
                "leader.heartbeat_interval_ms",
            ),
            (self.storage.max_content_bytes == 0, "storage.max_content_bytes"),
        ];

        if let Some((_, field)) = checks.iter().find(|(invalid, _)| *invalid) {
            return Err(SchedulerError::Configuration(format!(
                "{field} must be greater than zero"
            )));
        }

        if self.leader.lock_key.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "leader.lock_key must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
