use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{AppError, AppResult};
use defaults::*;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub import: ImportConfig,
    /// Recurring task definitions used by the built-in recurrence policy
    #[serde(default)]
    pub recurring: Vec<RecurringTaskConfig>,
}

/// Identifiers of the sequential coordination queue and the task types it hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_coordination_queue_id")]
    pub queue_id: String,
    #[serde(default = "default_reschedule_task_type")]
    pub reschedule_task_type: String,
    #[serde(default = "default_import_task_type")]
    pub import_task_type: String,
    /// Backoff before a queued reschedule that failed again is retried
    #[serde(default = "default_reschedule_retry_delay", with = "duration_serde::duration")]
    pub retry_delay: Duration,
    #[serde(default = "default_reschedule_retry_jitter_percent")]
    pub retry_jitter_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How often the runner looks for ready tasks
    #[serde(default = "default_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,
    /// Maximum running tasks per parallel queue
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long shutdown waits for running jobs
    #[serde(default = "default_shutdown_grace", with = "duration_serde::duration")]
    pub shutdown_grace: Duration,
    /// Identifies this server in task claims
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_transaction_timeout", with = "duration_serde::duration")]
    pub transaction_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Pause between failed import attempts (zero retries immediately)
    #[serde(default = "default_import_retry_delay", with = "duration_serde::duration")]
    pub retry_delay: Duration,
    #[serde(default = "default_import_retry_jitter_percent")]
    pub retry_jitter_percent: u8,
}

/// A `(queue, task type)` pair that should be re-armed after every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTaskConfig {
    pub queue_id: String,
    pub task_type: String,
    /// Cron expression with a seconds field, e.g. `0 0/15 * * * *`
    #[serde(default)]
    pub cron: Option<String>,
    /// Fixed delay after each run, e.g. `1h`
    #[serde(default, with = "duration_serde::option_duration")]
    pub interval: Option<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_coordination_queue_id() -> String {
    DEFAULT_COORDINATION_QUEUE_ID.to_string()
}

fn default_reschedule_task_type() -> String {
    DEFAULT_RESCHEDULE_TASK_TYPE.to_string()
}

fn default_import_task_type() -> String {
    DEFAULT_IMPORT_TASK_TYPE.to_string()
}

fn default_reschedule_retry_delay() -> Duration {
    duration_or(DEFAULT_RESCHEDULE_RETRY_DELAY, Duration::from_secs(30))
}

fn default_reschedule_retry_jitter_percent() -> u8 {
    DEFAULT_RESCHEDULE_RETRY_JITTER_PERCENT
}

fn default_poll_interval() -> Duration {
    duration_or(DEFAULT_POLL_INTERVAL, Duration::from_secs(5))
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_shutdown_grace() -> Duration {
    duration_or(DEFAULT_SHUTDOWN_GRACE, Duration::from_secs(30))
}

fn default_node_id() -> String {
    DEFAULT_NODE_ID.to_string()
}

fn default_transaction_timeout() -> Duration {
    duration_or(DEFAULT_TRANSACTION_TIMEOUT, Duration::from_secs(90))
}

fn default_import_retry_delay() -> Duration {
    duration_or(DEFAULT_IMPORT_RETRY_DELAY, Duration::ZERO)
}

fn default_import_retry_jitter_percent() -> u8 {
    DEFAULT_IMPORT_RETRY_JITTER_PERCENT
}

fn default_enabled() -> bool {
    true
}

fn duration_or(value: &str, fallback: Duration) -> Duration {
    duration_serde::parse(value).unwrap_or(fallback)
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            queue_id: default_coordination_queue_id(),
            reschedule_task_type: default_reschedule_task_type(),
            import_task_type: default_import_task_type(),
            retry_delay: default_reschedule_retry_delay(),
            retry_jitter_percent: default_reschedule_retry_jitter_percent(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_concurrency: default_max_concurrency(),
            shutdown_grace: default_shutdown_grace(),
            node_id: default_node_id(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: default_transaction_timeout(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            retry_delay: default_import_retry_delay(),
            retry_jitter_percent: default_import_retry_jitter_percent(),
        }
    }
}

impl Config {
    /// Load configuration from the file named by `CONFIG_FILE` (or `config.toml`)
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Layer defaults, the TOML file (if present) and `TASKMANAGER_*` environment variables
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if Path::new(config_file).exists() {
            figment = figment.merge(Toml::file(config_file));
        } else {
            info!("Config file {} not found, using defaults", config_file);
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {config_file}"))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string on top of the defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(contents))
            .extract()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the subsystem cannot run with
    pub fn validate(&self) -> AppResult<()> {
        self.coordination.validate()?;

        if self.dispatcher.poll_interval.is_zero() {
            return Err(AppError::configuration(
                "dispatcher.poll_interval must be greater than zero",
            ));
        }
        if self.dispatcher.max_concurrency == 0 {
            return Err(AppError::configuration("dispatcher.max_concurrency must be at least 1"));
        }
        if self.dispatcher.node_id.trim().is_empty() {
            return Err(AppError::configuration("dispatcher.node_id must not be empty"));
        }
        if self.store.transaction_timeout.is_zero() {
            return Err(AppError::configuration(
                "store.transaction_timeout must be greater than zero",
            ));
        }
        if self.import.retry_jitter_percent > 100 {
            return Err(AppError::configuration(
                "import.retry_jitter_percent must be between 0 and 100",
            ));
        }

        for entry in &self.recurring {
            entry.validate()?;
        }

        Ok(())
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.queue_id.trim().is_empty() {
            return Err(AppError::configuration("coordination.queue_id must not be empty"));
        }
        if self.reschedule_task_type.trim().is_empty() || self.import_task_type.trim().is_empty() {
            return Err(AppError::configuration("coordination task types must not be empty"));
        }
        if self.reschedule_task_type == self.import_task_type {
            return Err(AppError::configuration(format!(
                "coordination task types must be distinct (both are '{}')",
                self.import_task_type
            )));
        }
        // A zero backoff would re-run a failing reschedule on every poll
        if self.retry_delay.is_zero() {
            return Err(AppError::configuration(
                "coordination.retry_delay must be greater than zero",
            ));
        }
        if self.retry_jitter_percent > 100 {
            return Err(AppError::configuration(
                "coordination.retry_jitter_percent must be between 0 and 100",
            ));
        }
        Ok(())
    }
}

impl RecurringTaskConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.queue_id.trim().is_empty() || self.task_type.trim().is_empty() {
            return Err(AppError::configuration(
                "recurring entries need a queue_id and a task_type",
            ));
        }
        match (&self.cron, &self.interval) {
            (Some(_), Some(_)) => Err(AppError::configuration(format!(
                "recurring {}/{} sets both cron and interval",
                self.queue_id, self.task_type
            ))),
            (None, None) => Err(AppError::configuration(format!(
                "recurring {}/{} needs either cron or interval",
                self.queue_id, self.task_type
            ))),
            (None, Some(interval)) if interval.is_zero() => Err(AppError::configuration(format!(
                "recurring {}/{} interval must be greater than zero",
                self.queue_id, self.task_type
            ))),
            _ => Ok(()),
        }
    }
}
