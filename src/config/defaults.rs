/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Coordination queue identifiers.
// These must stay constant for the lifetime of a deployment: pending
// executions are matched by exact id/type string equality.
pub const DEFAULT_COORDINATION_QUEUE_ID: &str = "taskmanager-extensions.sequential";
pub const DEFAULT_RESCHEDULE_TASK_TYPE: &str = "taskmanager-extensions.reschedule";
pub const DEFAULT_IMPORT_TASK_TYPE: &str = "taskmanager-extensions.import-replication-package";
pub const DEFAULT_RESCHEDULE_RETRY_DELAY: &str = "30s";
pub const DEFAULT_RESCHEDULE_RETRY_JITTER_PERCENT: u8 = 25;

// Dispatcher defaults
pub const DEFAULT_POLL_INTERVAL: &str = "5s";
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_SHUTDOWN_GRACE: &str = "30s";
pub const DEFAULT_NODE_ID: &str = "node-1";

// Store defaults
pub const DEFAULT_TRANSACTION_TIMEOUT: &str = "90s";

// Import defaults
pub const DEFAULT_IMPORT_RETRY_DELAY: &str = "0s";
pub const DEFAULT_IMPORT_RETRY_JITTER_PERCENT: u8 = 25;

// Environment
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "TASKMANAGER_";
