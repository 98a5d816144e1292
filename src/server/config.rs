//! Server configuration types
//!
//! Every section has serde defaults so a partial file (or none) still
//! deserializes; `config/default.toml` spells the same values out.

use pgsched_core::{ExecutorConfig, PoolConfig, Redactor, SchedulerConfig, SourcePoolConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub scheduler: SchedulerAppConfig,
    #[serde(default)]
    pub executor: ExecutorAppConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata database (jobs, data sources, run history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL; empty means unset
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_db_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            acquire_timeout_secs: self.acquire_timeout_secs,
        }
    }
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

/// Key files for sealed credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_public_key_path")]
    pub public_key_path: PathBuf,
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    /// Version credentials must carry to be opened with `private_key_path`
    #[serde(default = "default_key_version")]
    pub key_version: i32,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            public_key_path: default_public_key_path(),
            private_key_path: default_private_key_path(),
            key_version: default_key_version(),
        }
    }
}

fn default_public_key_path() -> PathBuf {
    PathBuf::from("./public_key.base64")
}
fn default_private_key_path() -> PathBuf {
    PathBuf::from("./private_key.base64")
}
fn default_key_version() -> i32 {
    1
}

/// Scheduler configuration (exposed to TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerAppConfig {
    /// How often job definitions are reloaded
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Slack past an execution deadline before a running mark is cleared
    #[serde(default = "default_watchdog_grace_secs")]
    pub watchdog_grace_secs: u64,
    /// Period for interval jobs without an expression
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    /// Longest sleep between ticks
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
    /// How long shutdown waits for in-flight executions
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerAppConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            watchdog_grace_secs: default_watchdog_grace_secs(),
            default_interval_secs: default_interval_secs(),
            max_sleep_ms: default_max_sleep_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SchedulerAppConfig {
    /// Engine settings; `statement_timeout_ms` bounds jobs without their own
    pub fn engine(&self, statement_timeout_ms: u64) -> SchedulerConfig {
        SchedulerConfig::new()
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_capacity)
            .with_max_sleep(Duration::from_millis(self.max_sleep_ms))
            .with_execution_timeout_ms(statement_timeout_ms)
            .with_watchdog_grace(Duration::from_secs(self.watchdog_grace_secs))
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
    }
}

fn default_reconcile_interval_secs() -> u64 {
    30
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    64
}
fn default_watchdog_grace_secs() -> u64 {
    30
}
fn default_interval_secs() -> u64 {
    21_600
}
fn default_max_sleep_ms() -> u64 {
    5_000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

/// Executor configuration (exposed to TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorAppConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for jobs without their own `timeout_ms`
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Hard cap on rows kept per run
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    /// Connections kept per data source
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: u32,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ExecutorAppConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            max_rows: default_max_rows(),
            pool_max_connections: default_pool_max_connections(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

impl ExecutorAppConfig {
    pub fn engine(&self) -> ExecutorConfig {
        ExecutorConfig::new()
            .with_max_rows(self.max_rows)
            .with_statement_timeout_ms(self.statement_timeout_ms)
    }

    pub fn source_pools(&self) -> SourcePoolConfig {
        SourcePoolConfig {
            max_connections: self.pool_max_connections,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_statement_timeout_ms() -> u64 {
    30_000
}
fn default_max_rows() -> u64 {
    1_000
}
fn default_pool_max_connections() -> u32 {
    2
}
fn default_pool_idle_timeout_secs() -> u64 {
    300
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Stored error messages are truncated to this many bytes
    #[serde(default = "default_max_error_bytes")]
    pub max_error_bytes: usize,
    /// Keys whose `key=value` pairs are masked in stored errors
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            dir: None,
            max_error_bytes: default_max_error_bytes(),
            redact_keys: default_redact_keys(),
        }
    }
}

impl LoggingConfig {
    pub fn redactor(&self) -> Redactor {
        Redactor::new(&self.redact_keys, self.max_error_bytes)
    }
}

fn default_max_error_bytes() -> usize {
    4_096
}
fn default_redact_keys() -> Vec<String> {
    [
        "password",
        "new_password",
        "current_password",
        "token",
        "authorization",
        "secret",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
