//! pgsched Core - scheduled read-only queries against Postgres sources
//!
//! This crate provides the engine behind the `pgsched` binary:
//! - Registry: validated snapshot of enabled job definitions
//! - Scheduler: cron/interval triggers, dispatch loop, worker pool
//! - Executor: read-only validation, bounded execution, result shaping
//! - Store: append-only run history with result blobs
//! - Vault and rotation: sealed data-source credentials and key rotation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod datasource;
pub mod error;
pub mod executor;
pub mod redact;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod scheduler;
pub mod store;
pub mod vault;

#[cfg(test)]
mod test_support;

pub use datasource::{DataSource, DataSourceStore, MemoryDataSourceStore, SealedCredential};
pub use error::{format_error_for_cli, Error, ErrorKind, Result, UserFriendlyError};
pub use executor::{
    ExecError, ExecuteOptions, Executor, ExecutorConfig, JobRunner, PgSourceConnector, ResultTable,
    RunResult, SourceConnector, SourcePoolConfig,
};
pub use redact::Redactor;
pub use registry::{
    validate_job, ConfigError, JobRegistry, JobSource, MemoryJobSource, QueryJob,
    RegistrySnapshot, ScheduleDescriptor, ScheduleType,
};
pub use retry::RetryConfig;
pub use rotation::{KeyRotator, RotationError, RotationReport};
pub use scheduler::{
    FireHandler, FireTask, JobState, Scheduler, SchedulerConfig, SchedulerError, SchedulerEvent,
    Trigger, WorkerPool,
};
pub use store::{
    MemoryResultStore, PoolConfig, PostgresStore, QueryRun, QueryRunBlob, RangeQuery, ResultStore,
    RunRecord, RunStatus,
};
pub use vault::{CredentialVault, VaultError};
