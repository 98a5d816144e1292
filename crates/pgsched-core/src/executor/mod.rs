//! Executor - validated, bounded, read-only query execution
//!
//! One call runs one job against one data source:
//!
//! 1. static read-only validation (no connection is opened on failure)
//! 2. credential recovery through the [`CredentialVault`]
//! 3. execution through a [`SourceConnector`] under a deadline, wrapped in
//!    an outer `LIMIT`
//! 4. with `persist`, the run is appended to the [`ResultStore`] whatever
//!    the outcome; without it nothing is written
//!
//! Failure classes follow [`ErrorKind`].

mod runner;
mod source;
mod table;
mod validation;


use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::datasource::DataSource;
use crate::error::ErrorKind;
use crate::redact::Redactor;
use crate::registry::QueryJob;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::{NewRun, ResultStore, RunOutcome, StoreError};
use crate::vault::{CredentialVault, VaultError};

pub use runner::JobRunner;
#[cfg(test)]
pub use source::MockSourceConnector;
pub use source::{ConnectTarget, PgSourceConnector, SourceConnector, SourcePoolConfig};
pub use table::{Column, ColumnType, ResultTable};
pub use validation::{validate_sql, QueryValidationError, ValidatedQuery, LIMIT_ALIAS};

/// Execution failures
#[derive(Debug, Error)]
pub enum ExecError {
    /// Statement is not a single read-only query
    #[error("query validation failed: {0}")]
    Validation(#[from] QueryValidationError),

    /// Credential could not be opened
    #[error("credential error: {0}")]
    Credential(#[from] VaultError),

    /// Source unreachable or authentication rejected
    #[error("connection error: {0}")]
    Connection(String),

    /// Deadline exceeded
    #[error("query timed out after {timeout_ms} ms")]
    Timeout {
        /// Applied deadline
        timeout_ms: u64,
    },

    /// Runtime failure reported by the source, or an unshapeable result
    #[error("query error: {0}")]
    Query(String),

    /// Job references a data source that does not exist
    #[error("data source {0} not found")]
    DataSourceNotFound(i64),

    /// Run history could not be written
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl ExecError {
    /// Failure class
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Validation(_) => ErrorKind::QueryValidation,
            ExecError::Credential(_) => ErrorKind::Decryption,
            ExecError::Connection(_) => ErrorKind::Connection,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::Query(_) => ErrorKind::Query,
            ExecError::DataSourceNotFound(_) => ErrorKind::Config,
            ExecError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// A second run for the job was refused because one is in progress
    pub fn is_already_running(&self) -> bool {
        matches!(self, ExecError::Persistence(StoreError::AlreadyRunning { .. }))
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard cap on returned rows, applied on top of any job limit
    pub max_rows: u64,
    /// Deadline when neither the call nor the job sets one
    pub statement_timeout_ms: u64,
    /// Retry policy for run-history writes
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            statement_timeout_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the row cap
    pub fn with_max_rows(mut self, rows: u64) -> Self {
        self.max_rows = rows.max(1);
        self
    }

    /// Set the default deadline
    pub fn with_statement_timeout_ms(mut self, ms: u64) -> Self {
        self.statement_timeout_ms = ms.max(1);
        self
    }

    /// Set the persistence retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Row limit; falls back to the job's, capped by `max_rows`
    pub row_limit: Option<u64>,
    /// Deadline in milliseconds; falls back to the job's, then the default
    pub timeout_ms: Option<u64>,
    /// Append the run to history
    pub persist: bool,
    /// Fire time the run belongs to (defaults to now)
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl ExecuteOptions {
    /// Ad-hoc execution that never touches run history
    pub fn dry_run() -> Self {
        Self::default()
    }

    /// Scheduled execution for a fire time
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            persist: true,
            scheduled_at: Some(at),
            ..Self::default()
        }
    }

    /// Set the row limit
    pub fn with_row_limit(mut self, limit: u64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    /// Set the deadline
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Successful execution
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Persisted run id (`None` for dry runs)
    pub run_id: Option<i64>,
    /// Shaped rows
    pub table: ResultTable,
    /// Number of rows
    pub row_count: usize,
    /// Wall-clock time spent executing
    pub duration_ms: u64,
}

/// Runs jobs against their data sources
pub struct Executor {
    vault: Arc<CredentialVault>,
    connector: Arc<dyn SourceConnector>,
    store: Arc<dyn ResultStore>,
    redactor: Redactor,
    config: ExecutorConfig,
}

impl Executor {
    /// Create an executor
    pub fn new(
        vault: Arc<CredentialVault>,
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn ResultStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            vault,
            connector,
            store,
            redactor: Redactor::default(),
            config,
        }
    }

    /// Use a custom redactor for stored error messages
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Execute `job` against `source`.
    ///
    /// With `options.persist` a run is recorded whether or not execution
    /// succeeds; an `Err` then means the failure was recorded (or that the
    /// history write itself failed).
    pub async fn run(
        &self,
        job: &QueryJob,
        source: &DataSource,
        options: ExecuteOptions,
    ) -> Result<RunResult, ExecError> {
        if !options.persist {
            let started = Instant::now();
            let table = self.execute(job, source, &options).await?;
            debug!(job_id = job.id, rows = table.row_count(), "Dry run finished");
            return Ok(RunResult::finished(None, table, started));
        }

        let scheduled_at = options.scheduled_at.unwrap_or_else(Utc::now);
        let run_id = self.begin(job, scheduled_at).await?;
        let started = Instant::now();

        match self.execute(job, source, &options).await {
            Ok(table) => {
                self.complete(run_id, RunOutcome::Success(table.clone()))
                    .await?;
                let result = RunResult::finished(Some(run_id), table, started);
                info!(
                    job_id = job.id,
                    run_id,
                    rows = result.row_count,
                    duration_ms = result.duration_ms,
                    "Run succeeded"
                );
                Ok(result)
            }
            Err(err) => {
                self.record(job, run_id, &err).await?;
                Err(err)
            }
        }
    }

    /// Append an error run without executing anything. Used when a fire
    /// cannot even reach [`Executor::run`], e.g. the data source is gone.
    pub async fn record_failure(
        &self,
        job: &QueryJob,
        scheduled_at: DateTime<Utc>,
        err: &ExecError,
    ) -> Result<i64, ExecError> {
        let run_id = self.begin(job, scheduled_at).await?;
        self.record(job, run_id, err).await?;
        Ok(run_id)
    }

    async fn execute(
        &self,
        job: &QueryJob,
        source: &DataSource,
        options: &ExecuteOptions,
    ) -> Result<ResultTable, ExecError> {
        // Re-checked on every execution, before any connection.
        let query = validate_sql(&job.sql_text)?;

        let password = self.vault.open(&source.credential)?;
        let target = ConnectTarget::new(source, password);

        let limit = options
            .row_limit
            .or(job.row_limit)
            .map_or(self.config.max_rows, |n| n.min(self.config.max_rows));
        let timeout_ms = options
            .timeout_ms
            .or(job.timeout_ms)
            .unwrap_or(self.config.statement_timeout_ms)
            .max(1);
        let sql = query.limited(limit);

        debug!(
            job_id = job.id,
            data_source_id = source.id,
            limit,
            timeout_ms,
            "Executing query"
        );
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.connector.fetch(&target, &sql, timeout_ms),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout { timeout_ms }),
        }
    }

    async fn begin(&self, job: &QueryJob, scheduled_at: DateTime<Utc>) -> Result<i64, ExecError> {
        let new_run = NewRun {
            job_id: job.id,
            scheduled_at,
            timezone: job.schedule.timezone.clone(),
        };
        retry_with_backoff(
            &self.config.retry,
            || self.store.begin_run(&new_run),
            StoreError::is_retryable,
        )
        .await
        .map_err(|(e, attempts)| {
            if !matches!(e, StoreError::AlreadyRunning { .. }) {
                error!(job_id = job.id, attempts, error = %e, "Failed to start run");
            }
            ExecError::Persistence(e)
        })
    }

    async fn record(&self, job: &QueryJob, run_id: i64, err: &ExecError) -> Result<(), ExecError> {
        let message = self.redactor.clean(&err.to_string());
        warn!(
            job_id = job.id,
            run_id,
            kind = %err.kind(),
            retryable = err.kind().is_retryable(),
            error = %message,
            "Run failed"
        );
        self.complete(
            run_id,
            RunOutcome::Failure {
                kind: err.kind(),
                message,
            },
        )
        .await
    }

    async fn complete(&self, run_id: i64, outcome: RunOutcome) -> Result<(), ExecError> {
        retry_with_backoff(
            &self.config.retry,
            || self.store.complete_run(run_id, outcome.clone()),
            StoreError::is_retryable,
        )
        .await
        .map_err(|(e, attempts)| {
            error!(run_id, attempts, error = %e, "Failed to record run outcome");
            ExecError::Persistence(e)
        })
    }
}

impl RunResult {
    fn finished(run_id: Option<i64>, table: ResultTable, started: Instant) -> Self {
        Self {
            run_id,
            row_count: table.row_count(),
            table,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
