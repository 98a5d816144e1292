//! ResultStore - durable, append-only run history
//!
//! A run is inserted as `running` by [`ResultStore::begin_run`] and moved to
//! its terminal state by [`ResultStore::complete_run`]. The terminal write is
//! atomic: a `success` run always has its blob, an `error` run never does.
//! Navigation (`latest`/`prev`/`next`/`range`) orders runs by id, which is
//! monotonically increasing per job.

mod memory;
mod migrations;
mod postgres;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::executor::ResultTable;

pub use memory::MemoryResultStore;
pub use postgres::{PoolConfig, PostgresStore};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Default page size for [`ResultStore::range`]
pub const DEFAULT_RANGE_LIMIT: u32 = 100;
/// Largest page [`ResultStore::range`] returns
pub const MAX_RANGE_LIMIT: u32 = 1000;

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The job already has a run in progress
    #[error("job {job_id} already has a running run")]
    AlreadyRunning {
        /// Job id
        job_id: i64,
    },
    /// No run with this id
    #[error("run not found: {0}")]
    RunNotFound(i64),
    /// The run already reached a terminal state
    #[error("run {0} is not running")]
    NotRunning(i64),
    /// Stored data could not be interpreted
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the same write can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Execution in progress
    Running,
    /// Finished with a result blob
    Success,
    /// Finished with an error message
    Error,
}

impl RunStatus {
    /// Column value
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution attempt of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRun {
    /// Run id, increasing per job
    pub id: i64,
    /// Parent job
    pub job_id: i64,
    /// Fire time the run belongs to
    pub scheduled_at: DateTime<Utc>,
    /// Timezone the schedule was evaluated in
    pub timezone: String,
    /// Actual start
    pub started_at: DateTime<Utc>,
    /// Actual finish, once terminal
    pub finished_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: RunStatus,
    /// Rows returned (success only)
    pub row_count: Option<i64>,
    /// Present iff status is `error`
    pub error_message: Option<String>,
    /// Failure class (error only)
    pub error_kind: Option<ErrorKind>,
}

/// Result payload of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRunBlob {
    /// Owning run
    pub run_id: i64,
    /// Shaped result
    pub table: ResultTable,
    /// Number of rows in `table`
    pub row_count: i64,
    /// Serialized size of `table` in bytes
    pub byte_size: i64,
}

/// A run together with its blob, if it succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run metadata
    pub run: QueryRun,
    /// Result blob (success only)
    pub blob: Option<QueryRunBlob>,
}

/// Parameters for a new run
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Job being run
    pub job_id: i64,
    /// Fire time
    pub scheduled_at: DateTime<Utc>,
    /// Timezone the schedule was evaluated in
    pub timezone: String,
}

/// Terminal outcome written by [`ResultStore::complete_run`]
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Query succeeded
    Success(ResultTable),
    /// Query failed
    Failure {
        /// Failure class
        kind: ErrorKind,
        /// Redacted message
        message: String,
    },
}

impl RunOutcome {
    /// Status this outcome produces
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success(_) => RunStatus::Success,
            RunOutcome::Failure { .. } => RunStatus::Error,
        }
    }
}

/// Bounds for [`ResultStore::range`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeQuery {
    /// Inclusive lower bound on `scheduled_at`
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `scheduled_at`
    pub end: Option<DateTime<Utc>>,
    /// Only ids strictly below this cursor
    pub before: Option<i64>,
    /// Only ids strictly above this cursor
    pub after: Option<i64>,
    /// Page size (clamped to `1..=MAX_RANGE_LIMIT`)
    pub limit: Option<u32>,
}

impl RangeQuery {
    /// Unbounded query with the default page size
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time window
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Set the `before` cursor
    pub fn before(mut self, id: i64) -> Self {
        self.before = Some(id);
        self
    }

    /// Set the `after` cursor
    pub fn after(mut self, id: i64) -> Self {
        self.after = Some(id);
        self
    }

    /// Set the page size
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Page size after clamping
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_RANGE_LIMIT)
            .clamp(1, MAX_RANGE_LIMIT)
    }

    /// With only a `before` cursor the page is anchored at the cursor
    /// (the highest ids below it), otherwise at the lowest matching id.
    pub fn anchored_at_end(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    fn matches(&self, run: &QueryRun) -> bool {
        self.start.is_none_or(|s| run.scheduled_at >= s)
            && self.end.is_none_or(|e| run.scheduled_at < e)
            && self.before.is_none_or(|b| run.id < b)
            && self.after.is_none_or(|a| run.id > a)
    }
}

/// Durable run history
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a `running` run. Fails with [`StoreError::AlreadyRunning`] if
    /// the job already has one.
    async fn begin_run(&self, run: &NewRun) -> Result<i64>;

    /// Atomically move a running run to `success` (with blob) or `error`.
    async fn complete_run(&self, run_id: i64, outcome: RunOutcome) -> Result<()>;

    /// Highest-id run of the job
    async fn latest(&self, job_id: i64) -> Result<Option<RunRecord>>;

    /// Run by id
    async fn by_id(&self, run_id: i64) -> Result<Option<RunRecord>>;

    /// Highest id strictly below `run_id` for the job
    async fn prev(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>>;

    /// Lowest id strictly above `run_id` for the job
    async fn next(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>>;

    /// Runs within the bounds, ascending by id
    async fn range(&self, job_id: i64, query: &RangeQuery) -> Result<Vec<QueryRun>>;

    /// Mark every `running` run as failed. Returns how many were changed.
    async fn fail_stale_runs(&self, message: &str) -> Result<u64>;
}

pub(crate) fn blob_for(run_id: i64, table: ResultTable) -> Result<QueryRunBlob> {
    let byte_size = serde_json::to_vec(&table)?.len() as i64;
    Ok(QueryRunBlob {
        run_id,
        row_count: table.rows.len() as i64,
        byte_size,
        table,
    })
}
