//! JobRegistry - in-memory view of enabled, valid job definitions
//!
//! The registry pulls job rows from a [`JobSource`], validates each one with
//! [`validate_job`] and publishes the result as an immutable
//! [`RegistrySnapshot`]. The scheduler only ever sees snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{validate_sql, QueryValidationError, ValidatedQuery};
use crate::scheduler::{ScheduleError, Trigger};
use crate::store::StoreError;

/// Default interval for interval jobs without an expression (6 hours)
pub const DEFAULT_INTERVAL_SECS: u64 = 21_600;

/// Schedule flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Five/six-field cron expression
    Cron,
    /// Fixed ISO-8601 duration
    Interval,
}

impl ScheduleType {
    /// Column value
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
        }
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cron" => Ok(ScheduleType::Cron),
            "interval" => Ok(ScheduleType::Interval),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, expression, timezone}` triple deciding when a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    /// Schedule flavour
    #[serde(rename = "type")]
    pub kind: ScheduleType,
    /// Cron expression or duration; may be empty for interval jobs
    pub expression: String,
    /// IANA timezone name (empty means UTC)
    pub timezone: String,
}

impl ScheduleDescriptor {
    /// Cron schedule
    pub fn cron(expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            kind: ScheduleType::Cron,
            expression: expression.into(),
            timezone: timezone.into(),
        }
    }

    /// Interval schedule (UTC)
    pub fn interval(expression: impl Into<String>) -> Self {
        Self {
            kind: ScheduleType::Interval,
            expression: expression.into(),
            timezone: "UTC".to_string(),
        }
    }
}

/// A scheduled query definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryJob {
    /// Identity
    pub id: i64,
    /// Display name
    pub name: String,
    /// Statement to run
    pub sql_text: String,
    /// Data source to run against
    pub data_source_id: i64,
    /// When to run
    pub schedule: ScheduleDescriptor,
    /// Disabled jobs are never scheduled
    pub enabled: bool,
    /// Per-job row limit
    pub row_limit: Option<u64>,
    /// Per-job deadline in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Rejected job definition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// SQL is not a single read-only query
    #[error("job {job_id}: {source}")]
    InvalidSql {
        /// Job id
        job_id: i64,
        /// Validation failure
        source: QueryValidationError,
    },

    /// Schedule expression or timezone is invalid
    #[error("job {job_id}: {source}")]
    InvalidSchedule {
        /// Job id
        job_id: i64,
        /// Parse failure
        source: ScheduleError,
    },
}

/// A job that passed validation, with its parsed trigger
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    /// Definition
    pub job: Arc<QueryJob>,
    /// Parsed schedule
    pub trigger: Trigger,
    /// Checked statement
    pub query: ValidatedQuery,
}

/// Validate SQL and schedule of a job.
///
/// Shared by registration and the pre-execution check, so both see the
/// same verdict.
pub fn validate_job(job: &QueryJob) -> Result<ValidatedJob, ConfigError> {
    let query = validate_sql(&job.sql_text).map_err(|source| ConfigError::InvalidSql {
        job_id: job.id,
        source,
    })?;
    let trigger = Trigger::parse(&job.schedule).map_err(|source| ConfigError::InvalidSchedule {
        job_id: job.id,
        source,
    })?;

    Ok(ValidatedJob {
        job: Arc::new(job.clone()),
        trigger,
        query,
    })
}

/// Where job rows come from
#[async_trait]
pub trait JobSource: Send + Sync {
    /// All jobs, enabled or not
    async fn load_jobs(&self) -> Result<Vec<QueryJob>, StoreError>;

    /// One job by id
    async fn get_job(&self, id: i64) -> Result<Option<QueryJob>, StoreError>;
}

/// In-process [`JobSource`]
#[derive(Debug, Default)]
pub struct MemoryJobSource {
    jobs: RwLock<BTreeMap<i64, QueryJob>>,
}

impl MemoryJobSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job
    pub async fn upsert(&self, job: QueryJob) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Remove a job
    pub async fn remove(&self, id: i64) -> Option<QueryJob> {
        self.jobs.write().await.remove(&id)
    }

    /// Flip the enabled flag
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> bool {
        match self.jobs.write().await.get_mut(&id) {
            Some(job) => {
                job.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobSource for MemoryJobSource {
    async fn load_jobs(&self) -> Result<Vec<QueryJob>, StoreError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn get_job(&self, id: i64) -> Result<Option<QueryJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }
}

/// Immutable set of schedulable jobs
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Enabled, valid jobs by id
    pub jobs: BTreeMap<i64, ValidatedJob>,
    /// Enabled jobs that failed validation, with the reason
    pub rejected: BTreeMap<i64, String>,
    /// When the snapshot was taken
    pub loaded_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    /// Build a snapshot from job rows
    pub fn build(jobs: Vec<QueryJob>, default_interval_secs: u64, now: DateTime<Utc>) -> Self {
        let mut snapshot = Self {
            loaded_at: Some(now),
            ..Self::default()
        };

        for mut job in jobs.into_iter().filter(|j| j.enabled) {
            if job.schedule.kind == ScheduleType::Interval
                && job.schedule.expression.trim().is_empty()
            {
                job.schedule.expression = default_interval_secs.to_string();
            }
            match validate_job(&job) {
                Ok(valid) => {
                    snapshot.jobs.insert(job.id, valid);
                }
                Err(e) => {
                    snapshot.rejected.insert(job.id, e.to_string());
                }
            }
        }
        snapshot
    }

    /// Look up a schedulable job
    pub fn get(&self, id: i64) -> Option<&ValidatedJob> {
        self.jobs.get(&id)
    }
}

/// Periodically refreshed registry of job definitions
pub struct JobRegistry {
    source: Arc<dyn JobSource>,
    default_interval_secs: u64,
    snapshot: Arc<RegistrySnapshot>,
}

impl JobRegistry {
    /// Create a registry with an empty snapshot
    pub fn new(source: Arc<dyn JobSource>) -> Self {
        Self {
            source,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            snapshot: Arc::new(RegistrySnapshot::default()),
        }
    }

    /// Interval used by interval jobs without an expression
    pub fn with_default_interval_secs(mut self, secs: u64) -> Self {
        self.default_interval_secs = secs.max(1);
        self
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Reload job rows and replace the snapshot
    pub async fn refresh(&mut self) -> Result<Arc<RegistrySnapshot>, StoreError> {
        let jobs = self.source.load_jobs().await?;
        let snapshot = RegistrySnapshot::build(jobs, self.default_interval_secs, Utc::now());

        for (id, reason) in &snapshot.rejected {
            if self.snapshot.rejected.get(id) != Some(reason) {
                warn!(job_id = id, reason = %reason, "Job rejected");
            }
        }
        debug!(
            jobs = snapshot.jobs.len(),
            rejected = snapshot.rejected.len(),
            "Registry refreshed"
        );

        self.snapshot = Arc::new(snapshot);
        Ok(self.snapshot())
    }

    /// Refresh every `every` and publish each snapshot until `shutdown`.
    ///
    /// A failed refresh keeps the previous snapshot.
    pub async fn run(
        mut self,
        tx: watch::Sender<Arc<RegistrySnapshot>>,
        every: Duration,
        shutdown: CancellationToken,
    ) {
        info!(interval_secs = every.as_secs(), "Registry refresh loop starting");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(snapshot) => {
                            if tx.send(snapshot).is_err() {
                                debug!("No scheduler listening; stopping refresh loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Registry refresh failed; keeping previous snapshot")
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Registry refresh loop stopped");
    }
}
