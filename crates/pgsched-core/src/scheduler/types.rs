//! Scheduler types and error definitions

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::triggers::ScheduleError;
use crate::error::ErrorKind;
use crate::registry::QueryJob;
use crate::store::StoreError;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Schedule could not be parsed
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Run history unavailable during startup recovery
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Failure class
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidSchedule(_) | SchedulerError::InvalidConfig(_) => {
                ErrorKind::Config
            }
            SchedulerError::Store(_) => ErrorKind::Persistence,
        }
    }
}

/// Lifecycle state of a known job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its next fire
    Scheduled,
    /// An execution is in flight
    Firing,
    /// Removed from scheduling (disabled, deleted or invalid)
    Disabled,
}

/// Why a due fire did not produce a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// Previous execution of the job still running
    Overlap,
    /// Worker queue full
    QueueFull,
    /// Worker queue closed (shutting down)
    QueueClosed,
    /// Slots elapsed while the loop was behind
    Misfire {
        /// Number of elapsed slots
        missed: u64,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Overlap => f.write_str("overlap"),
            SkipReason::QueueFull => f.write_str("queue full"),
            SkipReason::QueueClosed => f.write_str("queue closed"),
            SkipReason::Misfire { missed } => write!(f, "misfire ({missed} slots)"),
        }
    }
}

/// Observability events. None of these create a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    /// Job entered scheduling
    Registered {
        /// Job id
        job_id: i64,
        /// First fire
        next_fire: Option<DateTime<Utc>>,
    },
    /// Job's definition changed; next fire recomputed from now
    Rescheduled {
        /// Job id
        job_id: i64,
        /// Recomputed fire
        next_fire: Option<DateTime<Utc>>,
    },
    /// Job left scheduling
    Unregistered {
        /// Job id
        job_id: i64,
    },
    /// Job definition failed validation
    Rejected {
        /// Job id
        job_id: i64,
        /// Validation message
        reason: String,
    },
    /// Fire handed to the worker queue
    Fired {
        /// Job id
        job_id: i64,
        /// Slot being executed
        scheduled_at: DateTime<Utc>,
    },
    /// Fire dropped
    Skipped {
        /// Job id
        job_id: i64,
        /// Slot that did not run
        scheduled_at: DateTime<Utc>,
        /// Why
        #[serde(flatten)]
        reason: SkipReason,
    },
    /// Running mark cleared after its deadline passed
    WatchdogReleased {
        /// Job id
        job_id: i64,
        /// Slot of the stuck execution
        scheduled_at: DateTime<Utc>,
    },
}

/// Unit of work handed from the dispatch loop to a worker
#[derive(Debug, Clone)]
pub struct FireTask {
    /// Job definition as of the fire
    pub job: Arc<QueryJob>,
    /// Slot being executed
    pub scheduled_at: DateTime<Utc>,
    /// When the execution should have finished by
    pub deadline: DateTime<Utc>,
    /// Identifies this fire's running mark
    pub generation: u64,
}

/// Running mark for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningJob {
    /// Slot being executed
    pub scheduled_at: DateTime<Utc>,
    /// When the fire was dispatched
    pub started_at: DateTime<Utc>,
    /// Execution deadline
    pub deadline: DateTime<Utc>,
    /// Matches [`FireTask::generation`]
    pub generation: u64,
}
