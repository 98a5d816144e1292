//! Scheduler - fires jobs on cron or interval schedules
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  watch   ┌─────────────────┐
//! │   JobRegistry   │ ───────▶ │    Scheduler    │  next-fire bookkeeping
//! └─────────────────┘          └────────┬────────┘
//!                                       │ try_send (bounded mpsc)
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │   WorkerPool    │  N tasks
//!                              └────────┬────────┘
//!                                       │ FireHandler::handle
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │    Executor     │
//!                              └─────────────────┘
//! ```
//!
//! The dispatch loop never awaits an execution. A job whose previous fire
//! is still running when it comes due again is skipped, not queued, so a
//! slow source cannot build a backlog. Skips and other decisions are
//! published as [`SchedulerEvent`]s; they never create runs.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = Scheduler::new(SchedulerConfig::new().with_workers(8));
//! let (tx, rx) = tokio::sync::mpsc::channel(scheduler.config().queue_capacity);
//! let pool = WorkerPool::spawn(8, rx, handler, scheduler.running(), shutdown.clone());
//! tokio::spawn(scheduler.run(snapshots, tx, shutdown.clone()));
//! ```

mod engine;
mod triggers;
mod types;
mod worker;

pub use engine::{RunningSet, Scheduler, SchedulerConfig, RESTART_MESSAGE};
pub use triggers::{
    parse_duration, parse_timezone, CatchUp, CronSchedule, CronTrigger, IntervalTrigger,
    ScheduleError, Trigger,
};
pub use types::{
    FireTask, JobState, Result as SchedulerResult, RunningJob, SchedulerError, SchedulerEvent,
    SkipReason,
};
pub use worker::{FireHandler, WorkerPool};
