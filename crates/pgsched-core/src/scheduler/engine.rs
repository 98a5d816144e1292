//! Scheduler dispatch loop
//!
//! The [`Scheduler`] owns every job's next-fire bookkeeping. Each `tick`
//! decides which jobs fire, the dispatch step hands them to the worker
//! queue without waiting, and the running set shared with the workers keeps
//! a job from having two executions in flight.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::triggers::Trigger;
use super::types::{FireTask, JobState, Result, RunningJob, SchedulerEvent, SkipReason};
use crate::registry::{QueryJob, RegistrySnapshot, ValidatedJob};
use crate::store::ResultStore;

/// Message written on runs left `running` by a previous process
pub const RESTART_MESSAGE: &str = "interrupted by scheduler restart";

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps between ticks
    pub max_sleep: std::time::Duration,
    /// Worker tasks consuming the fire queue
    pub workers: usize,
    /// Capacity of the fire queue
    pub queue_capacity: usize,
    /// Deadline for jobs without their own timeout
    pub execution_timeout_ms: u64,
    /// Slack past the deadline before the watchdog clears a running mark
    pub watchdog_grace: std::time::Duration,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace: std::time::Duration,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep: std::time::Duration::from_secs(5),
            workers: 4,
            queue_capacity: 64,
            execution_timeout_ms: 30_000,
            watchdog_grace: std::time::Duration::from_secs(30),
            shutdown_grace: std::time::Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum sleep between ticks
    pub fn with_max_sleep(mut self, sleep: std::time::Duration) -> Self {
        self.max_sleep = sleep;
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the fire queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the default execution deadline
    pub fn with_execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms.max(1);
        self
    }

    /// Set the watchdog grace period
    pub fn with_watchdog_grace(mut self, grace: std::time::Duration) -> Self {
        self.watchdog_grace = grace;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: std::time::Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Jobs with an execution in flight, shared between the loop and workers
#[derive(Debug, Clone, Default)]
pub struct RunningSet {
    inner: Arc<DashMap<i64, RunningJob>>,
}

impl RunningSet {
    /// Whether `job_id` has an execution in flight
    pub fn contains(&self, job_id: i64) -> bool {
        self.inner.contains_key(&job_id)
    }

    /// Running mark for `job_id`
    pub fn get(&self, job_id: i64) -> Option<RunningJob> {
        self.inner.get(&job_id).map(|r| *r)
    }

    /// Number of executions in flight
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// No executions in flight
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clear the mark set for `task`. A mark from a later fire (after a
    /// watchdog release) is left alone.
    pub fn release(&self, task: &FireTask) -> bool {
        self.inner
            .remove_if(&task.job.id, |_, r| r.generation == task.generation)
            .is_some()
    }

    fn insert(&self, job_id: i64, mark: RunningJob) {
        self.inner.insert(job_id, mark);
    }

    fn expired(&self, cutoff: DateTime<Utc>) -> Vec<(i64, RunningJob)> {
        self.inner
            .iter()
            .filter(|r| r.deadline < cutoff)
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }

    fn remove_generation(&self, job_id: i64, generation: u64) -> bool {
        self.inner
            .remove_if(&job_id, |_, r| r.generation == generation)
            .is_some()
    }
}

struct ScheduleEntry {
    job: Arc<QueryJob>,
    trigger: Trigger,
    next_fire: Option<DateTime<Utc>>,
}

/// Next-fire bookkeeping for every schedulable job
pub struct Scheduler {
    config: SchedulerConfig,
    entries: BTreeMap<i64, ScheduleEntry>,
    disabled: HashSet<i64>,
    rejected: HashMap<i64, String>,
    running: RunningSet,
    events: broadcast::Sender<SchedulerEvent>,
    generation: u64,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            entries: BTreeMap::new(),
            disabled: HashSet::new(),
            rejected: HashMap::new(),
            running: RunningSet::default(),
            events,
            generation: 0,
        }
    }

    /// Mark runs a previous process left `running` as failed.
    pub async fn recover(store: &dyn ResultStore) -> Result<u64> {
        let recovered = store.fail_stale_runs(RESTART_MESSAGE).await?;
        if recovered > 0 {
            warn!(runs = recovered, "Recovered runs interrupted by restart");
        }
        Ok(recovered)
    }

    /// Configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Handle on the running set, for workers
    pub fn running(&self) -> RunningSet {
        self.running.clone()
    }

    /// Number of scheduled jobs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No jobs scheduled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lifecycle state of a job, `None` if it was never seen
    pub fn state(&self, job_id: i64) -> Option<JobState> {
        if self.entries.contains_key(&job_id) {
            if self.running.contains(job_id) {
                Some(JobState::Firing)
            } else {
                Some(JobState::Scheduled)
            }
        } else if self.disabled.contains(&job_id) {
            Some(JobState::Disabled)
        } else {
            None
        }
    }

    /// Next fire of a scheduled job
    pub fn next_fire(&self, job_id: i64) -> Option<DateTime<Utc>> {
        self.entries.get(&job_id).and_then(|e| e.next_fire)
    }

    /// Earliest next fire across all jobs
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.values().filter_map(|e| e.next_fire).min()
    }

    /// Start scheduling a job; its first fire is computed from `now`.
    pub fn register(&mut self, valid: &ValidatedJob, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next_fire = valid.trigger.next_fire(None, now);
        self.entries.insert(
            valid.job.id,
            ScheduleEntry {
                job: Arc::clone(&valid.job),
                trigger: valid.trigger.clone(),
                next_fire,
            },
        );
        self.disabled.remove(&valid.job.id);
        self.emit(SchedulerEvent::Registered {
            job_id: valid.job.id,
            next_fire,
        });
        next_fire
    }

    /// Stop scheduling a job. An execution already in flight is left to
    /// finish and be recorded.
    pub fn unregister(&mut self, job_id: i64) -> bool {
        let removed = self.entries.remove(&job_id).is_some();
        self.disabled.insert(job_id);
        if removed {
            self.emit(SchedulerEvent::Unregistered { job_id });
        }
        removed
    }

    /// Bring scheduled jobs in line with a registry snapshot.
    ///
    /// New jobs are registered, missing ones unregistered, and a changed
    /// schedule is recomputed from `now`. Other definition changes apply
    /// from the next fire without moving it.
    pub fn reconcile(&mut self, snapshot: &RegistrySnapshot, now: DateTime<Utc>) {
        let mut events = Vec::new();

        for (id, valid) in &snapshot.jobs {
            self.rejected.remove(id);
            match self.entries.get_mut(id) {
                Some(entry) if entry.job.schedule != valid.job.schedule => {
                    entry.job = Arc::clone(&valid.job);
                    entry.trigger = valid.trigger.clone();
                    entry.next_fire = entry.trigger.next_fire(None, now);
                    events.push(SchedulerEvent::Rescheduled {
                        job_id: *id,
                        next_fire: entry.next_fire,
                    });
                }
                Some(entry) => {
                    if *entry.job != *valid.job {
                        entry.job = Arc::clone(&valid.job);
                    }
                }
                None => {
                    self.register(valid, now);
                }
            }
        }

        let gone: Vec<i64> = self
            .entries
            .keys()
            .filter(|id| !snapshot.jobs.contains_key(*id))
            .copied()
            .collect();
        for id in gone {
            self.unregister(id);
        }

        self.rejected.retain(|id, _| snapshot.rejected.contains_key(id));
        for (id, reason) in &snapshot.rejected {
            self.disabled.insert(*id);
            if self.rejected.get(id) != Some(reason) {
                self.rejected.insert(*id, reason.clone());
                events.push(SchedulerEvent::Rejected {
                    job_id: *id,
                    reason: reason.clone(),
                });
            }
        }

        for event in events {
            self.emit(event);
        }
        debug!(
            scheduled = self.entries.len(),
            rejected = self.rejected.len(),
            "Reconciled with registry"
        );
    }

    /// Decide which jobs fire at `now`.
    ///
    /// Every returned task has its running mark set; the caller must
    /// dispatch it or release it. Due jobs that are still running are
    /// skipped, and slots that elapsed while the loop was behind are
    /// skipped as misfires. Each due job's `next_fire` moves past `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<FireTask> {
        self.release_expired(now);

        let mut tasks = Vec::new();
        let mut events = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            let Some(due) = entry.next_fire.filter(|due| *due <= now) else {
                continue;
            };

            let slot = entry.trigger.catch_up(due, now);
            entry.next_fire = slot.next;
            if slot.missed > 0 {
                events.push(SchedulerEvent::Skipped {
                    job_id: *id,
                    scheduled_at: due,
                    reason: SkipReason::Misfire {
                        missed: slot.missed,
                    },
                });
            }

            if self.running.contains(*id) {
                events.push(SchedulerEvent::Skipped {
                    job_id: *id,
                    scheduled_at: slot.fire_at,
                    reason: SkipReason::Overlap,
                });
                continue;
            }

            self.generation += 1;
            let timeout_ms = entry
                .job
                .timeout_ms
                .unwrap_or(self.config.execution_timeout_ms);
            let deadline = now + Duration::milliseconds(timeout_ms.min(i64::MAX as u64) as i64);
            self.running.insert(
                *id,
                RunningJob {
                    scheduled_at: slot.fire_at,
                    started_at: now,
                    deadline,
                    generation: self.generation,
                },
            );
            tasks.push(FireTask {
                job: Arc::clone(&entry.job),
                scheduled_at: slot.fire_at,
                deadline,
                generation: self.generation,
            });
        }

        for event in events {
            self.emit(event);
        }
        tasks
    }

    /// Hand tasks to the worker queue without waiting for room.
    ///
    /// A task that does not fit is dropped and its running mark cleared.
    /// Returns the number of tasks queued.
    pub fn dispatch(&self, tasks: Vec<FireTask>, queue: &mpsc::Sender<FireTask>) -> usize {
        let mut sent = 0;
        for task in tasks {
            let (job_id, scheduled_at) = (task.job.id, task.scheduled_at);
            match queue.try_send(task) {
                Ok(()) => {
                    sent += 1;
                    self.emit(SchedulerEvent::Fired {
                        job_id,
                        scheduled_at,
                    });
                }
                Err(TrySendError::Full(task)) => {
                    self.running.release(&task);
                    self.emit(SchedulerEvent::Skipped {
                        job_id,
                        scheduled_at,
                        reason: SkipReason::QueueFull,
                    });
                }
                Err(TrySendError::Closed(task)) => {
                    self.running.release(&task);
                    self.emit(SchedulerEvent::Skipped {
                        job_id,
                        scheduled_at,
                        reason: SkipReason::QueueClosed,
                    });
                }
            }
        }
        sent
    }

    /// Dispatch loop. Reconciles with each published snapshot and stops on
    /// `shutdown`; dropping `queue` on exit lets the workers drain.
    pub async fn run(
        mut self,
        mut registry: watch::Receiver<Arc<RegistrySnapshot>>,
        queue: mpsc::Sender<FireTask>,
        shutdown: CancellationToken,
    ) {
        info!(max_sleep_ms = self.config.max_sleep.as_millis() as u64, "Scheduler starting");

        let snapshot = registry.borrow_and_update().clone();
        self.reconcile(&snapshot, Utc::now());
        let mut registry_open = true;

        loop {
            let tasks = self.tick(Utc::now());
            if !tasks.is_empty() {
                self.dispatch(tasks, &queue);
            }
            let sleep = self.sleep_for(Utc::now());

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                changed = registry.changed(), if registry_open => {
                    match changed {
                        Ok(()) => {
                            let snapshot = registry.borrow_and_update().clone();
                            self.reconcile(&snapshot, Utc::now());
                        }
                        Err(_) => {
                            warn!("Registry publisher gone; keeping last snapshot");
                            registry_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        drop(queue);
        info!(in_flight = self.running.len(), "Scheduler stopped");
    }

    fn sleep_for(&self, now: DateTime<Utc>) -> std::time::Duration {
        match self.next_due() {
            Some(due) => (due - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .min(self.config.max_sleep),
            None => self.config.max_sleep,
        }
    }

    fn release_expired(&self, now: DateTime<Utc>) {
        let grace = Duration::from_std(self.config.watchdog_grace).unwrap_or(Duration::zero());
        for (job_id, mark) in self.running.expired(now - grace) {
            if self.running.remove_generation(job_id, mark.generation) {
                self.emit(SchedulerEvent::WatchdogReleased {
                    job_id,
                    scheduled_at: mark.scheduled_at,
                });
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        match &event {
            SchedulerEvent::Registered { job_id, next_fire } => {
                info!(job_id, next_fire = ?next_fire, "Job scheduled")
            }
            SchedulerEvent::Rescheduled { job_id, next_fire } => {
                info!(job_id, next_fire = ?next_fire, "Job rescheduled")
            }
            SchedulerEvent::Unregistered { job_id } => info!(job_id, "Job unscheduled"),
            SchedulerEvent::Rejected { job_id, reason } => {
                warn!(job_id, reason = %reason, "Job not scheduled")
            }
            SchedulerEvent::Fired {
                job_id,
                scheduled_at,
            } => debug!(job_id, %scheduled_at, "Job fired"),
            SchedulerEvent::Skipped {
                job_id,
                scheduled_at,
                reason,
            } => warn!(job_id, %scheduled_at, reason = %reason, "Fire skipped"),
            SchedulerEvent::WatchdogReleased {
                job_id,
                scheduled_at,
            } => error!(
                job_id,
                %scheduled_at,
                "Execution overran its deadline; running mark released"
            ),
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
