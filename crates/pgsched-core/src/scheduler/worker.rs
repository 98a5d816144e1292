//! Fixed-size worker pool consuming the fire queue

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::RunningSet;
use super::types::FireTask;

/// Executes one fire
#[async_trait]
pub trait FireHandler: Send + Sync + 'static {
    /// Run the task to completion, recording its outcome
    async fn handle(&self, task: FireTask);
}

/// Worker tasks sharing one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks. Each clears the job's running mark once the
    /// handler returns (or panics).
    ///
    /// After `shutdown` no new task is taken; queued tasks are released
    /// unexecuted.
    pub fn spawn(
        workers: usize,
        queue: mpsc::Receiver<FireTask>,
        handler: Arc<dyn FireHandler>,
        running: RunningSet,
        shutdown: CancellationToken,
    ) -> Self {
        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&queue),
                    Arc::clone(&handler),
                    running.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait up to `grace` for every worker to finish its current task.
    /// Returns `false` if some were still busy and got detached.
    pub async fn join(self, grace: Duration) -> bool {
        let count = self.handles.len();
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(grace, futures::future::join_all(self.handles)).await {
            Ok(_) => {
                info!(workers = count, "Worker pool stopped");
                true
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Workers still busy after shutdown grace period"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<FireTask>>>,
    handler: Arc<dyn FireHandler>,
    running: RunningSet,
    shutdown: CancellationToken,
) {
    debug!(worker, "Worker started");
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    // Anything still queued will not run.
                    while let Ok(task) = rx.try_recv() {
                        running.release(&task);
                    }
                    None
                }
                task = rx.recv() => task,
            }
        };
        let Some(task) = next else { break };

        let job_id = task.job.id;
        let h = Arc::clone(&handler);
        let owned = task.clone();
        if let Err(e) = tokio::spawn(async move { h.handle(owned).await }).await {
            error!(worker, job_id, error = %e, "Fire handler panicked");
        }
        running.release(&task);
    }
    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::test_support::{interval_job, utc, validated};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        handled: AtomicUsize,
        panic_on: Option<i64>,
    }

    #[async_trait]
    impl FireHandler for Counting {
        async fn handle(&self, task: FireTask) {
            if Some(task.job.id) == self.panic_on {
                panic!("handler blew up");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fired(scheduler: &mut Scheduler, ids: &[i64]) -> Vec<FireTask> {
        let t0 = utc(2024, 5, 1, 0, 0, 0);
        for id in ids {
            scheduler.register(&validated(interval_job(*id, "PT1M")), t0);
        }
        scheduler.tick(t0 + chrono::Duration::minutes(1))
    }

    #[tokio::test]
    async fn test_workers_release_marks_after_handling() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new());
        let running = scheduler.running();
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            panic_on: None,
        });
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(2, rx, handler.clone(), running.clone(), shutdown.clone());
        assert_eq!(pool.size(), 2);

        let tasks = fired(&mut scheduler, &[1, 2, 3]);
        assert_eq!(running.len(), 3);
        assert_eq!(scheduler.dispatch(tasks, &tx), 3);

        drop(tx);
        assert!(pool.join(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_still_releases() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new());
        let running = scheduler.running();
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            panic_on: Some(1),
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            1,
            rx,
            handler.clone(),
            running.clone(),
            CancellationToken::new(),
        );

        let tasks = fired(&mut scheduler, &[1, 2]);
        scheduler.dispatch(tasks, &tx);
        drop(tx);

        assert!(pool.join(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_tasks() {
        let mut scheduler = Scheduler::new(SchedulerConfig::new());
        let running = scheduler.running();
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            panic_on: None,
        });
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let tasks = fired(&mut scheduler, &[1, 2, 3]);
        scheduler.dispatch(tasks, &tx);
        shutdown.cancel();
        let pool = WorkerPool::spawn(1, rx, handler.clone(), running.clone(), shutdown);

        assert!(pool.join(Duration::from_secs(5)).await);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        assert!(running.is_empty());
    }
}
