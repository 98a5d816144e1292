//! Bridges scheduler fires to the executor

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{ExecError, ExecuteOptions, Executor};
use crate::datasource::DataSourceStore;
use crate::scheduler::{FireHandler, FireTask};

/// Runs each fire as a persisted execution
pub struct JobRunner {
    executor: Arc<Executor>,
    sources: Arc<dyn DataSourceStore>,
}

impl JobRunner {
    /// Create a runner
    pub fn new(executor: Arc<Executor>, sources: Arc<dyn DataSourceStore>) -> Self {
        Self { executor, sources }
    }

    /// Write an error run for a fire that never reached the executor
    async fn record_unreachable(&self, task: &FireTask, err: &ExecError) {
        let job = &task.job;
        if let Err(e) = self
            .executor
            .record_failure(job, task.scheduled_at, err)
            .await
        {
            error!(job_id = job.id, error = %e, "Could not record failed fire");
        }
    }
}

#[async_trait]
impl FireHandler for JobRunner {
    async fn handle(&self, task: FireTask) {
        let job = &task.job;

        let lookup = self.sources.get_data_source(job.data_source_id).await;
        let source = match lookup {
            Ok(Some(source)) => source,
            Ok(None) => {
                let err = ExecError::DataSourceNotFound(job.data_source_id);
                self.record_unreachable(&task, &err).await;
                return;
            }
            Err(e) => {
                error!(
                    job_id = job.id,
                    data_source_id = job.data_source_id,
                    error = %e,
                    "Data source lookup failed"
                );
                self.record_unreachable(&task, &ExecError::Persistence(e)).await;
                return;
            }
        };

        match self
            .executor
            .run(job, &source, ExecuteOptions::scheduled(task.scheduled_at))
            .await
        {
            Ok(result) => debug!(
                job_id = job.id,
                run_id = ?result.run_id,
                rows = result.row_count,
                "Fire completed"
            ),
            Err(e) if e.is_already_running() => {
                warn!(job_id = job.id, "Previous run still recorded as running; fire skipped")
            }
            // Already recorded and logged by the executor.
            Err(_) => {}
        }
    }
}
