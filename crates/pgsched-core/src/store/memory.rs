use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{
    blob_for, NewRun, QueryRun, QueryRunBlob, RangeQuery, Result, ResultStore, RunOutcome,
    RunRecord, RunStatus, StoreError,
};
use crate::error::ErrorKind;

#[derive(Debug, Default)]
struct Inner {
    last_id: i64,
    runs: BTreeMap<i64, (QueryRun, Option<QueryRunBlob>)>,
}

impl Inner {
    fn record(&self, id: i64) -> Option<RunRecord> {
        self.runs.get(&id).map(|(run, blob)| RunRecord {
            run: run.clone(),
            blob: blob.clone(),
        })
    }

    fn job_ids(&self, job_id: i64) -> impl DoubleEndedIterator<Item = i64> + '_ {
        self.runs
            .iter()
            .filter(move |(_, (run, _))| run.job_id == job_id)
            .map(|(id, _)| *id)
    }
}

/// In-process [`ResultStore`]
///
/// Every operation runs under one lock, so reads never observe a run
/// mid-transition.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    inner: RwLock<Inner>,
}

impl MemoryResultStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs recorded for a job
    pub async fn run_count(&self, job_id: i64) -> usize {
        self.inner.read().await.job_ids(job_id).count()
    }

    /// Total number of blobs stored
    pub async fn blob_count(&self) -> usize {
        self.inner
            .read()
            .await
            .runs
            .values()
            .filter(|(_, blob)| blob.is_some())
            .count()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn begin_run(&self, new: &NewRun) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let busy = inner
            .runs
            .values()
            .any(|(run, _)| run.job_id == new.job_id && run.status == RunStatus::Running);
        if busy {
            return Err(StoreError::AlreadyRunning { job_id: new.job_id });
        }

        inner.last_id += 1;
        let id = inner.last_id;
        inner.runs.insert(
            id,
            (
                QueryRun {
                    id,
                    job_id: new.job_id,
                    scheduled_at: new.scheduled_at,
                    timezone: new.timezone.clone(),
                    started_at: Utc::now(),
                    finished_at: None,
                    status: RunStatus::Running,
                    row_count: None,
                    error_message: None,
                    error_kind: None,
                },
                None,
            ),
        );
        Ok(id)
    }

    async fn complete_run(&self, run_id: i64, outcome: RunOutcome) -> Result<()> {
        let mut inner = self.inner.write().await;
        let (run, blob) = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::NotRunning(run_id));
        }

        // Build everything first so a serialization failure leaves the run untouched.
        let (row_count, new_blob, error_message, error_kind) = match outcome {
            RunOutcome::Success(table) => {
                let b = blob_for(run_id, table)?;
                (Some(b.row_count), Some(b), None, None)
            }
            RunOutcome::Failure { kind, message } => (None, None, Some(message), Some(kind)),
        };

        run.status = if new_blob.is_some() {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        run.finished_at = Some(Utc::now());
        run.row_count = row_count;
        run.error_message = error_message;
        run.error_kind = error_kind;
        *blob = new_blob;
        Ok(())
    }

    async fn latest(&self, job_id: i64) -> Result<Option<RunRecord>> {
        let inner = self.inner.read().await;
        let id = inner.job_ids(job_id).next_back();
        Ok(id.and_then(|id| inner.record(id)))
    }

    async fn by_id(&self, run_id: i64) -> Result<Option<RunRecord>> {
        Ok(self.inner.read().await.record(run_id))
    }

    async fn prev(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>> {
        let inner = self.inner.read().await;
        let id = inner.job_ids(job_id).filter(|id| *id < run_id).next_back();
        Ok(id.and_then(|id| inner.record(id)))
    }

    async fn next(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>> {
        let inner = self.inner.read().await;
        let id = inner.job_ids(job_id).find(|id| *id > run_id);
        Ok(id.and_then(|id| inner.record(id)))
    }

    async fn range(&self, job_id: i64, query: &RangeQuery) -> Result<Vec<QueryRun>> {
        let inner = self.inner.read().await;
        let limit = query.effective_limit() as usize;
        let matching = inner
            .runs
            .values()
            .map(|(run, _)| run)
            .filter(|run| run.job_id == job_id && query.matches(run));

        let mut runs: Vec<QueryRun> = if query.anchored_at_end() {
            matching.rev().take(limit).cloned().collect()
        } else {
            matching.take(limit).cloned().collect()
        };
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn fail_stale_runs(&self, message: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for (run, _) in inner.runs.values_mut() {
            if run.status == RunStatus::Running {
                run.status = RunStatus::Error;
                run.finished_at = Some(now);
                run.error_message = Some(message.to_string());
                run.error_kind = Some(ErrorKind::Persistence);
                changed += 1;
            }
        }
        Ok(changed)
    }
}
