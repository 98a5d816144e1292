//! PostgreSQL implementation of the run history, job source and
//! data-source store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{
    blob_for, NewRun, QueryRun, QueryRunBlob, RangeQuery, Result, ResultStore, RunOutcome,
    RunRecord, RunStatus, StoreError,
};
use crate::datasource::{DataSource, DataSourceStore, SealedCredential};
use crate::error::ErrorKind;
use crate::executor::ResultTable;
use crate::registry::{JobSource, QueryJob, ScheduleDescriptor};

const RUN_COLUMNS: &str = "r.id, r.job_id, r.scheduled_at, r.timezone, r.started_at, \
     r.finished_at, r.status, r.row_count, r.error_message, r.error_kind";

/// Connection pool settings for the metadata database
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections
    pub max_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

/// Postgres-backed store for runs, jobs and data sources
#[derive(Clone)]
pub struct PostgresStore {
    pub(super) pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .test_before_acquire(true)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Underlying connection pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_record(
        &self,
        filter: &str,
        a: i64,
        b: Option<i64>,
    ) -> Result<Option<RunRecord>> {
        // One statement, so the run and its blob come from the same snapshot.
        let sql = format!(
            "SELECT {RUN_COLUMNS}, b.result_json, b.row_count AS blob_row_count, b.byte_size \
             FROM query_runs r LEFT JOIN query_run_blobs b ON b.run_id = r.id \
             WHERE {filter}"
        );
        let mut query = sqlx::query_as::<_, RecordRow>(&sql).bind(a);
        if let Some(b) = b {
            query = query.bind(b);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(RunRecord::try_from)
            .transpose()
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    job_id: i64,
    scheduled_at: DateTime<Utc>,
    timezone: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    row_count: Option<i64>,
    error_message: Option<String>,
    error_kind: Option<String>,
}

impl TryFrom<RunRow> for QueryRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        let status: RunStatus = row.status.parse().map_err(StoreError::Corrupt)?;
        let error_kind = row
            .error_kind
            .map(|k| k.parse::<ErrorKind>())
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(QueryRun {
            id: row.id,
            job_id: row.job_id,
            scheduled_at: row.scheduled_at,
            timezone: row.timezone,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status,
            row_count: row.row_count,
            error_message: row.error_message,
            error_kind,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    #[sqlx(flatten)]
    run: RunRow,
    result_json: Option<Json<ResultTable>>,
    blob_row_count: Option<i64>,
    byte_size: Option<i64>,
}

impl TryFrom<RecordRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let run = QueryRun::try_from(row.run)?;
        let blob = match (row.result_json, row.blob_row_count, row.byte_size) {
            (Some(Json(table)), Some(row_count), Some(byte_size)) => Some(QueryRunBlob {
                run_id: run.id,
                table,
                row_count,
                byte_size,
            }),
            (None, _, _) => None,
            _ => return Err(StoreError::Corrupt(format!("incomplete blob for run {}", run.id))),
        };

        if (run.status == RunStatus::Success) != blob.is_some() {
            return Err(StoreError::Corrupt(format!(
                "run {} is {} but blob presence is {}",
                run.id,
                run.status,
                blob.is_some()
            )));
        }
        Ok(RunRecord { run, blob })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ResultStore for PostgresStore {
    #[instrument(skip(self, new), fields(job_id = new.job_id))]
    async fn begin_run(&self, new: &NewRun) -> Result<i64> {
        let inserted: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO query_runs (job_id, scheduled_at, timezone, started_at, status)
            VALUES ($1, $2, $3, now(), 'running')
            RETURNING id
            "#,
        )
        .bind(new.job_id)
        .bind(new.scheduled_at)
        .bind(&new.timezone)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok((id,)) => {
                debug!(run_id = id, "Run started");
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::AlreadyRunning { job_id: new.job_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status()))]
    async fn complete_run(&self, run_id: i64, outcome: RunOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM query_runs WHERE id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        match current {
            None => return Err(StoreError::RunNotFound(run_id)),
            Some((status,)) if status != RunStatus::Running.as_str() => {
                return Err(StoreError::NotRunning(run_id))
            }
            Some(_) => {}
        }

        match outcome {
            RunOutcome::Success(table) => {
                let blob = blob_for(run_id, table)?;
                sqlx::query(
                    r#"
                    INSERT INTO query_run_blobs (run_id, result_json, row_count, byte_size)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(run_id)
                .bind(Json(&blob.table))
                .bind(blob.row_count)
                .bind(blob.byte_size)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE query_runs
                    SET status = 'success', finished_at = now(), row_count = $2
                    WHERE id = $1
                    "#,
                )
                .bind(run_id)
                .bind(blob.row_count)
                .execute(&mut *tx)
                .await?;
            }
            RunOutcome::Failure { kind, message } => {
                sqlx::query(
                    r#"
                    UPDATE query_runs
                    SET status = 'error', finished_at = now(), error_message = $2, error_kind = $3
                    WHERE id = $1
                    "#,
                )
                .bind(run_id)
                .bind(message)
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest(&self, job_id: i64) -> Result<Option<RunRecord>> {
        self.fetch_record("r.job_id = $1 ORDER BY r.id DESC LIMIT 1", job_id, None)
            .await
    }

    async fn by_id(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.fetch_record("r.id = $1", run_id, None).await
    }

    async fn prev(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>> {
        self.fetch_record(
            "r.job_id = $1 AND r.id < $2 ORDER BY r.id DESC LIMIT 1",
            job_id,
            Some(run_id),
        )
        .await
    }

    async fn next(&self, job_id: i64, run_id: i64) -> Result<Option<RunRecord>> {
        self.fetch_record(
            "r.job_id = $1 AND r.id > $2 ORDER BY r.id ASC LIMIT 1",
            job_id,
            Some(run_id),
        )
        .await
    }

    async fn range(&self, job_id: i64, query: &RangeQuery) -> Result<Vec<QueryRun>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM query_runs r WHERE r.job_id = "
        ));
        qb.push_bind(job_id);
        if let Some(start) = query.start {
            qb.push(" AND r.scheduled_at >= ").push_bind(start);
        }
        if let Some(end) = query.end {
            qb.push(" AND r.scheduled_at < ").push_bind(end);
        }
        if let Some(before) = query.before {
            qb.push(" AND r.id < ").push_bind(before);
        }
        if let Some(after) = query.after {
            qb.push(" AND r.id > ").push_bind(after);
        }
        qb.push(if query.anchored_at_end() {
            " ORDER BY r.id DESC"
        } else {
            " ORDER BY r.id ASC"
        });
        qb.push(" LIMIT ").push_bind(i64::from(query.effective_limit()));

        let rows: Vec<RunRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut runs = rows
            .into_iter()
            .map(QueryRun::try_from)
            .collect::<Result<Vec<_>>>()?;
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn fail_stale_runs(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE query_runs
            SET status = 'error', finished_at = now(), error_message = $1, error_kind = $2
            WHERE status = 'running'
            "#,
        )
        .bind(message)
        .bind(ErrorKind::Persistence.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    name: String,
    sql_text: String,
    data_source_id: i64,
    schedule_type: String,
    schedule_expr: Option<String>,
    timezone: String,
    enabled: bool,
    row_limit: Option<i64>,
    timeout_ms: Option<i64>,
}

impl TryFrom<JobRow> for QueryJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let kind = row
            .schedule_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("job {}: {}", row.id, e)))?;
        Ok(QueryJob {
            id: row.id,
            name: row.name,
            sql_text: row.sql_text,
            data_source_id: row.data_source_id,
            schedule: ScheduleDescriptor {
                kind,
                expression: row.schedule_expr.unwrap_or_default(),
                timezone: row.timezone,
            },
            enabled: row.enabled,
            row_limit: row.row_limit.and_then(|n| u64::try_from(n).ok()),
            timeout_ms: row.timeout_ms.and_then(|n| u64::try_from(n).ok()),
        })
    }
}

#[async_trait]
impl JobSource for PostgresStore {
    async fn load_jobs(&self) -> Result<Vec<QueryJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, name, sql_text, data_source_id, schedule_type, schedule_expr,
                   timezone, enabled, row_limit, timeout_ms
            FROM query_jobs
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueryJob::try_from).collect()
    }

    async fn get_job(&self, id: i64) -> Result<Option<QueryJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT id, name, sql_text, data_source_id, schedule_type, schedule_expr,
                   timezone, enabled, row_limit, timeout_ms
            FROM query_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueryJob::try_from).transpose()
    }
}

#[derive(Debug, FromRow)]
struct DataSourceRow {
    id: i64,
    name: String,
    host: String,
    port: i32,
    dbname: String,
    username: String,
    enc_password: Vec<u8>,
    enc_algo: String,
    key_version: i32,
}

impl TryFrom<DataSourceRow> for DataSource {
    type Error = StoreError;

    fn try_from(row: DataSourceRow) -> Result<Self> {
        let port = u16::try_from(row.port).map_err(|_| {
            StoreError::Corrupt(format!("data source {}: bad port {}", row.id, row.port))
        })?;
        Ok(DataSource {
            id: row.id,
            name: row.name,
            host: row.host,
            port,
            dbname: row.dbname,
            username: row.username,
            credential: SealedCredential {
                ciphertext: row.enc_password,
                algorithm: row.enc_algo,
                key_version: row.key_version,
            },
        })
    }
}

const DATA_SOURCE_COLUMNS: &str =
    "id, name, host, port, dbname, username, enc_password, enc_algo, key_version";

#[async_trait]
impl DataSourceStore for PostgresStore {
    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        let rows: Vec<DataSourceRow> = sqlx::query_as(&format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DataSource::try_from).collect()
    }

    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>> {
        let row: Option<DataSourceRow> = sqlx::query_as(&format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DataSource::try_from).transpose()
    }

    #[instrument(skip(self, expected, replacement), fields(data_source_id = id))]
    async fn swap_credential(
        &self,
        id: i64,
        expected: &SealedCredential,
        replacement: &SealedCredential,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET enc_password = $2, enc_algo = $3, key_version = $4, updated_at = now()
            WHERE id = $1 AND enc_password = $5 AND enc_algo = $6 AND key_version = $7
            "#,
        )
        .bind(id)
        .bind(&replacement.ciphertext)
        .bind(&replacement.algorithm)
        .bind(replacement.key_version)
        .bind(&expected.ciphertext)
        .bind(&expected.algorithm)
        .bind(expected.key_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
