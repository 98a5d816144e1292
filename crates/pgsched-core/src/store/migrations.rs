use super::{PostgresStore, Result};

const STATEMENTS: &[(&str, &str)] = &[
    (
        "data_sources",
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL DEFAULT 5432,
            dbname TEXT NOT NULL,
            username TEXT NOT NULL,
            enc_password BYTEA NOT NULL,
            enc_algo TEXT NOT NULL,
            key_version INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "query_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS query_jobs (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            sql_text TEXT NOT NULL,
            data_source_id BIGINT NOT NULL REFERENCES data_sources(id),
            schedule_type TEXT NOT NULL CHECK (schedule_type IN ('cron', 'interval')),
            schedule_expr TEXT,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            row_limit BIGINT,
            timeout_ms BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "query_runs",
        r#"
        CREATE TABLE IF NOT EXISTS query_runs (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES query_jobs(id) ON DELETE CASCADE,
            scheduled_at TIMESTAMPTZ NOT NULL,
            timezone TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            finished_at TIMESTAMPTZ,
            status TEXT NOT NULL CHECK (status IN ('running', 'success', 'error')),
            row_count BIGINT,
            error_message TEXT,
            error_kind TEXT,
            CHECK ((status = 'error') = (error_message IS NOT NULL))
        )
        "#,
    ),
    (
        "query_run_blobs",
        r#"
        CREATE TABLE IF NOT EXISTS query_run_blobs (
            run_id BIGINT PRIMARY KEY REFERENCES query_runs(id) ON DELETE CASCADE,
            result_json JSONB NOT NULL,
            row_count BIGINT NOT NULL,
            byte_size BIGINT NOT NULL
        )
        "#,
    ),
    (
        "idx_runs_single_running",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_running ON query_runs(job_id) WHERE status = 'running'",
    ),
    (
        "idx_runs_job_id",
        "CREATE INDEX IF NOT EXISTS idx_runs_job_id ON query_runs(job_id, id)",
    ),
    (
        "idx_runs_job_scheduled",
        "CREATE INDEX IF NOT EXISTS idx_runs_job_scheduled ON query_runs(job_id, scheduled_at)",
    ),
    (
        "idx_jobs_enabled",
        "CREATE INDEX IF NOT EXISTS idx_jobs_enabled ON query_jobs(enabled)",
    ),
];

impl PostgresStore {
    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (name, statement) in STATEMENTS {
            tracing::debug!(migration = %name, "Applying migration");
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
