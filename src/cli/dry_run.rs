//! Dry-run command - executes a job once without recording a run

use crate::server::config::AppConfig;
use crate::server::{build_executor, connect_store, source_connector};
use anyhow::{anyhow, bail, Result};
use pgsched_core::{format_error_for_cli, DataSourceStore, ExecuteOptions, JobSource};

/// Run the dry-run command
pub async fn run(config: &AppConfig, job_id: i64, limit: Option<u64>) -> Result<()> {
    let store = connect_store(config).await?;

    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| anyhow!("Job {job_id} not found"))?;
    let source = store
        .get_data_source(job.data_source_id)
        .await?
        .ok_or_else(|| anyhow!("Data source {} of job {job_id} not found", job.data_source_id))?;

    let executor = build_executor(config, store, source_connector(config))?;
    let mut options = ExecuteOptions::dry_run();
    if let Some(limit) = limit {
        options = options.with_row_limit(limit);
    }

    match executor.run(&job, &source, options).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => bail!(format_error_for_cli(&pgsched_core::Error::from(e))),
    }
}
