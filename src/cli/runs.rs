//! Runs command - browse a job's recorded runs

use crate::server::config::AppConfig;
use crate::server::connect_store;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use pgsched_core::{RangeQuery, ResultStore, RunRecord};

/// Which run(s) to show; defaults to the latest
#[derive(Args, Debug, Clone, Default)]
#[group(id = "selection", multiple = false)]
pub struct Selection {
    /// Most recent run
    #[arg(long)]
    pub latest: bool,
    /// Run before this run id
    #[arg(long, value_name = "RUN_ID")]
    pub prev: Option<i64>,
    /// Run after this run id
    #[arg(long, value_name = "RUN_ID")]
    pub next: Option<i64>,
    /// A specific run id
    #[arg(long, value_name = "RUN_ID")]
    pub id: Option<i64>,
    /// List up to N runs (metadata only), oldest first
    #[arg(long, value_name = "N")]
    pub list: Option<u32>,
}

/// Time window for `--list`
#[derive(Args, Debug, Clone, Default)]
pub struct Window {
    /// Only runs scheduled at or after this RFC 3339 instant
    #[arg(long, requires = "list")]
    pub since: Option<DateTime<Utc>>,
    /// Only runs scheduled before this RFC 3339 instant
    #[arg(long, requires = "list")]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Latest,
    Prev(i64),
    Next(i64),
    Id(i64),
    List(u32),
}

impl Selection {
    pub fn target(&self) -> Target {
        if let Some(id) = self.prev {
            Target::Prev(id)
        } else if let Some(id) = self.next {
            Target::Next(id)
        } else if let Some(id) = self.id {
            Target::Id(id)
        } else if let Some(n) = self.list {
            Target::List(n)
        } else {
            Target::Latest
        }
    }
}

/// Run the runs command
pub async fn run(
    config: &AppConfig,
    job_id: i64,
    select: &Selection,
    window: &Window,
) -> Result<()> {
    if let (Some(since), Some(until)) = (window.since, window.until) {
        if since >= until {
            bail!("--since must be earlier than --until");
        }
    }
    let store = connect_store(config).await?;

    let record = match select.target() {
        Target::Latest => store.latest(job_id).await?,
        Target::Prev(run_id) => store.prev(job_id, run_id).await?,
        Target::Next(run_id) => store.next(job_id, run_id).await?,
        Target::Id(run_id) => store
            .by_id(run_id)
            .await?
            .filter(|r| r.run.job_id == job_id),
        Target::List(limit) => {
            let query = RangeQuery::new()
                .between(window.since, window.until)
                .limit(limit);
            let runs = store.range(job_id, &query).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            return Ok(());
        }
    };

    print_record(record.as_ref(), job_id)
}

fn print_record(record: Option<&RunRecord>, job_id: i64) -> Result<()> {
    match record {
        Some(record) => println!("{}", serde_json::to_string_pretty(record)?),
        None => eprintln!("No matching run for job {job_id}"),
    }
    Ok(())
}
