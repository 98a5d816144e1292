//! Fixtures shared by unit tests

use chrono::{DateTime, TimeZone, Utc};
use pgsched_crypto::PublicKey;

use crate::datasource::DataSource;
use crate::registry::{validate_job, QueryJob, RegistrySnapshot, ScheduleDescriptor, ValidatedJob};
use crate::vault::CredentialVault;

pub(crate) fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub(crate) fn query_job(id: i64, sql: &str, schedule: ScheduleDescriptor) -> QueryJob {
    QueryJob {
        id,
        name: format!("job-{id}"),
        sql_text: sql.to_string(),
        data_source_id: 1,
        schedule,
        enabled: true,
        row_limit: None,
        timeout_ms: None,
    }
}

pub(crate) fn interval_job(id: i64, expr: &str) -> QueryJob {
    query_job(id, "SELECT 1", ScheduleDescriptor::interval(expr))
}

pub(crate) fn validated(job: QueryJob) -> ValidatedJob {
    validate_job(&job).unwrap()
}

pub(crate) fn snapshot(jobs: Vec<QueryJob>, now: DateTime<Utc>) -> RegistrySnapshot {
    RegistrySnapshot::build(jobs, 3600, now)
}

pub(crate) fn data_source(
    id: i64,
    password: &str,
    public: &PublicKey,
    key_version: i32,
) -> DataSource {
    DataSource {
        id,
        name: format!("source-{id}"),
        host: "db.internal".to_string(),
        port: 5432,
        dbname: "analytics".to_string(),
        username: "reporter".to_string(),
        credential: CredentialVault::seal(password, public, key_version).unwrap(),
    }
}
