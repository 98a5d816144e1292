use super::*;
use crate::executor::{Column, ColumnType};
use chrono::{Duration, TimeZone};
use serde_json::json;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

fn new_run(job_id: i64, hour: u32) -> NewRun {
    NewRun {
        job_id,
        scheduled_at: at(hour),
        timezone: "UTC".to_string(),
    }
}

fn table(values: &[i64]) -> ResultTable {
    ResultTable {
        columns: vec![Column::new("n", ColumnType::Integer)],
        rows: values.iter().map(|v| vec![json!(v)]).collect(),
    }
}

async fn finished(store: &MemoryResultStore, job_id: i64, hour: u32) -> i64 {
    let id = store.begin_run(&new_run(job_id, hour)).await.unwrap();
    store
        .complete_run(id, RunOutcome::Success(table(&[hour as i64])))
        .await
        .unwrap();
    id
}

/// Store with ids 1..=12 where job 7 owns 10, 11, 12 and job 3 owns the rest.
async fn navigation_fixture() -> MemoryResultStore {
    let store = MemoryResultStore::new();
    for hour in 0..9 {
        finished(&store, 3, hour).await;
    }
    for hour in 0..3 {
        finished(&store, 7, hour).await;
    }
    store
}

#[tokio::test]
async fn test_prev_next_are_inverses() {
    let store = navigation_fixture().await;

    let next = store.next(7, 10).await.unwrap().unwrap();
    assert_eq!(next.run.id, 11);
    let prev = store.prev(7, 12).await.unwrap().unwrap();
    assert_eq!(prev.run.id, 11);
    let latest = store.latest(7).await.unwrap().unwrap();
    assert_eq!(latest.run.id, 12);

    assert!(store.prev(7, 10).await.unwrap().is_none());
    assert!(store.next(7, 12).await.unwrap().is_none());
}

#[tokio::test]
async fn test_navigation_stays_within_job() {
    let store = navigation_fixture().await;

    // Run 9 belongs to job 3, so job 7 has nothing before 10.
    assert!(store.prev(7, 10).await.unwrap().is_none());
    let next = store.next(3, 8).await.unwrap().unwrap();
    assert_eq!(next.run.id, 9);
    assert!(store.next(3, 9).await.unwrap().is_none());
}

#[tokio::test]
async fn test_latest_tracks_newest_run_of_job() {
    let store = navigation_fixture().await;
    assert_eq!(store.latest(3).await.unwrap().unwrap().run.id, 9);

    // A run in progress is the newest one and has no blob yet.
    let running = store.begin_run(&new_run(7, 5)).await.unwrap();
    let latest = store.latest(7).await.unwrap().unwrap();
    assert_eq!(latest.run.id, running);
    assert_eq!(latest.run.status, RunStatus::Running);
    assert!(latest.blob.is_none());
    assert_eq!(store.latest(3).await.unwrap().unwrap().run.id, 9);
}

#[tokio::test]
async fn test_latest_on_unknown_job() {
    let store = MemoryResultStore::new();
    assert!(store.latest(42).await.unwrap().is_none());
    assert!(store.by_id(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_single_running_run_per_job() {
    let store = MemoryResultStore::new();

    let first = store.begin_run(&new_run(1, 0)).await.unwrap();
    let second = store.begin_run(&new_run(1, 1)).await;
    assert!(matches!(second, Err(StoreError::AlreadyRunning { job_id: 1 })));

    // Another job is unaffected.
    store.begin_run(&new_run(2, 0)).await.unwrap();

    store
        .complete_run(
            first,
            RunOutcome::Failure {
                kind: ErrorKind::Query,
                message: "boom".to_string(),
            },
        )
        .await
        .unwrap();
    store.begin_run(&new_run(1, 1)).await.unwrap();
    assert_eq!(store.run_count(1).await, 2);
}

#[tokio::test]
async fn test_success_has_blob_error_has_none() {
    let store = MemoryResultStore::new();

    let ok = finished(&store, 1, 0).await;
    let record = store.by_id(ok).await.unwrap().unwrap();
    assert_eq!(record.run.status, RunStatus::Success);
    assert_eq!(record.run.row_count, Some(1));
    assert!(record.run.error_message.is_none());
    let blob = record.blob.unwrap();
    assert_eq!(blob.row_count, 1);
    assert!(blob.byte_size > 0);

    let failed = store.begin_run(&new_run(1, 1)).await.unwrap();
    store
        .complete_run(
            failed,
            RunOutcome::Failure {
                kind: ErrorKind::Timeout,
                message: "statement timeout".to_string(),
            },
        )
        .await
        .unwrap();
    let record = store.by_id(failed).await.unwrap().unwrap();
    assert_eq!(record.run.status, RunStatus::Error);
    assert_eq!(record.run.error_message.as_deref(), Some("statement timeout"));
    assert_eq!(record.run.error_kind, Some(ErrorKind::Timeout));
    assert!(record.blob.is_none());
    assert_eq!(store.blob_count().await, 1);
}

#[tokio::test]
async fn test_complete_twice_is_rejected() {
    let store = MemoryResultStore::new();
    let id = finished(&store, 1, 0).await;

    let again = store.complete_run(id, RunOutcome::Success(table(&[]))).await;
    assert!(matches!(again, Err(StoreError::NotRunning(i)) if i == id));

    let missing = store.complete_run(999, RunOutcome::Success(table(&[]))).await;
    assert!(matches!(missing, Err(StoreError::RunNotFound(999))));
}

#[tokio::test]
async fn test_range_time_bounds() {
    let store = MemoryResultStore::new();
    for hour in 0..6 {
        finished(&store, 1, hour).await;
    }

    let runs = store
        .range(1, &RangeQuery::new().between(Some(at(1)), Some(at(4))))
        .await
        .unwrap();
    let hours: Vec<DateTime<Utc>> = runs.iter().map(|r| r.scheduled_at).collect();
    assert_eq!(hours, vec![at(1), at(2), at(3)]);
}

#[tokio::test]
async fn test_range_cursors_and_limit() {
    let store = MemoryResultStore::new();
    for hour in 0..10 {
        finished(&store, 1, hour).await;
    }

    let after: Vec<i64> = store
        .range(1, &RangeQuery::new().after(3).limit(2))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(after, vec![4, 5]);

    // A lone `before` cursor pages backwards but still returns ascending ids.
    let before: Vec<i64> = store
        .range(1, &RangeQuery::new().before(8).limit(3))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(before, vec![5, 6, 7]);

    let window: Vec<i64> = store
        .range(1, &RangeQuery::new().after(2).before(6))
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(window, vec![3, 4, 5]);
}

#[test]
fn test_range_limit_is_clamped() {
    assert_eq!(RangeQuery::new().effective_limit(), DEFAULT_RANGE_LIMIT);
    assert_eq!(RangeQuery::new().limit(0).effective_limit(), 1);
    assert_eq!(
        RangeQuery::new().limit(50_000).effective_limit(),
        MAX_RANGE_LIMIT
    );
}

#[tokio::test]
async fn test_fail_stale_runs() {
    let store = MemoryResultStore::new();
    let done = finished(&store, 1, 0).await;
    let stale = store.begin_run(&new_run(2, 0)).await.unwrap();

    let changed = store
        .fail_stale_runs("interrupted by scheduler restart")
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let record = store.by_id(stale).await.unwrap().unwrap();
    assert_eq!(record.run.status, RunStatus::Error);
    assert!(record.run.finished_at.is_some());
    assert_eq!(
        store.by_id(done).await.unwrap().unwrap().run.status,
        RunStatus::Success
    );
    // The job can start again.
    store.begin_run(&new_run(2, 1)).await.unwrap();
}

#[test]
fn test_run_status_parse() {
    assert_eq!("running".parse::<RunStatus>().unwrap(), RunStatus::Running);
    assert_eq!(RunStatus::Success.to_string(), "success");
    assert!("done".parse::<RunStatus>().is_err());
}

#[test]
fn test_store_error_retryability() {
    assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    assert!(!StoreError::AlreadyRunning { job_id: 1 }.is_retryable());
    assert!(!StoreError::NotRunning(1).is_retryable());
}

#[test]
fn test_range_matches_half_open_window() {
    let run = QueryRun {
        id: 5,
        job_id: 1,
        scheduled_at: at(4),
        timezone: "UTC".to_string(),
        started_at: at(4),
        finished_at: Some(at(4) + Duration::seconds(1)),
        status: RunStatus::Success,
        row_count: Some(0),
        error_message: None,
        error_kind: None,
    };
    assert!(RangeQuery::new().between(Some(at(4)), None).matches(&run));
    assert!(!RangeQuery::new().between(None, Some(at(4))).matches(&run));
}

#[cfg(feature = "pg-tests")]
mod postgres {
    use super::*;
    use crate::datasource::{DataSourceStore, SealedCredential};
    use crate::registry::JobSource;

    async fn store() -> PostgresStore {
        let url = std::env::var("PGSCHED_TEST_DATABASE_URL")
            .expect("PGSCHED_TEST_DATABASE_URL must be set for pg-tests");
        let store = PostgresStore::connect(&url, &PoolConfig::default())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        store
    }

    async fn seed_job(store: &PostgresStore) -> i64 {
        let (ds,): (i64,) = sqlx::query_as(
            "INSERT INTO data_sources (name, host, port, dbname, username, enc_password, enc_algo, key_version) \
             VALUES ('t', 'localhost', 5432, 'db', 'u', '\\x00', 'libsodium-sealedbox', 1) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        let (job,): (i64,) = sqlx::query_as(
            "INSERT INTO query_jobs (name, sql_text, data_source_id, schedule_type, schedule_expr) \
             VALUES ('t', 'SELECT 1', $1, 'interval', 'PT1H') RETURNING id",
        )
        .bind(ds)
        .fetch_one(store.pool())
        .await
        .unwrap();
        job
    }

    #[tokio::test]
    async fn test_pg_begin_complete_navigate() {
        let store = store().await;
        let job = seed_job(&store).await;

        let first = store.begin_run(&new_run(job, 0)).await.unwrap();
        assert!(matches!(
            store.begin_run(&new_run(job, 1)).await,
            Err(StoreError::AlreadyRunning { .. })
        ));
        store
            .complete_run(first, RunOutcome::Success(table(&[1, 2])))
            .await
            .unwrap();

        let second = store.begin_run(&new_run(job, 1)).await.unwrap();
        store
            .complete_run(
                second,
                RunOutcome::Failure {
                    kind: ErrorKind::Query,
                    message: "relation does not exist".to_string(),
                },
            )
            .await
            .unwrap();

        let latest = store.latest(job).await.unwrap().unwrap();
        assert_eq!(latest.run.id, second);
        assert!(latest.blob.is_none());

        let prev = store.prev(job, second).await.unwrap().unwrap();
        assert_eq!(prev.run.id, first);
        assert_eq!(prev.blob.unwrap().row_count, 2);

        let runs = store.range(job, &RangeQuery::new()).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_pg_swap_credential_is_compare_and_swap() {
        let store = store().await;
        let job = seed_job(&store).await;
        let source_id = store.get_job(job).await.unwrap().unwrap().data_source_id;
        let current = store
            .get_data_source(source_id)
            .await
            .unwrap()
            .unwrap()
            .credential;

        let replacement = SealedCredential {
            ciphertext: vec![1, 2, 3],
            algorithm: current.algorithm.clone(),
            key_version: current.key_version + 1,
        };
        assert!(store
            .swap_credential(source_id, &current, &replacement)
            .await
            .unwrap());
        // The old value no longer matches.
        assert!(!store
            .swap_credential(source_id, &current, &replacement)
            .await
            .unwrap());
    }
}
