//! Connections to source databases
//!
//! [`SourceConnector`] is the only place that talks to a source. The
//! Postgres implementation keeps one bounded pool per data source so a busy
//! schedule cannot exhaust the source's connection limit.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Number, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column as _, Executor as _, Row as _, Statement as _, TypeInfo as _};
use std::time::Duration;
use tracing::debug;

use super::table::{Column, ColumnType, ResultTable};
use super::ExecError;
use crate::datasource::DataSource;

/// Everything needed to open a session on a source
#[derive(Debug)]
pub struct ConnectTarget {
    /// Data source id
    pub data_source_id: i64,
    /// Key version the password was sealed with
    pub key_version: i32,
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Database
    pub dbname: String,
    /// Login role
    pub username: String,
    /// Opened password; lives only for the duration of the call
    pub password: SecretString,
}

impl ConnectTarget {
    /// Combine a data source with its opened password
    pub fn new(source: &DataSource, password: SecretString) -> Self {
        Self {
            data_source_id: source.id,
            key_version: source.credential.key_version,
            host: source.host.clone(),
            port: source.port,
            dbname: source.dbname.clone(),
            username: source.username.clone(),
            password,
        }
    }
}

/// Opens sessions on source databases and runs read-only statements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Run `sql` in a read-only transaction with a server-side statement
    /// timeout and shape the rows.
    async fn fetch(
        &self,
        target: &ConnectTarget,
        sql: &str,
        statement_timeout_ms: u64,
    ) -> Result<ResultTable, ExecError>;

    /// Check that a session can be opened
    async fn ping(&self, target: &ConnectTarget) -> Result<(), ExecError>;
}

/// Pool limits for source connections
#[derive(Debug, Clone)]
pub struct SourcePoolConfig {
    /// Connections per data source
    pub max_connections: u32,
    /// Bound on opening (or waiting for) a connection
    pub connect_timeout: Duration,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
}

impl Default for SourcePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 2,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    data_source_id: i64,
    key_version: i32,
    host: String,
    port: u16,
    dbname: String,
    username: String,
}

impl From<&ConnectTarget> for PoolKey {
    fn from(t: &ConnectTarget) -> Self {
        Self {
            data_source_id: t.data_source_id,
            key_version: t.key_version,
            host: t.host.clone(),
            port: t.port,
            dbname: t.dbname.clone(),
            username: t.username.clone(),
        }
    }
}

/// [`SourceConnector`] backed by per-source `sqlx` pools
pub struct PgSourceConnector {
    pools: DashMap<PoolKey, PgPool>,
    config: SourcePoolConfig,
}

impl PgSourceConnector {
    /// Create a connector with no open pools
    pub fn new(config: SourcePoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            config,
        }
    }

    /// Number of cached pools
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn pool_for(&self, target: &ConnectTarget) -> PgPool {
        let key = PoolKey::from(target);
        if let Some(pool) = self.pools.get(&key) {
            return pool.clone();
        }

        // Connection details or key version changed: retire the old pool.
        self.pools
            .retain(|k, _| k.data_source_id != target.data_source_id);

        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.dbname)
            .username(&target.username)
            .password(target.password.expose_secret())
            .application_name("pgsched")
            .options([("default_transaction_read_only", "on")]);

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .acquire_timeout(self.config.connect_timeout)
            .idle_timeout(Some(self.config.idle_timeout))
            .test_before_acquire(true)
            .connect_lazy_with(options);

        debug!(data_source_id = target.data_source_id, "Created source pool");
        self.pools.entry(key).or_insert(pool).clone()
    }
}

#[async_trait]
impl SourceConnector for PgSourceConnector {
    async fn fetch(
        &self,
        target: &ConnectTarget,
        sql: &str,
        statement_timeout_ms: u64,
    ) -> Result<ResultTable, ExecError> {
        let classify = |e: sqlx::Error| classify_error(e, statement_timeout_ms);
        let pool = self.pool_for(target);
        let mut tx = pool.begin().await.map_err(classify)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout_ms.max(1)
        ))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let statement = (&mut *tx).prepare(sql).await.map_err(classify)?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| {
                let pg_type = c.type_info().name().to_string();
                ColumnType::from_pg_type(&pg_type)
                    .map(|ty| (Column::new(c.name(), ty), pg_type.clone()))
                    .ok_or_else(|| {
                        ExecError::Query(format!(
                            "column \"{}\" has unsupported type {}",
                            c.name(),
                            pg_type
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rows = statement
            .query()
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;
        // Nothing was written; ending the transaction is best effort.
        let _ = tx.rollback().await;

        let (schema, pg_types): (Vec<Column>, Vec<String>) = columns.into_iter().unzip();
        let mut table = ResultTable::new(schema);
        for row in &rows {
            let values = table
                .columns
                .iter()
                .zip(&pg_types)
                .enumerate()
                .map(|(idx, (col, pg_type))| decode_cell(row, idx, pg_type, col.column_type))
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;
            table.push_row(values).map_err(ExecError::Query)?;
        }
        Ok(table)
    }

    async fn ping(&self, target: &ConnectTarget) -> Result<(), ExecError> {
        let pool = self.pool_for(target);
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| classify_error(e, 0))?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(|e| classify_error(e, 0))?;
        Ok(())
    }
}

/// Map a driver error onto the failure classes
pub(crate) fn classify_error(err: sqlx::Error, timeout_ms: u64) -> ExecError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // query_canceled, raised by statement_timeout
            Some("57014") => ExecError::Timeout { timeout_ms },
            Some(code)
                if code.starts_with("08")
                    || code.starts_with("28")
                    || code.starts_with("53")
                    || code == "3D000"
                    || code == "57P03" =>
            {
                ExecError::Connection(err.to_string())
            }
            _ => ExecError::Query(err.to_string()),
        },
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_) => ExecError::Connection(err.to_string()),
        _ => ExecError::Query(err.to_string()),
    }
}

fn decode_cell(
    row: &PgRow,
    idx: usize,
    pg_type: &str,
    ty: ColumnType,
) -> Result<Value, sqlx::Error> {
    let value = match ty {
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        ColumnType::Integer => match pg_type {
            "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(Value::from),
            "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(Value::from),
            "OID" => row
                .try_get::<Option<sqlx::postgres::types::Oid>, _>(idx)?
                .map(|oid| Value::from(oid.0)),
            _ => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        },
        ColumnType::Float => {
            let v = if pg_type == "FLOAT4" {
                row.try_get::<Option<f32>, _>(idx)?.map(f64::from)
            } else {
                row.try_get::<Option<f64>, _>(idx)?
            };
            // NaN and infinities have no JSON form.
            v.and_then(Number::from_f64).map(Value::Number)
        }
        ColumnType::Numeric => match row.try_get::<Option<BigDecimal>, _>(idx)? {
            Some(d) => Some(numeric_to_json(&d).map_err(|e| sqlx::Error::ColumnDecode {
                index: idx.to_string(),
                source: e.into(),
            })?),
            None => None,
        },
        ColumnType::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::String),
        ColumnType::Uuid => row
            .try_get::<Option<sqlx::types::Uuid>, _>(idx)?
            .map(|u| Value::String(u.to_string())),
        ColumnType::Date => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        ColumnType::Time => row
            .try_get::<Option<NaiveTime>, _>(idx)?
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string())),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        ColumnType::Timestamptz => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|t| Value::String(t.to_rfc3339())),
        ColumnType::Json => row.try_get::<Option<Value>, _>(idx)?,
        ColumnType::Binary => row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|b| Value::String(STANDARD.encode(b))),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn numeric_to_json(d: &BigDecimal) -> Result<Value, String> {
    let text = d.to_string();
    text.parse::<Number>()
        .map(Value::Number)
        .map_err(|e| format!("numeric {text} is not representable: {e}"))
}
