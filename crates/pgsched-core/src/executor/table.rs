//! Result table encoding
//!
//! A fixed-schema table: an ordered list of typed columns and row-oriented
//! JSON values. Timestamps are ISO-8601 strings, numerics are JSON numbers,
//! binary values are base64 and SQL NULL is JSON null.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value class of a result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// `bool`
    Boolean,
    /// `int2`, `int4`, `int8`, `oid`
    Integer,
    /// `float4`, `float8`
    Float,
    /// `numeric`
    Numeric,
    /// `text`, `varchar`, `bpchar`, `name`, `char`
    Text,
    /// `uuid`
    Uuid,
    /// `date`
    Date,
    /// `time`
    Time,
    /// `timestamp`
    Timestamp,
    /// `timestamptz`
    Timestamptz,
    /// `json`, `jsonb`
    Json,
    /// `bytea`
    Binary,
}

impl ColumnType {
    /// Map a Postgres type name to a column type.
    ///
    /// `None` means the type has no JSON representation here and the run
    /// must fail rather than guess.
    pub fn from_pg_type(name: &str) -> Option<Self> {
        let ty = match name.to_ascii_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => Self::Boolean,
            "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "OID" => {
                Self::Integer
            }
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => Self::Float,
            "NUMERIC" | "DECIMAL" => Self::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CHARACTER VARYING"
            | "CHARACTER" => Self::Text,
            "UUID" => Self::Uuid,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::Timestamptz,
            "JSON" | "JSONB" => Self::Json,
            "BYTEA" => Self::Binary,
            _ => return None,
        };
        Some(ty)
    }

    /// Serialized name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Numeric => "numeric",
            Self::Text => "text",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::Time => "time",
            Self::Timestamp => "timestamp",
            Self::Timestamptz => "timestamptz",
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column label as returned by the source
    pub name: String,
    /// Value class
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    /// Create a column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Shaped query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    /// Ordered column schema
    pub columns: Vec<Column>,
    /// Rows in source order; every row has one value per column
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    /// Empty table with a fixed schema
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Rejects rows whose width differs from the schema.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "row has {} values but table has {} columns",
                row.len(),
                self.columns.len()
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}
