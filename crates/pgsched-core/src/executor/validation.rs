//! Static read-only check for job SQL
//!
//! Runs at registration and again before every execution, always before a
//! connection is opened. A statement passes only if it parses as exactly one
//! query whose every nested query is a plain read.

use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use thiserror::Error;

/// Alias of the derived table used for row limiting
pub const LIMIT_ALIAS: &str = "_pgsched_limited";

/// Functions with effects outside the current read
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "nextval",
    "setval",
    "set_config",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_switch_wal",
    "pg_create_restore_point",
    "pg_notify",
    "pg_logical_emit_message",
    "pg_import_system_collations",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "txid_current",
    "query_to_xml",
];

const FORBIDDEN_PREFIXES: &[&str] = &[
    "pg_advisory_",
    "pg_try_advisory_",
    "lo_",
    "dblink",
    "pg_stat_reset",
    "pg_replication_",
    "pg_create_",
    "pg_drop_",
    "pg_file_",
];

/// Why a statement is not an acceptable read-only query
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryValidationError {
    /// Statement text is blank
    #[error("SQL is empty")]
    Empty,

    /// Parser rejected the text
    #[error("SQL parse error: {0}")]
    Parse(String),

    /// More than one statement
    #[error("expected exactly one statement, found {0}")]
    MultipleStatements(usize),

    /// Top-level or nested statement that is not a query
    #[error("{0} statements are not allowed; only SELECT queries may be scheduled")]
    NotAQuery(String),

    /// Query body that writes (`INSERT`/`UPDATE` inside a query)
    #[error("data-modifying {0} is not allowed inside a query")]
    WritingBody(String),

    /// `SELECT ... INTO`
    #[error("SELECT ... INTO creates a table and is not allowed")]
    SelectInto,

    /// `FOR UPDATE` / `FOR SHARE`
    #[error("locking clauses (FOR UPDATE/SHARE) are not allowed")]
    Locking,

    /// Call to a side-effecting function
    #[error("function {0}() has side effects and is not allowed")]
    ForbiddenFunction(String),
}

/// SQL that passed validation, ready to send to a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    sql: String,
}

impl ValidatedQuery {
    /// Statement as rendered from its parse tree.
    ///
    /// Comments and statement terminators do not survive, so the text can be
    /// embedded in a larger statement as is.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Statement wrapped in an outer `LIMIT`.
    ///
    /// The inner text is placed on its own lines to keep token boundaries.
    pub fn limited(&self, limit: u64) -> String {
        format!(
            "SELECT * FROM (\n{}\n) AS {} LIMIT {}",
            self.sql, LIMIT_ALIAS, limit
        )
    }
}

/// Validate that `sql` is a single read-only query.
pub fn validate_sql(sql: &str) -> Result<ValidatedQuery, QueryValidationError> {
    let trimmed = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(QueryValidationError::Empty);
    }

    let statements = Parser::parse_sql(&PostgreSqlDialect {}, trimmed)
        .map_err(|e| QueryValidationError::Parse(e.to_string()))?;
    match statements.len() {
        0 => return Err(QueryValidationError::Empty),
        1 => {}
        n => return Err(QueryValidationError::MultipleStatements(n)),
    }

    let mut check = ReadOnlyCheck;
    if let ControlFlow::Break(err) = statements[0].visit(&mut check) {
        return Err(err);
    }

    Ok(ValidatedQuery {
        sql: statements[0].to_string(),
    })
}

struct ReadOnlyCheck;

impl Visitor for ReadOnlyCheck {
    type Break = QueryValidationError;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        match statement {
            Statement::Query(_) => ControlFlow::Continue(()),
            other => ControlFlow::Break(QueryValidationError::NotAQuery(leading_keyword(other))),
        }
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(QueryValidationError::Locking);
        }
        check_body(&query.body)
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(func) => check_function(&func.name),
            _ => ControlFlow::Continue(()),
        }
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Table {
                name, args: Some(_), ..
            } => check_function(name),
            TableFactor::Function { name, .. } => check_function(name),
            _ => ControlFlow::Continue(()),
        }
    }
}

fn check_body(body: &SetExpr) -> ControlFlow<QueryValidationError> {
    match body {
        SetExpr::Select(select) if select.into.is_some() => {
            ControlFlow::Break(QueryValidationError::SelectInto)
        }
        SetExpr::SetOperation { left, right, .. } => match check_body(left) {
            ControlFlow::Continue(()) => check_body(right),
            brk => brk,
        },
        SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::Values(_) | SetExpr::Table(_) => {
            ControlFlow::Continue(())
        }
        SetExpr::Insert(stmt) | SetExpr::Update(stmt) => {
            ControlFlow::Break(QueryValidationError::WritingBody(leading_keyword(stmt)))
        }
        #[allow(unreachable_patterns)]
        other => ControlFlow::Break(QueryValidationError::WritingBody(
            other.to_string().split_whitespace().next().unwrap_or("statement").to_uppercase(),
        )),
    }
}

fn check_function(name: &ObjectName) -> ControlFlow<QueryValidationError> {
    let full = name.to_string();
    let base = full
        .rsplit('.')
        .next()
        .unwrap_or(full.as_str())
        .trim_matches('"')
        .to_ascii_lowercase();

    let forbidden = FORBIDDEN_FUNCTIONS.contains(&base.as_str())
        || FORBIDDEN_PREFIXES.iter().any(|p| base.starts_with(p));
    if forbidden {
        ControlFlow::Break(QueryValidationError::ForbiddenFunction(base))
    } else {
        ControlFlow::Continue(())
    }
}

fn leading_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> QueryValidationError {
        validate_sql(sql).expect_err(sql)
    }

    #[test]
    fn test_plain_select_passes() {
        let q = validate_sql("SELECT id, name FROM users WHERE active;").unwrap();
        assert_eq!(q.sql(), "SELECT id, name FROM users WHERE active");
    }

    #[test]
    fn test_read_only_shapes_pass() {
        for sql in [
            "WITH recent AS (SELECT * FROM orders WHERE created_at > now() - interval '1 day') SELECT count(*) FROM recent",
            "SELECT 1 UNION ALL SELECT 2",
            "VALUES (1, 'a'), (2, 'b')",
            "(SELECT 1)",
            "SELECT now()::date, lower('X'), coalesce(NULL, 1)",
            "SELECT * FROM generate_series(1, 3)",
        ] {
            assert!(validate_sql(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn test_dml_and_ddl_rejected() {
        assert_eq!(
            rejected("DELETE FROM users"),
            QueryValidationError::NotAQuery("DELETE".to_string())
        );
        assert_eq!(
            rejected("UPDATE users SET name = 'x'"),
            QueryValidationError::NotAQuery("UPDATE".to_string())
        );
        assert_eq!(
            rejected("INSERT INTO users (id) VALUES (1)"),
            QueryValidationError::NotAQuery("INSERT".to_string())
        );
        assert_eq!(
            rejected("DROP TABLE users"),
            QueryValidationError::NotAQuery("DROP".to_string())
        );
        assert!(matches!(
            rejected("CREATE TABLE t (id int)"),
            QueryValidationError::NotAQuery(_)
        ));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert_eq!(
            rejected("SELECT 1; DELETE FROM users"),
            QueryValidationError::MultipleStatements(2)
        );
    }

    #[test]
    fn test_empty_and_garbage() {
        assert_eq!(rejected("   ;  "), QueryValidationError::Empty);
        assert!(matches!(rejected("SELEC 1"), QueryValidationError::Parse(_)));
    }

    #[test]
    fn test_select_into_and_locks_rejected() {
        assert_eq!(
            rejected("SELECT * INTO backup FROM users"),
            QueryValidationError::SelectInto
        );
        assert_eq!(
            rejected("SELECT * FROM users FOR UPDATE"),
            QueryValidationError::Locking
        );
        assert_eq!(
            rejected("SELECT * FROM (SELECT * FROM users FOR SHARE) s"),
            QueryValidationError::Locking
        );
    }

    #[test]
    fn test_side_effect_functions_rejected() {
        assert_eq!(
            rejected("SELECT nextval('seq')"),
            QueryValidationError::ForbiddenFunction("nextval".to_string())
        );
        assert_eq!(
            rejected("SELECT pg_catalog.set_config('x', 'y', false)"),
            QueryValidationError::ForbiddenFunction("set_config".to_string())
        );
        assert!(matches!(
            rejected("SELECT pg_advisory_lock(1)"),
            QueryValidationError::ForbiddenFunction(_)
        ));
        let cte = "WITH x AS (SELECT pg_terminate_backend(pid) FROM pg_stat_activity) SELECT * FROM x";
        assert!(matches!(rejected(cte), QueryValidationError::ForbiddenFunction(_)));
        assert!(matches!(
            rejected("SELECT id FROM t WHERE id IN (SELECT lo_unlink(1))"),
            QueryValidationError::ForbiddenFunction(_)
        ));
    }

    #[test]
    fn test_limited_wraps_with_newlines() {
        let q = validate_sql("SELECT * FROM t -- trailing comment").unwrap();
        let wrapped = q.limited(5);
        assert_eq!(wrapped, "SELECT * FROM (\nSELECT * FROM t\n) AS _pgsched_limited LIMIT 5");
        // The wrapped statement itself stays valid and read-only.
        assert!(validate_sql(&wrapped).is_ok());
    }

    #[test]
    fn test_limited_drops_terminator_before_comment() {
        for sql in [
            "SELECT id FROM t; -- nightly report",
            "SELECT id FROM t; /* nightly */",
            "SELECT id FROM t;\n-- owner: reporting\n;",
        ] {
            let q = validate_sql(sql).unwrap();
            assert_eq!(q.sql(), "SELECT id FROM t", "{sql}");
            let wrapped = q.limited(10);
            assert_eq!(
                wrapped,
                "SELECT * FROM (\nSELECT id FROM t\n) AS _pgsched_limited LIMIT 10"
            );
            assert!(validate_sql(&wrapped).is_ok(), "{wrapped}");
        }
    }

    #[test]
    fn test_wrapping_volatile_reads_is_still_validated() {
        // Volatile but effect-free functions survive wrapping unchanged.
        for sql in ["SELECT random()", "SELECT clock_timestamp()", "SELECT gen_random_uuid()"] {
            let q = validate_sql(sql).unwrap();
            assert!(validate_sql(&q.limited(10)).is_ok(), "{sql}");
        }
        // Effectful ones are refused before any wrapping happens.
        for sql in ["SELECT setval('s', 1)", "SELECT * FROM dblink('x', 'y') AS t(a int)"] {
            assert!(validate_sql(sql).is_err(), "{sql}");
        }
    }
}
