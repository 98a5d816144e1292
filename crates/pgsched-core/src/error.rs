//! Error types for pgsched-core
//!
//! Each subsystem has its own error enum; [`Error`] aggregates them and
//! [`ErrorKind`] gives the classification stored on failed runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ExecError;
use crate::registry::ConfigError;
use crate::rotation::RotationError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

/// Failure classes recorded on runs and used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed schedule or SQL at registration time
    Config,
    /// Ciphertext/key mismatch or unsupported algorithm
    Decryption,
    /// Statement is not a single read-only query
    QueryValidation,
    /// Source unreachable or authentication rejected
    Connection,
    /// Execution exceeded its deadline
    Timeout,
    /// Runtime SQL failure reported by the source
    Query,
    /// Writing the run or its blob failed
    Persistence,
}

impl ErrorKind {
    /// Whether waiting for the next fire can help.
    ///
    /// Validation and decryption failures persist until configuration changes.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Decryption | Self::QueryValidation | Self::Config)
    }

    /// Stable string form used in the `error_kind` column
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Decryption => "decryption",
            Self::QueryValidation => "query_validation",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Query => "query",
            Self::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "decryption" => Ok(Self::Decryption),
            "query_validation" => Ok(Self::QueryValidation),
            "connection" => Ok(Self::Connection),
            "timeout" => Ok(Self::Timeout),
            "query" => Ok(Self::Query),
            "persistence" => Ok(Self::Persistence),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid job definition
    #[error(transparent)]
    JobConfig(#[from] ConfigError),

    /// Scheduler failure
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Execution failure
    #[error(transparent)]
    Execution(#[from] ExecError),

    /// Result store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key rotation failure
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Process-level configuration error (missing keys, bad settings)
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::JobConfig(_) | Error::Configuration(_) => ErrorKind::Config,
            Error::Scheduler(e) => e.kind(),
            Error::Execution(e) => e.kind(),
            Error::Store(_) => ErrorKind::Persistence,
            Error::Rotation(e) => e.kind(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Human-oriented rendering for the CLI
pub trait UserFriendlyError {
    /// Short description of what went wrong
    fn user_message(&self) -> String;

    /// Hint for fixing it, if there is one
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Config => format!("Configuration problem: {}", self),
            ErrorKind::Decryption => format!("Could not decrypt a stored credential: {}", self),
            ErrorKind::QueryValidation => format!("Query rejected: {}", self),
            ErrorKind::Connection => format!("Source database unreachable: {}", self),
            ErrorKind::Timeout => format!("Query timed out: {}", self),
            ErrorKind::Query => format!("Query failed at the source: {}", self),
            ErrorKind::Persistence => format!("Could not record the run: {}", self),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self.kind() {
            ErrorKind::Decryption => Some(
                "Check that keys.private_key_path matches the key version of the stored ciphertext."
                    .to_string(),
            ),
            ErrorKind::QueryValidation => {
                Some("Only a single SELECT (or WITH … SELECT) statement is allowed.".to_string())
            }
            ErrorKind::Connection => Some(
                "Verify host, port, database name and credentials of the data source."
                    .to_string(),
            ),
            ErrorKind::Timeout => Some(
                "Raise the job's timeout_ms or executor.statement_timeout_ms, or add a row limit."
                    .to_string(),
            ),
            ErrorKind::Persistence => {
                Some("Check connectivity to the metadata database (database.url).".to_string())
            }
            ErrorKind::Config | ErrorKind::Query => None,
        }
    }
}

/// Format an error for terminal output
pub fn format_error_for_cli(error: &Error) -> String {
    match error.suggestion() {
        Some(hint) => format!("{}\n  hint: {}", error.user_message(), hint),
        None => error.user_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(!ErrorKind::Decryption.is_retryable());
        assert!(!ErrorKind::QueryValidation.is_retryable());
        assert!(ErrorKind::Connection.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Query.is_retryable());
    }

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            ErrorKind::Config,
            ErrorKind::Decryption,
            ErrorKind::QueryValidation,
            ErrorKind::Connection,
            ErrorKind::Timeout,
            ErrorKind::Query,
            ErrorKind::Persistence,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("nope".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_cli_format_includes_hint() {
        let err = Error::Execution(ExecError::Timeout { timeout_ms: 500 });
        let text = format_error_for_cli(&err);
        assert!(text.starts_with("Query timed out"));
        assert!(text.contains("hint:"));
    }
}
