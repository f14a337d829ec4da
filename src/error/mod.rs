use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

/// A structured error that carries a machine readable code plus context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the operator.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// The catalog could not be reached at all.
    pub const CATALOG_CONNECTION: &'static str = "CATALOG/CONNECTION_FAILED";
    /// The catalog was reachable but a statement failed.
    pub const CATALOG_QUERY: &'static str = "CATALOG/QUERY_FAILED";

    /// Construct a new error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// True when the catalog itself was unreachable. Callers use this to skip retries.
    pub fn is_connection_failure(&self) -> bool {
        self.code == Self::CATALOG_CONNECTION
    }

    /// True for statement-level catalog failures.
    pub fn is_query_failure(&self) -> bool {
        self.code == Self::CATALOG_QUERY
    }

    /// Wraps a sqlx error into the catalog taxonomy, keeping the driver error as the cause.
    pub fn catalog(error: SqlxError, operation: &str) -> Self {
        let code = if is_connection_error(&error) {
            Self::CATALOG_CONNECTION
        } else {
            Self::CATALOG_QUERY
        };
        let message = if code == Self::CATALOG_CONNECTION {
            "Unable to reach the catalog database."
        } else {
            "Catalog query failed."
        };
        AppError::new(code, message)
            .with_context("operation", operation)
            .with_cause(error)
    }
}

fn is_connection_error(error: &SqlxError) -> bool {
    matches!(
        error,
        SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::Configuration(_)
            | SqlxError::WorkerCrashed
    )
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, "[{}] {} ({:?})", self.code, self.message, pairs)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let mut app_error = AppError::new(code, db.message().to_string());
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("record", "F-0001")
            .with_context("operation", "mark_moved")
            .with_cause(AppError::new("IO/NotFound", "inner failure"));

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.context().get("record"), Some(&"F-0001".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), "IO/NotFound");
    }

    #[test]
    fn code_survives_the_cli_anyhow_boundary() {
        let error = AppError::new("CONFIG/INVALID", "Missing field").with_context("field", "base");
        let wrapped = anyhow::Error::new(error.clone());
        assert!(format!("{wrapped:#}").contains("[CONFIG/INVALID]"));
        assert_eq!(wrapped.downcast_ref::<AppError>(), Some(&error));
    }

    #[test]
    fn pool_failures_classify_as_connection_errors() {
        let err = AppError::catalog(SqlxError::PoolTimedOut, "fetch_unmoved");
        assert!(err.is_connection_failure());
        assert!(!err.is_query_failure());
        assert_eq!(err.context().get("operation"), Some(&"fetch_unmoved".to_string()));
        assert_eq!(err.cause().map(AppError::code), Some("SQLX/POOL_TIMEOUT"));
    }

    #[test]
    fn statement_failures_classify_as_query_errors() {
        let err = AppError::catalog(SqlxError::RowNotFound, "get");
        assert!(err.is_query_failure());
        assert_eq!(err.code(), AppError::CATALOG_QUERY);
    }

    #[test]
    fn io_error_contains_raw_code_when_available() {
        let err = IoError::from_raw_os_error(2);
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"foo\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
    }
}
