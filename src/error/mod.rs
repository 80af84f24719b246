use std::collections::HashMap;
use std::fmt;

use rusqlite::Error as SqliteError;
use serde::{Deserialize, Serialize};
use std::io::Error as IoError;

/// A structured error carrying a machine readable code, a message, and the
/// context needed to tell which phase and table a failure came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message.
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
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

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

    /// Walks the cause chain and reports whether any link carries `code`.
    pub fn has_code(&self, code: &str) -> bool {
        if self.code == code {
            return true;
        }
        self.cause().map(|cause| cause.has_code(code)).unwrap_or(false)
    }
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

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match error {
            SqliteError::SqliteFailure(failure, message) => {
                let code = format!("Sqlite/{:?}", failure.code);
                let message = message.unwrap_or_else(|| failure.to_string());
                AppError::new(code, message)
                    .with_context("extended_code", failure.extended_code.to_string())
            }
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/ROW_NOT_FOUND", "Record not found")
            }
            SqliteError::InvalidColumnName(name) => AppError::new(
                "SQLITE/COLUMN_NOT_FOUND",
                format!("Column not found: {name}"),
            ),
            SqliteError::InvalidColumnType(index, name, ty) => AppError::new(
                "SQLITE/COLUMN_TYPE",
                format!("Column {name} has unexpected type {ty}"),
            )
            .with_context("column_index", index.to_string()),
            other => AppError::new("SQLITE/ERROR", other.to_string()),
        }
    }
}
