//! Error taxonomy for the task engine

use super::model::TaskId;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TaskError>;

/// Everything a command can fail with
#[derive(Debug, Error)]
pub enum TaskError {
    /// Bad enum value, malformed `KIND:VALUE`, illegal transition, ...
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Store stayed locked past the retry budget; safe to retry
    #[error("store busy after {attempts} attempts, retry later")]
    StoreBusy { attempts: u32 },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the underlying SQLite error is lock contention
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sql(err) => is_busy_sql(err),
            Self::StoreBusy { .. } => true,
            _ => false,
        }
    }

    /// Process exit status for the CLI layer
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Config(_) => 2,
            Self::NotFound(_) => 3,
            Self::StoreBusy { .. } => 4,
            Self::IntegrityViolation(_) => 5,
            Self::Sql(_) | Self::Io(_) | Self::Json(_) => 1,
        }
    }
}

impl TaskError {
    /// A failed CHECK / FOREIGN KEY / UNIQUE means the data broke a store invariant
    pub(crate) fn into_integrity(self) -> Self {
        match self {
            Self::Sql(ref err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Self::IntegrityViolation(err.to_string())
            }
            other => other,
        }
    }
}

pub(crate) fn is_busy_sql(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}
