//! Error types module
//!
//! All pipeline errors are unified under the `AppError` enum, which covers
//! database, storage, validation and processing failures.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx`
//! feature. Without it `Database` carries a plain message.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for rejected uploads and quota refusals
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata describing how an error is classified and reported
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "DATABASE_ERROR")
    fn error_code(&self) -> &'static str;

    /// Whether this error is transient infrastructure trouble worth retrying
    fn is_recoverable(&self) -> bool;

    /// Message safe to show a tenant. Infrastructure details are hidden.
    fn client_message(&self) -> String;

    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rejected file: {0}")]
    RejectedFile(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Storage(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (error_code, recoverable, log_level).
fn app_error_static_metadata(err: &AppError) -> (&'static str, bool, LogLevel) {
    match err {
        AppError::Database(_) => ("DATABASE_ERROR", true, LogLevel::Error),
        AppError::Storage(_) => ("STORAGE_ERROR", true, LogLevel::Error),
        AppError::InvalidInput(_) => ("INVALID_INPUT", false, LogLevel::Debug),
        AppError::RejectedFile(_) => ("REJECTED_FILE", false, LogLevel::Warn),
        AppError::NotFound(_) => ("NOT_FOUND", false, LogLevel::Debug),
        AppError::PayloadTooLarge(_) => ("PAYLOAD_TOO_LARGE", false, LogLevel::Warn),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => {
            ("INTERNAL_ERROR", true, LogLevel::Error)
        }
    }
}

impl ErrorMetadata for AppError {
    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).2
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Storage(_) => "Failed to access storage".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::RejectedFile(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::PayloadTooLarge(ref msg) => msg.clone(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal processing error".to_string()
            }
        }
    }
}
