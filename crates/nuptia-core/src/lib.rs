//! Nuptia Core Library
//!
//! This crate provides the domain models, value objects, error types and
//! configuration shared by every component of the batch media upload pipeline.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;
pub mod task_error;

// Re-export commonly used types
pub use config::{Config, PipelineConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use storage_types::StorageBackend;
pub use task_error::{TaskError, TaskResultExt};
