//! Nuptia Storage Library
//!
//! Object storage abstraction for the upload pipeline: the `Storage` trait
//! with local filesystem and S3-compatible implementations.
//!
//! # Storage key format
//!
//! All backends share one key layout, produced by the `keys` module:
//!
//! - **Staged upload**: `staging/{batch_id}/{file_id}.{ext}`
//! - **Stored media**: `weddings/{wedding_id}/media/{file_id}.{ext}`
//! - **Thumbnail**: `weddings/{wedding_id}/media/{file_id}_thumb.{ext}`
//!
//! Keys must not contain `..` or a leading `/`.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use nuptia_core::StorageBackend;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{Storage, StorageError, StorageResult, SNIFF_LEN};
