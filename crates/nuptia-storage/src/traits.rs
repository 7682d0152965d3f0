//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use crate::StorageBackend;
use async_trait::async_trait;
use nuptia_core::AppError;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("Storage object {}", key)),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Leading bytes read when sniffing content.
pub const SNIFF_LEN: usize = 8192;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage abstraction trait
///
/// All storage backends (S3, local filesystem) implement this trait so the
/// upload pipeline works with any conforming store.
///
/// **Key format:** see the crate root documentation.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `data` under `storage_key` and return its public URL
    async fn put(&self, storage_key: &str, data: Vec<u8>, content_type: &str)
        -> StorageResult<String>;

    /// Download a file by its storage key
    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>>;

    /// Delete a file by its storage key. Deleting a missing key succeeds.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    /// Check if a file exists
    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Get the size in bytes of an object, if it exists.
    async fn content_length(&self, storage_key: &str) -> StorageResult<u64>;

    /// Copy a file from one key to another and return the new public URL
    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<String>;

    /// Move a file to a new key and return the new public URL.
    ///
    /// The default is copy then delete; backends with a native move override it.
    async fn rename(&self, from_key: &str, to_key: &str) -> StorageResult<String> {
        let url = self.copy(from_key, to_key).await?;
        self.delete(from_key).await?;
        Ok(url)
    }

    /// Read at most `max_len` leading bytes of an object.
    async fn download_head(&self, storage_key: &str, max_len: usize) -> StorageResult<Vec<u8>> {
        let mut data = self.download(storage_key).await?;
        data.truncate(max_len);
        Ok(data)
    }

    /// Content type sniffed from the object's leading bytes, `None` when the
    /// signature is not recognised.
    async fn mime_type(&self, storage_key: &str) -> StorageResult<Option<String>> {
        let head = self.download_head(storage_key, SNIFF_LEN).await?;
        Ok(infer::get(&head).map(|kind| kind.mime_type().to_string()))
    }

    /// Public URL for a key
    fn url(&self, storage_key: &str) -> String;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}
