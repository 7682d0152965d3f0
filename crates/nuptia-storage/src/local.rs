use crate::keys::validate_key;
use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Local filesystem storage implementation
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/nuptia/media")
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:3000/media")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage {
            base_path,
            base_url,
        })
    }

    /// Convert storage key to filesystem path with security validation
    ///
    /// Existing paths are canonicalized and must stay under the base directory.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;

        let path = self.base_path.join(storage_key);

        if let Ok(canonical) = path.canonicalize() {
            let base_canonical = self.base_path.canonicalize().map_err(|e| {
                StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
            })?;
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(
        &self,
        storage_key: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> StorageResult<String> {
        let path = self.key_to_path(storage_key)?;
        let size = data.len();

        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage put successful"
        );

        Ok(self.url(storage_key))
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(data)
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::remove_file(&path).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to delete file {}: {}", path.display(), e))
        })?;

        tracing::debug!(key = %storage_key, "Local storage delete successful");

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn content_length(&self, storage_key: &str) -> StorageResult<u64> {
        let path = self.key_to_path(storage_key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn download_head(&self, storage_key: &str, max_len: usize) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(storage_key.to_string()));
            }
            Err(e) => return Err(StorageError::DownloadFailed(e.to_string())),
        };
        let mut head = Vec::with_capacity(max_len.min(64 * 1024));
        file.take(max_len as u64)
            .read_to_end(&mut head)
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;
        Ok(head)
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<String> {
        let from_path = self.key_to_path(from_key)?;
        let to_path = self.key_to_path(to_key)?;

        if !fs::try_exists(&from_path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(from_key.to_string()));
        }

        self.ensure_parent_dir(&to_path).await?;

        fs::copy(&from_path, &to_path).await.map_err(|e| {
            StorageError::BackendError(format!(
                "Failed to copy {} to {}: {}",
                from_path.display(),
                to_path.display(),
                e
            ))
        })?;

        tracing::debug!(
            from_key = %from_key,
            to_key = %to_key,
            "Local storage copy successful"
        );

        Ok(self.url(to_key))
    }

    async fn rename(&self, from_key: &str, to_key: &str) -> StorageResult<String> {
        let from_path = self.key_to_path(from_key)?;
        let to_path = self.key_to_path(to_key)?;

        if !fs::try_exists(&from_path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(from_key.to_string()));
        }

        self.ensure_parent_dir(&to_path).await?;

        // rename(2) fails across filesystems; fall back to copy + delete.
        if let Err(e) = fs::rename(&from_path, &to_path).await {
            tracing::debug!(error = %e, from_key = %from_key, "rename failed, copying instead");
            self.copy(from_key, to_key).await?;
            self.delete(from_key).await?;
        }

        tracing::debug!(
            from_key = %from_key,
            to_key = %to_key,
            "Local storage move successful"
        );

        Ok(self.url(to_key))
    }

    fn url(&self, storage_key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), storage_key)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
