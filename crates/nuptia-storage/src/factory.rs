//! Opens the storage backend selected by `STORAGE_BACKEND`.

use std::sync::Arc;

use nuptia_core::Config;

use crate::{Storage, StorageBackend, StorageError, StorageResult};

/// Open the backend named in `config` with its settings.
pub async fn create_storage(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    match config.storage_backend() {
        StorageBackend::S3 => {
            open_s3(config.s3_bucket(), config.s3_region(), config.s3_endpoint()).await
        }
        StorageBackend::Local => {
            open_local(config.local_storage_path(), config.local_storage_base_url()).await
        }
    }
}

fn required<'a>(
    backend: StorageBackend,
    value: Option<&'a str>,
    setting: &str,
) -> StorageResult<&'a str> {
    value.ok_or_else(|| {
        StorageError::ConfigError(format!("{} storage needs {} to be set", backend, setting))
    })
}

/// S3 or an S3-compatible service. The region may come from `S3_REGION` or
/// `AWS_REGION`; configuration folds both into one setting.
#[cfg(feature = "storage-s3")]
pub async fn open_s3(
    bucket: Option<&str>,
    region: Option<&str>,
    endpoint: Option<&str>,
) -> StorageResult<Arc<dyn Storage>> {
    let bucket = required(StorageBackend::S3, bucket, "S3_BUCKET")?;
    let region = required(StorageBackend::S3, region, "S3_REGION (or AWS_REGION)")?;

    tracing::info!(bucket, region, endpoint = ?endpoint, "Opening S3 storage");
    let storage = crate::S3Storage::new(
        bucket.to_string(),
        region.to_string(),
        endpoint.map(String::from),
    )
    .await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "storage-s3"))]
pub async fn open_s3(
    _bucket: Option<&str>,
    _region: Option<&str>,
    _endpoint: Option<&str>,
) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::ConfigError(
        "this build has no S3 storage (enable the storage-s3 feature)".to_string(),
    ))
}

/// A directory on the worker's filesystem, served under `base_url`.
#[cfg(feature = "storage-local")]
pub async fn open_local(
    path: Option<&str>,
    base_url: Option<&str>,
) -> StorageResult<Arc<dyn Storage>> {
    let path = required(StorageBackend::Local, path, "LOCAL_STORAGE_PATH")?;
    let base_url = required(StorageBackend::Local, base_url, "LOCAL_STORAGE_BASE_URL")?;

    tracing::info!(path, "Opening local storage");
    let storage = crate::LocalStorage::new(path, base_url.to_string()).await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "storage-local"))]
pub async fn open_local(
    _path: Option<&str>,
    _base_url: Option<&str>,
) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::ConfigError(
        "this build has no local storage (enable the storage-local feature)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "storage-local")]
    #[tokio::test]
    async fn local_backend_opens_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        let storage = open_local(root.to_str(), Some("http://localhost/media"))
            .await
            .unwrap();

        assert_eq!(storage.backend_type(), StorageBackend::Local);
        assert!(root.is_dir());
    }

    #[cfg(feature = "storage-local")]
    #[tokio::test]
    async fn local_backend_names_missing_base_url() {
        let err = open_local(Some("/tmp/nuptia"), None).await.err().unwrap();
        assert!(err.to_string().contains("LOCAL_STORAGE_BASE_URL"));
    }

    #[cfg(feature = "storage-s3")]
    #[tokio::test]
    async fn s3_backend_checks_settings_before_connecting() {
        let err = open_s3(None, Some("eu-west-1"), None).await.err().unwrap();
        assert!(err.to_string().contains("S3_BUCKET"));

        let err = open_s3(Some("photos"), None, None).await.err().unwrap();
        assert!(err.to_string().contains("S3_REGION"));
    }
}
