use crate::keys::validate_key;
use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectStoreExt, PutPayload, Result as ObjectResult};

/// S3 storage implementation
#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
    region: String,
    endpoint_url: Option<String>, // Custom endpoint for S3-compatible providers
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region.clone())
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage {
            store,
            bucket,
            region,
            endpoint_url,
        })
    }

    fn location(storage_key: &str) -> StorageResult<Path> {
        validate_key(storage_key)?;
        Ok(Path::from(storage_key.to_string()))
    }

    fn map_read_error(&self, storage_key: &str, e: ObjectStoreError) -> StorageError {
        match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(storage_key.to_string()),
            other => {
                tracing::error!(
                    error = %other,
                    bucket = %self.bucket,
                    key = %storage_key,
                    "S3 read failed"
                );
                StorageError::DownloadFailed(other.to_string())
            }
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(
        &self,
        storage_key: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> StorageResult<String> {
        let location = Self::location(storage_key)?;
        let size = data.len() as u64;
        let start = std::time::Instant::now();

        let result: ObjectResult<_> = self
            .store
            .put(&location, PutPayload::from(Bytes::from(data)))
            .await;

        result.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 put failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 put successful"
        );

        Ok(self.url(storage_key))
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        let result: ObjectResult<_> = self.store.get(&location).await;
        let result = result.map_err(|e| self.map_read_error(storage_key, e))?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = bytes.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(bytes.to_vec())
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let location = Self::location(storage_key)?;

        let result: ObjectResult<_> = self.store.delete(&location).await;
        match result {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    "S3 delete failed"
                );
                return Err(StorageError::DeleteFailed(e.to_string()));
            }
        }

        tracing::debug!(bucket = %self.bucket, key = %storage_key, "S3 delete successful");
        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Self::location(storage_key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn content_length(&self, storage_key: &str) -> StorageResult<u64> {
        let location = Self::location(storage_key)?;
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| self.map_read_error(storage_key, e))?;
        Ok(meta.size as u64)
    }

    async fn copy(&self, from_key: &str, to_key: &str) -> StorageResult<String> {
        let from = Self::location(from_key)?;
        let to = Self::location(to_key)?;
        let start = std::time::Instant::now();

        let copy_result: ObjectResult<_> = self.store.copy(&from, &to).await;
        copy_result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(from_key.to_string()),
            other => StorageError::BackendError(other.to_string()),
        })?;

        tracing::debug!(
            from_key = %from_key,
            to_key = %to_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 copy successful"
        );

        Ok(self.url(to_key))
    }

    /// Ranged GET, so sniffing a large video never pulls the whole object.
    async fn download_head(&self, storage_key: &str, max_len: usize) -> StorageResult<Vec<u8>> {
        let location = Self::location(storage_key)?;
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| self.map_read_error(storage_key, e))?;
        let end = (meta.size as u64).min(max_len as u64);
        if end == 0 {
            return Ok(Vec::new());
        }
        let head: ObjectResult<Bytes> = self.store.get_range(&location, 0..end).await;
        let head = head.map_err(|e| self.map_read_error(storage_key, e))?;
        Ok(head.to_vec())
    }

    fn url(&self, storage_key: &str) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            // Path-style for S3-compatible providers
            format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                storage_key
            )
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, storage_key
            )
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}
