//! File Processor: validates one staged file of a batch, stores it as site
//! media and accounts its outcome against the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use nuptia_core::models::{
    BatchState, FileOutcome, MediaKind, MediaStatus, OutcomeRecord, ProcessUploadPayload,
    SiteMedia, UploadBatch, UploadResult,
};
#[cfg(feature = "image")]
use nuptia_core::models::THUMBNAIL_VARIANT;
use nuptia_core::{AppError, ErrorMetadata, LogLevel, TaskError};
use nuptia_db::{BatchStore, MediaStore};
use nuptia_processing::MediaValidator;
use nuptia_storage::keys::{extension_of, media_key, thumbnail_key};
use nuptia_storage::{Storage, SNIFF_LEN};
use uuid::Uuid;

use crate::quota::QuotaService;

const MISSING_FILE_REASON: &str = "Temporary upload file is missing";

/// Every extension a derived thumbnail can be stored under.
const THUMBNAIL_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// Deletes the staged temp file when the attempt ends.
///
/// `cleanup` deletes inline; if the guard is dropped while still armed (the
/// attempt was cancelled or panicked) the delete is spawned instead.
/// `retain` disarms it so a retry can read the file again.
struct StagedFileGuard {
    storage: Arc<dyn Storage>,
    key: String,
    armed: bool,
}

impl StagedFileGuard {
    fn new(storage: Arc<dyn Storage>, key: &str) -> Self {
        Self {
            storage,
            key: key.to_string(),
            armed: true,
        }
    }

    fn retain(&mut self) {
        self.armed = false;
    }

    async fn cleanup(mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self.storage.delete(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "Failed to delete staged file");
        }
    }
}

impl Drop for StagedFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let storage = self.storage.clone();
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                if let Err(e) = storage.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete staged file");
                }
            });
        }
    }
}

/// What became of a file that reached validation.
enum Verdict {
    Stored(SiteMedia),
    Rejected(String),
}

#[derive(Clone)]
pub struct FileProcessor {
    batches: Arc<dyn BatchStore>,
    media: Arc<dyn MediaStore>,
    quota: QuotaService,
    storage: Arc<dyn Storage>,
    validator: MediaValidator,
    thumbnail_max_dimension: u32,
}

impl FileProcessor {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        media: Arc<dyn MediaStore>,
        quota: QuotaService,
        storage: Arc<dyn Storage>,
        validator: MediaValidator,
        thumbnail_max_dimension: u32,
    ) -> Self {
        Self {
            batches,
            media,
            quota,
            storage,
            validator,
            thumbnail_max_dimension,
        }
    }

    /// Process one staged file.
    ///
    /// Validation failures and permanent errors are accounted as a failed
    /// file and returned as `Ok`. Infrastructure errors come back as a
    /// recoverable [`TaskError`] with the staged file kept, unless this is
    /// the `final_attempt`, in which case they are accounted as a failure too.
    #[tracing::instrument(
        skip(self, payload),
        fields(
            batch_id = %payload.batch_id,
            wedding_id = %payload.wedding_id,
            file_id = %payload.file_id,
        )
    )]
    pub async fn process(
        &self,
        payload: &ProcessUploadPayload,
        final_attempt: bool,
    ) -> Result<UploadResult, TaskError> {
        let batch = match self.batches.get_batch(payload.batch_id).await {
            Ok(Some(batch)) if batch.wedding_id == payload.wedding_id => batch,
            Ok(_) => {
                tracing::error!(
                    staged_path = %payload.staged_path,
                    "Upload batch not found, discarding file"
                );
                return Ok(self.skip(payload).await);
            }
            Err(e) => return Err(TaskError::recoverable(e)),
        };

        if batch.status == BatchState::Cancelled {
            tracing::info!("Batch was cancelled, discarding file");
            return Ok(self.skip(payload).await);
        }

        match self.batches.has_outcome(batch.id, payload.file_id).await {
            Ok(true) => {
                tracing::debug!("File already accounted by an earlier delivery");
                return Ok(self.skip(payload).await);
            }
            Ok(false) => {}
            Err(e) => return Err(TaskError::recoverable(e)),
        }

        if !batch.status.accepts_outcomes() {
            tracing::warn!(status = %batch.status, "Batch already finished, discarding file");
            return Ok(self.skip(payload).await);
        }

        let mut guard = StagedFileGuard::new(self.storage.clone(), &payload.staged_path);

        if let Err(e) = self.batches.mark_processing(batch.id).await {
            return Err(Self::defer(e, &mut guard, final_attempt));
        }

        let verdict = match self.validate_and_store(payload, &batch).await {
            Ok(verdict) => verdict,
            Err(e) if e.is_recoverable() && !final_attempt => {
                tracing::warn!(error = %e, "Transient failure, file will be retried");
                guard.retain();
                return Err(TaskError::recoverable(e));
            }
            Err(e) => {
                log_failure(&e);
                self.discard_unrecorded_media(payload).await;
                Verdict::Rejected(e.client_message())
            }
        };

        let result = match verdict {
            Verdict::Stored(media) => {
                let accounted = self.account(payload, FileOutcome::Completed, None).await;
                match accounted {
                    Ok(state) => UploadResult::stored(
                        payload.batch_id,
                        payload.file_id,
                        &payload.original_name,
                        media.id,
                        state,
                    ),
                    Err(e) => return Err(Self::defer(e, &mut guard, final_attempt)),
                }
            }
            Verdict::Rejected(reason) => {
                tracing::warn!(
                    reason = %reason,
                    original_name = %payload.original_name,
                    "File rejected"
                );
                let accounted = self
                    .account(payload, FileOutcome::Failed, Some(&reason))
                    .await;
                match accounted {
                    Ok(state) => UploadResult::rejected(
                        payload.batch_id,
                        payload.file_id,
                        &payload.original_name,
                        reason,
                        state,
                    ),
                    Err(e) => return Err(Self::defer(e, &mut guard, final_attempt)),
                }
            }
        };

        guard.cleanup().await;
        Ok(result)
    }

    /// Account a file whose task failed for good (timeout, exhausted
    /// retries). A file already stored is counted as completed.
    #[tracing::instrument(skip(self, payload), fields(batch_id = %payload.batch_id, file_id = %payload.file_id))]
    pub async fn on_permanent_failure(
        &self,
        payload: &ProcessUploadPayload,
        reason: &str,
    ) -> Result<(), AppError> {
        if self.batches.has_outcome(payload.batch_id, payload.file_id).await? {
            self.discard_staged(payload).await;
            return Ok(());
        }

        let stored = self
            .media
            .get_media(payload.wedding_id, payload.file_id)
            .await?
            .filter(|m| m.status == MediaStatus::Completed);

        if stored.is_some() {
            self.account(payload, FileOutcome::Completed, None).await?;
        } else {
            self.discard_unrecorded_media(payload).await;
            self.account(payload, FileOutcome::Failed, Some(reason))
                .await?;
        }
        self.discard_staged(payload).await;
        Ok(())
    }

    fn defer(err: AppError, guard: &mut StagedFileGuard, final_attempt: bool) -> TaskError {
        tracing::warn!(error = %err, final_attempt, "Could not account file");
        if !final_attempt {
            guard.retain();
        }
        TaskError::recoverable(err)
    }

    async fn skip(&self, payload: &ProcessUploadPayload) -> UploadResult {
        self.discard_staged(payload).await;
        UploadResult::skipped(payload.batch_id, payload.file_id, &payload.original_name)
    }

    async fn discard_staged(&self, payload: &ProcessUploadPayload) {
        StagedFileGuard::new(self.storage.clone(), &payload.staged_path)
            .cleanup()
            .await;
    }

    /// Delete the permanent object and thumbnail of a file that never got a
    /// completed media row. A file with such a row is left untouched.
    async fn discard_unrecorded_media(&self, payload: &ProcessUploadPayload) {
        match self.media.get_media(payload.wedding_id, payload.file_id).await {
            Ok(Some(m)) if m.status == MediaStatus::Completed => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not look up media row, keeping stored objects");
                return;
            }
        }

        let mut keys = vec![media_key(
            payload.wedding_id,
            payload.file_id,
            &extension_of(&payload.original_name),
        )];
        keys.extend(
            THUMBNAIL_EXTENSIONS
                .iter()
                .map(|ext| thumbnail_key(payload.wedding_id, payload.file_id, ext)),
        );
        for key in keys {
            if let Err(e) = self.storage.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete orphaned media object");
            }
        }
    }

    async fn account(
        &self,
        payload: &ProcessUploadPayload,
        outcome: FileOutcome,
        error: Option<&str>,
    ) -> Result<Option<BatchState>, AppError> {
        let record = self
            .batches
            .record_outcome(
                payload.batch_id,
                payload.file_id,
                &payload.original_name,
                outcome,
                error,
            )
            .await?;

        Ok(match record {
            OutcomeRecord::Counted(batch) => {
                if batch.status.is_terminal() {
                    tracing::info!(
                        status = %batch.status,
                        total = batch.total_files,
                        completed = batch.completed_files,
                        failed = batch.failed_files,
                        "Upload batch finished"
                    );
                }
                Some(batch.status)
            }
            OutcomeRecord::AlreadyCounted => {
                tracing::debug!("Outcome already recorded");
                None
            }
            OutcomeRecord::Suppressed(state) => {
                tracing::info!(status = %state, "Batch no longer accepts outcomes, not counted");
                Some(state)
            }
            OutcomeRecord::BatchMissing => {
                tracing::warn!("Batch disappeared before accounting");
                None
            }
        })
    }

    /// Quota and content checks. `Some(reason)` rejects the file.
    async fn check(
        &self,
        payload: &ProcessUploadPayload,
        size: u64,
    ) -> Result<Option<String>, AppError> {
        let quota = self
            .quota
            .can_upload(payload.wedding_id, size as i64, 1)
            .await?;
        if !quota.can_upload {
            let reason = quota
                .reason
                .unwrap_or_else(|| "Quota exceeded".to_string());
            return Ok(Some(match quota.upgrade_message {
                Some(upgrade) => format!("{}. {}", reason, upgrade),
                None => reason,
            }));
        }

        let head = self
            .storage
            .download_head(&payload.staged_path, SNIFF_LEN)
            .await?;
        if let Err(e) = self.validator.validate_all(
            &payload.original_name,
            &payload.mime_type,
            size,
            &head,
        ) {
            return Ok(Some(e.to_string()));
        }

        Ok(None)
    }

    async fn validate_and_store(
        &self,
        payload: &ProcessUploadPayload,
        batch: &UploadBatch,
    ) -> Result<Verdict, AppError> {
        let permanent_key = media_key(
            payload.wedding_id,
            payload.file_id,
            &extension_of(&payload.original_name),
        );

        let size = if self.storage.exists(&payload.staged_path).await? {
            let size = self.storage.content_length(&payload.staged_path).await?;
            if let Some(reason) = self.check(payload, size).await? {
                return Ok(Verdict::Rejected(reason));
            }
            self.storage
                .rename(&payload.staged_path, &permanent_key)
                .await?;
            size
        } else if self.storage.exists(&permanent_key).await? {
            tracing::info!(key = %permanent_key, "Resuming after an interrupted attempt");
            self.storage.content_length(&permanent_key).await?
        } else {
            return Ok(Verdict::Rejected(MISSING_FILE_REASON.to_string()));
        };

        let (width, height, variants) = match MediaKind::from_mime(&payload.mime_type) {
            MediaKind::Image => self.derive_image(payload, &permanent_key).await?,
            _ => (None, None, BTreeMap::new()),
        };

        let now = Utc::now();
        let media = SiteMedia {
            id: payload.file_id,
            wedding_id: payload.wedding_id,
            album_id: batch.album_id,
            batch_id: Some(batch.id),
            path: permanent_key,
            disk: self.storage.backend_type().to_string(),
            original_name: payload.original_name.clone(),
            mime_type: payload.mime_type.clone(),
            size: size as i64,
            width,
            height,
            variants,
            status: MediaStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        let stored = self.media.insert_media(&media).await?;

        tracing::info!(
            media_id = %stored.id,
            path = %stored.path,
            size = stored.size,
            "Media stored"
        );
        Ok(Verdict::Stored(stored))
    }

    /// Dimensions and thumbnail of a stored image. Undecodable images are
    /// kept without either.
    #[cfg(feature = "image")]
    async fn derive_image(
        &self,
        payload: &ProcessUploadPayload,
        key: &str,
    ) -> Result<(Option<i32>, Option<i32>, BTreeMap<String, String>), AppError> {
        use nuptia_processing::ImageProcessor;

        let data = self.storage.download(key).await?;
        let derived =
            match ImageProcessor::derive_blocking(data, self.thumbnail_max_dimension).await {
                Ok(derived) => derived,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not decode image, storing without dimensions");
                    return Ok((None, None, BTreeMap::new()));
                }
            };

        let thumb_key = thumbnail_key(
            payload.wedding_id,
            payload.file_id,
            derived.thumbnail.extension,
        );
        self.storage
            .put(
                &thumb_key,
                derived.thumbnail.data,
                derived.thumbnail.content_type,
            )
            .await?;

        let mut variants = BTreeMap::new();
        variants.insert(THUMBNAIL_VARIANT.to_string(), thumb_key);
        Ok((
            i32::try_from(derived.width).ok(),
            i32::try_from(derived.height).ok(),
            variants,
        ))
    }

    #[cfg(not(feature = "image"))]
    async fn derive_image(
        &self,
        _payload: &ProcessUploadPayload,
        _key: &str,
    ) -> Result<(Option<i32>, Option<i32>, BTreeMap<String, String>), AppError> {
        Ok((None, None, BTreeMap::new()))
    }
}

fn log_failure(err: &AppError) {
    let code = err.error_code();
    match err.log_level() {
        LogLevel::Error => tracing::error!(error = %err, error_code = code, "File processing failed"),
        LogLevel::Warn => tracing::warn!(error = %err, error_code = code, "File processing failed"),
        LogLevel::Debug => tracing::debug!(error = %err, error_code = code, "File processing failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuptia_db::{InMemoryBatchStore, InMemoryMediaStore, InMemoryPlanStore};
    use nuptia_storage::LocalStorage;
    use tempfile::tempdir;

    const PNG_HEAD: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<dyn Storage>,
        batches: InMemoryBatchStore,
        media: InMemoryMediaStore,
        processor: FileProcessor,
    }

    async fn fixture() -> Fixture {
        fixture_with(|local| local).await
    }

    async fn fixture_with(wrap: impl FnOnce(Arc<dyn Storage>) -> Arc<dyn Storage>) -> Fixture {
        let dir = tempdir().unwrap();
        let storage = wrap(Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/media".to_string())
                .await
                .unwrap(),
        ));
        let batches = InMemoryBatchStore::new();
        let media = InMemoryMediaStore::new();
        let quota = QuotaService::new(
            Arc::new(InMemoryPlanStore::new()),
            Arc::new(media.clone()),
        );
        let validator = MediaValidator::new(
            1024 * 1024,
            10 * 1024 * 1024,
            vec!["image/png".to_string(), "image/jpeg".to_string()],
        );
        let processor = FileProcessor::new(
            Arc::new(batches.clone()),
            Arc::new(media.clone()),
            quota,
            storage.clone(),
            validator,
            64,
        );
        Fixture {
            _dir: dir,
            storage,
            batches,
            media,
            processor,
        }
    }

    async fn staged(fx: &Fixture, batch: &UploadBatch, name: &str, data: &[u8]) -> ProcessUploadPayload {
        let file_id = Uuid::new_v4();
        let key = nuptia_storage::keys::staging_key(batch.id, file_id, &extension_of(name));
        fx.storage.put(&key, data.to_vec(), "image/png").await.unwrap();
        ProcessUploadPayload {
            batch_id: batch.id,
            wedding_id: batch.wedding_id,
            file_id,
            staged_path: key,
            original_name: name.to_string(),
            mime_type: "image/png".to_string(),
        }
    }

    /// Local storage that refuses to write thumbnails.
    struct ThumbnailWriteFails(Arc<dyn Storage>);

    #[async_trait::async_trait]
    impl Storage for ThumbnailWriteFails {
        async fn put(
            &self,
            storage_key: &str,
            data: Vec<u8>,
            content_type: &str,
        ) -> nuptia_storage::StorageResult<String> {
            if storage_key.contains("_thumb.") {
                return Err(nuptia_storage::StorageError::UploadFailed(
                    "bucket unavailable".to_string(),
                ));
            }
            self.0.put(storage_key, data, content_type).await
        }

        async fn download(&self, storage_key: &str) -> nuptia_storage::StorageResult<Vec<u8>> {
            self.0.download(storage_key).await
        }

        async fn delete(&self, storage_key: &str) -> nuptia_storage::StorageResult<()> {
            self.0.delete(storage_key).await
        }

        async fn exists(&self, storage_key: &str) -> nuptia_storage::StorageResult<bool> {
            self.0.exists(storage_key).await
        }

        async fn content_length(&self, storage_key: &str) -> nuptia_storage::StorageResult<u64> {
            self.0.content_length(storage_key).await
        }

        async fn copy(&self, from_key: &str, to_key: &str) -> nuptia_storage::StorageResult<String> {
            self.0.copy(from_key, to_key).await
        }

        async fn rename(&self, from_key: &str, to_key: &str) -> nuptia_storage::StorageResult<String> {
            self.0.rename(from_key, to_key).await
        }

        fn url(&self, storage_key: &str) -> String {
            self.0.url(storage_key)
        }

        fn backend_type(&self) -> nuptia_storage::StorageBackend {
            self.0.backend_type()
        }
    }

    #[cfg(feature = "image")]
    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(width, height, image::Rgb([200, 180, 160]))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    async fn batch(fx: &Fixture, total: i32) -> UploadBatch {
        let batch = UploadBatch::new(Uuid::new_v4(), total, None).unwrap();
        fx.batches.create_batch(&batch).await.unwrap()
    }

    #[tokio::test]
    async fn undecodable_image_is_stored_without_dimensions() {
        let fx = fixture().await;
        let batch = batch(&fx, 1).await;
        let payload = staged(&fx, &batch, "signature-only.png", PNG_HEAD).await;

        let result = fx.processor.process(&payload, false).await.unwrap();

        assert!(result.is_stored());
        assert_eq!(result.batch_state, Some(BatchState::Completed));
        let media = fx
            .media
            .get_media(batch.wedding_id, payload.file_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(media.width, None);
        assert!(media.variants.is_empty());
        assert!(!fx.storage.exists(&payload.staged_path).await.unwrap());
    }

    #[tokio::test]
    async fn redelivered_file_is_not_counted_twice() {
        let fx = fixture().await;
        let batch = batch(&fx, 2).await;
        let payload = staged(&fx, &batch, "a.png", PNG_HEAD).await;

        fx.processor.process(&payload, false).await.unwrap();
        let again = fx.processor.process(&payload, false).await.unwrap();

        assert_eq!(again.disposition, nuptia_core::models::UploadDisposition::Skipped);
        let batch = fx.batches.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.completed_files, 1);
        assert_eq!(batch.failed_files, 0);
    }

    #[tokio::test]
    async fn spoofed_type_is_rejected_and_staged_file_removed() {
        let fx = fixture().await;
        let batch = batch(&fx, 1).await;
        let mut payload = staged(&fx, &batch, "photo.jpg", PNG_HEAD).await;
        payload.mime_type = "image/jpeg".to_string();

        let result = fx.processor.process(&payload, false).await.unwrap();

        assert!(!result.is_stored());
        assert!(result.error.unwrap().contains("does not match"));
        assert_eq!(result.batch_state, Some(BatchState::Failed));
        assert!(fx.media.is_empty());
        assert!(!fx.storage.exists(&payload.staged_path).await.unwrap());
    }

    #[tokio::test]
    async fn permanent_failure_counts_stored_media_as_completed() {
        let fx = fixture().await;
        let batch = batch(&fx, 1).await;
        let payload = staged(&fx, &batch, "a.png", PNG_HEAD).await;

        // Media row written but the attempt died before accounting.
        let key = media_key(batch.wedding_id, payload.file_id, "png");
        fx.storage.rename(&payload.staged_path, &key).await.unwrap();
        let now = Utc::now();
        fx.media
            .insert_media(&SiteMedia {
                id: payload.file_id,
                wedding_id: batch.wedding_id,
                album_id: None,
                batch_id: Some(batch.id),
                path: key,
                disk: "local".to_string(),
                original_name: "a.png".to_string(),
                mime_type: "image/png".to_string(),
                size: PNG_HEAD.len() as i64,
                width: None,
                height: None,
                variants: BTreeMap::new(),
                status: MediaStatus::Completed,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        fx.processor
            .on_permanent_failure(&payload, "Processing timed out after 120 seconds")
            .await
            .unwrap();
        fx.processor
            .on_permanent_failure(&payload, "Processing timed out after 120 seconds")
            .await
            .unwrap();

        let batch = fx.batches.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.completed_files, 1);
        assert_eq!(batch.failed_files, 0);
        assert_eq!(batch.status, BatchState::Completed);
    }

    #[cfg(feature = "image")]
    #[tokio::test]
    async fn final_attempt_failure_leaves_no_stored_object() {
        let fx = fixture_with(|local| Arc::new(ThumbnailWriteFails(local))).await;
        let batch = batch(&fx, 1).await;
        let payload = staged(&fx, &batch, "portrait.png", &png(40, 30)).await;

        let result = fx.processor.process(&payload, true).await.unwrap();

        assert!(!result.is_stored());
        assert_eq!(result.error.as_deref(), Some("Failed to access storage"));
        let key = media_key(batch.wedding_id, payload.file_id, "png");
        assert!(!fx.storage.exists(&key).await.unwrap());
        assert!(!fx.storage.exists(&payload.staged_path).await.unwrap());
        assert!(fx.media.is_empty());
        let batch = fx.batches.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.failed_files, 1);
        assert_eq!(batch.status, BatchState::Failed);
    }

    #[cfg(feature = "image")]
    #[tokio::test]
    async fn permanent_failure_removes_object_moved_by_an_earlier_attempt() {
        let fx = fixture_with(|local| Arc::new(ThumbnailWriteFails(local))).await;
        let batch = batch(&fx, 1).await;
        let payload = staged(&fx, &batch, "portrait.png", &png(40, 30)).await;

        // A transient failure keeps the moved object for the next attempt.
        assert!(fx.processor.process(&payload, false).await.is_err());
        let key = media_key(batch.wedding_id, payload.file_id, "png");
        assert!(fx.storage.exists(&key).await.unwrap());

        fx.processor
            .on_permanent_failure(&payload, "Processing timed out after 120 seconds")
            .await
            .unwrap();

        assert!(!fx.storage.exists(&key).await.unwrap());
        assert!(fx.media.is_empty());
        let batch = fx.batches.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.failed_files, 1);
    }

    #[tokio::test]
    async fn resumes_when_file_was_already_moved() {
        let fx = fixture().await;
        let batch = batch(&fx, 1).await;
        let payload = staged(&fx, &batch, "a.png", PNG_HEAD).await;
        let key = media_key(batch.wedding_id, payload.file_id, "png");
        fx.storage.rename(&payload.staged_path, &key).await.unwrap();

        let result = fx.processor.process(&payload, false).await.unwrap();

        assert!(result.is_stored());
        assert_eq!(fx.media.len(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_deletes_staged_file() {
        let fx = fixture().await;
        fx.storage
            .put("staging/b/f.png", PNG_HEAD.to_vec(), "image/png")
            .await
            .unwrap();

        drop(StagedFileGuard::new(fx.storage.clone(), "staging/b/f.png"));
        for _ in 0..50 {
            if !fx.storage.exists("staging/b/f.png").await.unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!fx.storage.exists("staging/b/f.png").await.unwrap());

        fx.storage
            .put("staging/b/g.png", PNG_HEAD.to_vec(), "image/png")
            .await
            .unwrap();
        let mut guard = StagedFileGuard::new(fx.storage.clone(), "staging/b/g.png");
        guard.retain();
        guard.cleanup().await;
        assert!(fx.storage.exists("staging/b/g.png").await.unwrap());
    }
}
