//! Batch Registry: creation, cancellation, listing and per-file enqueueing
//! of upload batches.

use std::sync::Arc;

use nuptia_core::models::{
    BatchListQuery, Priority, ProcessUploadPayload, StagedFile, Task, TaskType, UploadBatch,
};
use nuptia_core::AppError;
use nuptia_db::BatchStore;
use nuptia_processing::sanitize_filename;
use nuptia_worker::TaskQueue;
use uuid::Uuid;

#[derive(Clone)]
pub struct BatchRegistry {
    batches: Arc<dyn BatchStore>,
    queue: TaskQueue,
}

impl BatchRegistry {
    pub fn new(batches: Arc<dyn BatchStore>, queue: TaskQueue) -> Self {
        Self { batches, queue }
    }

    /// Open a batch expecting `total_files` files, all counters at zero.
    #[tracing::instrument(skip(self))]
    pub async fn create_batch(
        &self,
        wedding_id: Uuid,
        total_files: i32,
        album_id: Option<Uuid>,
    ) -> Result<UploadBatch, AppError> {
        let batch = UploadBatch::new(wedding_id, total_files, album_id)?;
        let created = self.batches.create_batch(&batch).await?;

        tracing::info!(
            batch_id = %created.id,
            wedding_id = %wedding_id,
            total_files = total_files,
            "Upload batch created"
        );
        Ok(created)
    }

    /// Cancel a pending or processing batch. Media already stored is kept.
    /// Returns whether the batch was cancelled by this call.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_batch(&self, wedding_id: Uuid, batch_id: Uuid) -> Result<bool, AppError> {
        let cancelled = self.batches.cancel_batch(wedding_id, batch_id).await?;
        if cancelled {
            tracing::info!(batch_id = %batch_id, wedding_id = %wedding_id, "Upload batch cancelled");
        } else {
            tracing::debug!(
                batch_id = %batch_id,
                wedding_id = %wedding_id,
                "Batch not cancelled: unknown or already finished"
            );
        }
        Ok(cancelled)
    }

    /// Batches of a wedding, newest first. Finished batches only with
    /// `include_completed`.
    pub async fn get_batches(
        &self,
        wedding_id: Uuid,
        include_completed: bool,
    ) -> Result<Vec<UploadBatch>, AppError> {
        let query = BatchListQuery {
            include_completed,
            ..BatchListQuery::default()
        };
        self.batches.list_batches(wedding_id, &query).await
    }

    pub async fn get_batch(&self, wedding_id: Uuid, batch_id: Uuid) -> Result<UploadBatch, AppError> {
        self.batches
            .get_batch_for_wedding(wedding_id, batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload batch {}", batch_id)))
    }

    /// Submit one `process_upload` task per staged file.
    #[tracing::instrument(skip(self, batch, files), fields(batch_id = %batch.id, files = files.len()))]
    pub async fn enqueue_files(
        &self,
        batch: &UploadBatch,
        files: Vec<StagedFile>,
    ) -> Result<Vec<Uuid>, AppError> {
        if !batch.status.accepts_outcomes() {
            return Err(AppError::InvalidInput(format!(
                "Batch {} is {} and accepts no more files",
                batch.id, batch.status
            )));
        }
        if files.len() > batch.pending_files() as usize {
            return Err(AppError::InvalidInput(format!(
                "Batch {} expects {} more files, got {}",
                batch.id,
                batch.pending_files(),
                files.len()
            )));
        }

        let mut task_ids = Vec::with_capacity(files.len());
        for file in files {
            let payload = ProcessUploadPayload {
                batch_id: batch.id,
                wedding_id: batch.wedding_id,
                file_id: file.file_id,
                staged_path: file.staged_path,
                original_name: sanitize_filename(&file.original_name),
                mime_type: file.mime_type.to_lowercase(),
            };
            let task_id = self
                .queue
                .submit_task(
                    batch.wedding_id,
                    TaskType::ProcessUpload,
                    Task::payload_from(&payload)?,
                    Priority::Normal,
                    None,
                )
                .await?;
            task_ids.push(task_id);
        }

        Ok(task_ids)
    }
}
