//! Upload pipeline facade: wires the stores, storage and queue into the
//! four pipeline components and stages client files for processing.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use nuptia_core::models::{StagedFile, UploadBatch};
use nuptia_core::{AppError, Config};
use nuptia_db::{
    BatchStore, InMemoryBatchStore, InMemoryMediaStore, InMemoryPlanStore, InMemoryTaskStore,
    MediaStore, PlanStore, TaskStore,
};
use nuptia_processing::MediaValidator;
use nuptia_storage::keys::{extension_of, staging_key};
use nuptia_storage::Storage;
use nuptia_worker::{TaskQueue, TaskQueueConfig};
use uuid::Uuid;

use crate::batch::BatchRegistry;
use crate::dispatch::UploadTaskContext;
use crate::file_processor::FileProcessor;
use crate::quota::QuotaService;
use crate::status::BatchStatusReporter;

const STAGING_CONCURRENCY: usize = 8;

/// The persistence the pipeline runs on.
#[derive(Clone)]
pub struct PipelineStores {
    pub batches: Arc<dyn BatchStore>,
    pub media: Arc<dyn MediaStore>,
    pub plans: Arc<dyn PlanStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl PipelineStores {
    pub fn in_memory() -> Self {
        Self {
            batches: Arc::new(InMemoryBatchStore::new()),
            media: Arc::new(InMemoryMediaStore::new()),
            plans: Arc::new(InMemoryPlanStore::new()),
            tasks: Arc::new(InMemoryTaskStore::new()),
        }
    }
}

/// Validation, derivation and quota settings.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub validator: MediaValidator,
    pub thumbnail_max_dimension: u32,
    pub quota_warning_threshold: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            validator: MediaValidator::from_config(config),
            thumbnail_max_dimension: config.thumbnail_max_dimension(),
            quota_warning_threshold: config.quota_warning_threshold(),
        }
    }
}

/// A file handed over by the client, not yet staged.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct UploadPipeline {
    pub quota: QuotaService,
    pub batches: BatchRegistry,
    pub processor: Arc<FileProcessor>,
    pub status: BatchStatusReporter,
    storage: Arc<dyn Storage>,
    queue: TaskQueue,
}

impl UploadPipeline {
    /// Build the pipeline. Tasks are only persisted here; run them with a
    /// worker built from [`UploadPipeline::task_context`].
    pub fn new(
        stores: PipelineStores,
        storage: Arc<dyn Storage>,
        settings: PipelineSettings,
        queue_config: TaskQueueConfig,
    ) -> Self {
        let queue = TaskQueue::new_no_worker(stores.tasks.clone(), queue_config);
        let quota = QuotaService::new(stores.plans.clone(), stores.media.clone())
            .with_warning_threshold(settings.quota_warning_threshold);
        let processor = Arc::new(FileProcessor::new(
            stores.batches.clone(),
            stores.media.clone(),
            quota.clone(),
            storage.clone(),
            settings.validator,
            settings.thumbnail_max_dimension,
        ));

        Self {
            quota,
            batches: BatchRegistry::new(stores.batches.clone(), queue.clone()),
            processor,
            status: BatchStatusReporter::new(stores.batches),
            storage,
            queue,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Dispatch context for a worker running this pipeline's tasks.
    pub fn task_context(&self) -> Arc<UploadTaskContext> {
        Arc::new(UploadTaskContext::new(self.processor.clone()))
    }

    /// Write a client file to its staging key.
    pub async fn stage_file(
        &self,
        batch: &UploadBatch,
        file: IncomingFile,
    ) -> Result<StagedFile, AppError> {
        let file_id = Uuid::new_v4();
        let staged_path = staging_key(batch.id, file_id, &extension_of(&file.original_name));
        self.storage
            .put(&staged_path, file.data, &file.mime_type)
            .await?;

        Ok(StagedFile {
            file_id,
            staged_path,
            original_name: file.original_name,
            mime_type: file.mime_type,
        })
    }

    /// Create a batch for `files`, stage each one and enqueue its task.
    #[tracing::instrument(skip(self, files), fields(files = files.len()))]
    pub async fn submit(
        &self,
        wedding_id: Uuid,
        album_id: Option<Uuid>,
        files: Vec<IncomingFile>,
    ) -> Result<UploadBatch, AppError> {
        let total = i32::try_from(files.len())
            .map_err(|_| AppError::InvalidInput("Too many files in one batch".to_string()))?;
        let batch = self.batches.create_batch(wedding_id, total, album_id).await?;

        let staged = stream::iter(files)
            .map(|file| self.stage_file(&batch, file))
            .buffered(STAGING_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        self.batches.enqueue_files(&batch, staged).await?;

        Ok(batch)
    }
}
