//! Nuptia Services Layer
//!
//! The batch media upload pipeline: the Quota Tracker, the Batch Registry,
//! the File Processor run by the task queue, and the Batch Status Reporter,
//! plus the [`UploadPipeline`] facade that wires them to stores and storage.

pub mod batch;
pub mod dispatch;
pub mod file_processor;
pub mod pipeline;
pub mod quota;
pub mod status;

pub use batch::BatchRegistry;
pub use dispatch::UploadTaskContext;
pub use file_processor::FileProcessor;
pub use nuptia_processing::{sanitize_filename, MediaValidator, ValidationError};
pub use nuptia_storage::{
    create_storage, Storage, StorageBackend, StorageError, StorageResult,
};
pub use pipeline::{IncomingFile, PipelineSettings, PipelineStores, UploadPipeline};
pub use quota::QuotaService;
pub use status::BatchStatusReporter;
