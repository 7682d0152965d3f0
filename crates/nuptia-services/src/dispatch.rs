//! TaskHandlerContext implementation for the upload pipeline.
//!
//! Dispatches tasks to the appropriate handler based on task type.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use nuptia_core::models::{ProcessUploadPayload, Task, TaskType};
use nuptia_core::TaskError;
use nuptia_worker::TaskHandlerContext;

use crate::file_processor::FileProcessor;

pub struct UploadTaskContext {
    processor: Arc<FileProcessor>,
}

impl UploadTaskContext {
    pub fn new(processor: Arc<FileProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl TaskHandlerContext for UploadTaskContext {
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value> {
        match task.task_type {
            TaskType::ProcessUpload => {
                let payload: ProcessUploadPayload = task.try_payload_as().map_err(|e| {
                    TaskError::unrecoverable(anyhow::anyhow!("Invalid upload payload: {}", e))
                })?;
                let result = self.processor.process(&payload, !task.can_retry()).await?;
                Ok(serde_json::to_value(result)?)
            }
        }
    }

    async fn on_task_failed(self: Arc<Self>, task: &Task, reason: &str) -> Result<()> {
        match task.task_type {
            TaskType::ProcessUpload => match task.try_payload_as::<ProcessUploadPayload>() {
                Ok(payload) => {
                    self.processor.on_permanent_failure(&payload, reason).await?;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(
                        task_id = %task.id,
                        error = %e,
                        "Failed upload task has no readable payload, nothing to account"
                    );
                    Ok(())
                }
            },
        }
    }
}
