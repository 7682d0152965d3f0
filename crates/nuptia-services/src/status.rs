//! Batch Status Reporter.

use std::sync::Arc;

use nuptia_core::models::BatchStatus;
use nuptia_core::AppError;
use nuptia_db::BatchStore;
use uuid::Uuid;

#[derive(Clone)]
pub struct BatchStatusReporter {
    batches: Arc<dyn BatchStore>,
}

impl BatchStatusReporter {
    pub fn new(batches: Arc<dyn BatchStore>) -> Self {
        Self { batches }
    }

    /// Progress of a batch; `errors` lists `"{file name}: {reason}"` for
    /// every failed file, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn get_batch_status(
        &self,
        wedding_id: Uuid,
        batch_id: Uuid,
    ) -> Result<BatchStatus, AppError> {
        let batch = self
            .batches
            .get_batch_for_wedding(wedding_id, batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload batch {}", batch_id)))?;

        let errors = self
            .batches
            .failed_outcomes(batch_id)
            .await?
            .into_iter()
            .map(|outcome| {
                format!(
                    "{}: {}",
                    outcome.original_name,
                    outcome.error.as_deref().unwrap_or("processing failed")
                )
            })
            .collect();

        BatchStatus::from_batch(&batch, errors)
    }
}
