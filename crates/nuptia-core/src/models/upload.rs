use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::BatchState;

/// What happened to a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadDisposition {
    /// Stored with a `completed` media row
    Stored,
    /// Rejected by validation or a permanent processing error
    Rejected,
    /// Not accounted: batch missing or cancelled
    Skipped,
}

/// Outcome of processing one file of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub batch_id: Uuid,
    pub file_id: Uuid,
    pub original_name: String,
    pub disposition: UploadDisposition,
    pub media_id: Option<Uuid>,
    pub error: Option<String>,
    /// Batch state read back after accounting, when the outcome was counted
    pub batch_state: Option<BatchState>,
}

impl UploadResult {
    pub fn stored(
        batch_id: Uuid,
        file_id: Uuid,
        original_name: impl Into<String>,
        media_id: Uuid,
        batch_state: Option<BatchState>,
    ) -> Self {
        Self {
            batch_id,
            file_id,
            original_name: original_name.into(),
            disposition: UploadDisposition::Stored,
            media_id: Some(media_id),
            error: None,
            batch_state,
        }
    }

    pub fn rejected(
        batch_id: Uuid,
        file_id: Uuid,
        original_name: impl Into<String>,
        error: impl Into<String>,
        batch_state: Option<BatchState>,
    ) -> Self {
        Self {
            batch_id,
            file_id,
            original_name: original_name.into(),
            disposition: UploadDisposition::Rejected,
            media_id: None,
            error: Some(error.into()),
            batch_state,
        }
    }

    pub fn skipped(batch_id: Uuid, file_id: Uuid, original_name: impl Into<String>) -> Self {
        Self {
            batch_id,
            file_id,
            original_name: original_name.into(),
            disposition: UploadDisposition::Skipped,
            media_id: None,
            error: None,
            batch_state: None,
        }
    }

    pub fn is_stored(&self) -> bool {
        self.disposition == UploadDisposition::Stored
    }
}
