use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle of an upload batch.
///
/// `pending → processing → completed | completed_with_errors | failed`, or
/// `cancelled` from either non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "batch_state", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Processing,
    Completed,
    /// Every file has an outcome, some succeeded and some failed.
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Processing => "processing",
            BatchState::Completed => "completed",
            BatchState::CompletedWithErrors => "completed_with_errors",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        }
    }

    /// Whether per-file outcomes may still be accounted against the batch.
    pub fn accepts_outcomes(&self) -> bool {
        matches!(self, BatchState::Pending | BatchState::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.accepts_outcomes()
    }

    /// State implied by a set of counters. Used after every atomic increment,
    /// always with the post-increment values.
    pub fn from_counters(total: i32, completed: i32, failed: i32) -> BatchState {
        if completed + failed < total {
            if completed + failed == 0 {
                BatchState::Pending
            } else {
                BatchState::Processing
            }
        } else if failed == 0 {
            BatchState::Completed
        } else if completed == 0 {
            BatchState::Failed
        } else {
            BatchState::CompletedWithErrors
        }
    }
}

impl Display for BatchState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchState::Pending),
            "processing" => Ok(BatchState::Processing),
            "completed" => Ok(BatchState::Completed),
            "completed_with_errors" => Ok(BatchState::CompletedWithErrors),
            "failed" => Ok(BatchState::Failed),
            "cancelled" => Ok(BatchState::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid batch state: {}", s)),
        }
    }
}

/// A set of files uploaded together for one wedding, optionally into one album.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct UploadBatch {
    pub id: Uuid,
    pub wedding_id: Uuid,
    pub album_id: Option<Uuid>,
    pub total_files: i32,
    pub completed_files: i32,
    pub failed_files: i32,
    pub status: BatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadBatch {
    /// Build a fresh batch in `pending` state with zeroed counters.
    pub fn new(wedding_id: Uuid, total_files: i32, album_id: Option<Uuid>) -> Result<Self, AppError> {
        if total_files < 1 {
            return Err(AppError::InvalidInput(format!(
                "A batch needs at least one file, got {}",
                total_files
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            wedding_id,
            album_id,
            total_files,
            completed_files: 0,
            failed_files: 0,
            status: BatchState::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Files without an outcome yet. Derived, never stored.
    pub fn pending_files(&self) -> i32 {
        (self.total_files - self.completed_files - self.failed_files).max(0)
    }

    pub fn is_done(&self) -> bool {
        self.status == BatchState::Cancelled || self.pending_files() == 0
    }
}

/// Final outcome of one file in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "file_outcome", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Completed,
    Failed,
}

/// Accounting record for one file; unique per `(batch_id, file_id)` so a
/// redelivered task can never be counted twice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct BatchFileOutcome {
    pub batch_id: Uuid,
    pub file_id: Uuid,
    pub original_name: String,
    pub outcome: FileOutcome,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of accounting a file outcome against a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeRecord {
    /// Counters were incremented; the batch carries the post-increment values.
    Counted(UploadBatch),
    /// This file was already accounted by an earlier delivery.
    AlreadyCounted,
    /// The batch no longer accepts outcomes (cancelled or already terminal).
    Suppressed(BatchState),
    /// The batch does not exist.
    BatchMissing,
}

/// Batch listing filter
#[derive(Debug, Clone, Deserialize)]
pub struct BatchListQuery {
    pub include_completed: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Default for BatchListQuery {
    fn default() -> Self {
        Self {
            include_completed: false,
            limit: Some(50),
            offset: Some(0),
        }
    }
}

/// Progress view of a batch.
///
/// `pending` is always `total - completed - failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchStatus {
    pub batch_id: Uuid,
    pub state: BatchState,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub pending: i32,
    pub errors: Vec<String>,
}

impl BatchStatus {
    pub fn new(
        batch_id: Uuid,
        state: BatchState,
        total: i32,
        completed: i32,
        failed: i32,
        errors: Vec<String>,
    ) -> Result<Self, AppError> {
        if total < 0 || completed < 0 || failed < 0 {
            return Err(AppError::InvalidInput(
                "Batch counters cannot be negative".to_string(),
            ));
        }
        if completed + failed > total {
            return Err(AppError::InvalidInput(format!(
                "Batch {} has {} outcomes for {} files",
                batch_id,
                completed + failed,
                total
            )));
        }
        Ok(Self {
            batch_id,
            state,
            total,
            completed,
            failed,
            pending: total - completed - failed,
            errors,
        })
    }

    pub fn from_batch(batch: &UploadBatch, errors: Vec<String>) -> Result<Self, AppError> {
        Self::new(
            batch.id,
            batch.status,
            batch.total_files,
            batch.completed_files,
            batch.failed_files,
            errors,
        )
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        f64::from(self.completed + self.failed) / f64::from(self.total) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_batch_is_pending_with_zeroed_counters() {
        let batch = UploadBatch::new(Uuid::new_v4(), 3, None).unwrap();
        assert_eq!(batch.status, BatchState::Pending);
        assert_eq!(batch.completed_files, 0);
        assert_eq!(batch.failed_files, 0);
        assert_eq!(batch.pending_files(), 3);
    }

    #[test]
    fn batch_requires_at_least_one_file() {
        assert!(UploadBatch::new(Uuid::new_v4(), 0, None).is_err());
        assert!(UploadBatch::new(Uuid::new_v4(), -2, None).is_err());
    }

    #[test]
    fn state_from_counters() {
        assert_eq!(BatchState::from_counters(3, 0, 0), BatchState::Pending);
        assert_eq!(BatchState::from_counters(3, 1, 0), BatchState::Processing);
        assert_eq!(BatchState::from_counters(3, 3, 0), BatchState::Completed);
        assert_eq!(BatchState::from_counters(3, 0, 3), BatchState::Failed);
        assert_eq!(
            BatchState::from_counters(3, 2, 1),
            BatchState::CompletedWithErrors
        );
    }

    #[test]
    fn progress_of_empty_batch_is_one_hundred() {
        let status = BatchStatus::new(Uuid::new_v4(), BatchState::Completed, 0, 0, 0, vec![]).unwrap();
        assert_eq!(status.progress_percentage(), 100.0);
        assert!(status.is_complete());
    }

    #[test]
    fn two_completed_one_failed_is_complete() {
        let status = BatchStatus::new(
            Uuid::new_v4(),
            BatchState::CompletedWithErrors,
            3,
            2,
            1,
            vec!["holiday.exe: executable content is not allowed".to_string()],
        )
        .unwrap();
        assert_eq!(status.pending, 0);
        assert!(status.is_complete());
        assert_eq!(status.progress_percentage(), 100.0);
    }

    #[test]
    fn status_rejects_more_outcomes_than_files() {
        assert!(BatchStatus::new(Uuid::new_v4(), BatchState::Processing, 2, 2, 1, vec![]).is_err());
    }

    #[test]
    fn batch_state_round_trips_through_str() {
        for state in [
            BatchState::Pending,
            BatchState::Processing,
            BatchState::Completed,
            BatchState::CompletedWithErrors,
            BatchState::Failed,
            BatchState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<BatchState>().unwrap(), state);
        }
    }
}
