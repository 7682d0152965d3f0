//! Repository trait abstractions
//!
//! The services depend on these traits rather than on the PostgreSQL
//! repositories, so the pipeline can run against the in-memory stores in
//! tests without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nuptia_core::models::{
    BatchFileOutcome, BatchListQuery, FileOutcome, MediaTotals, OutcomeRecord, PlanLimit,
    SiteMedia, Task, TaskType, UploadBatch,
};
use nuptia_core::AppError;
use uuid::Uuid;

/// Result of one stale-task reaper pass.
#[derive(Debug, Default)]
pub struct ReapedTasks {
    /// Tasks put back to pending for another attempt.
    pub requeued: u64,
    /// Tasks that were lost on their last attempt, now marked failed.
    pub exhausted: Vec<Task>,
}

/// Upload batch persistence and atomic outcome accounting.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create_batch(&self, batch: &UploadBatch) -> Result<UploadBatch, AppError>;

    /// Lookup without tenant scoping, for workers.
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<UploadBatch>, AppError>;

    async fn get_batch_for_wedding(
        &self,
        wedding_id: Uuid,
        batch_id: Uuid,
    ) -> Result<Option<UploadBatch>, AppError>;

    /// Newest first. Without `include_completed` only pending/processing batches.
    async fn list_batches(
        &self,
        wedding_id: Uuid,
        query: &BatchListQuery,
    ) -> Result<Vec<UploadBatch>, AppError>;

    /// Flip a pending/processing batch to cancelled. Returns whether it flipped.
    async fn cancel_batch(&self, wedding_id: Uuid, batch_id: Uuid) -> Result<bool, AppError>;

    /// Move a pending batch to processing; no-op in any other state.
    async fn mark_processing(&self, batch_id: Uuid) -> Result<(), AppError>;

    /// Account one file's outcome. At most once per `(batch_id, file_id)`;
    /// counters and status are updated atomically and the returned batch
    /// carries the post-increment values.
    async fn record_outcome(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        original_name: &str,
        outcome: FileOutcome,
        error: Option<&str>,
    ) -> Result<OutcomeRecord, AppError>;

    async fn has_outcome(&self, batch_id: Uuid, file_id: Uuid) -> Result<bool, AppError>;

    /// Failed outcomes of a batch, oldest first.
    async fn failed_outcomes(&self, batch_id: Uuid) -> Result<Vec<BatchFileOutcome>, AppError>;
}

/// Site media persistence.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Insert a media row. A row with the same id is left untouched and returned.
    async fn insert_media(&self, media: &SiteMedia) -> Result<SiteMedia, AppError>;

    async fn get_media(&self, wedding_id: Uuid, id: Uuid) -> Result<Option<SiteMedia>, AppError>;

    async fn list_batch_media(&self, batch_id: Uuid) -> Result<Vec<SiteMedia>, AppError>;

    /// Count and byte-sum of the wedding's `completed` media.
    async fn completed_totals(&self, wedding_id: Uuid) -> Result<MediaTotals, AppError>;
}

/// Subscription plan lookup.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn plan_for_wedding(&self, wedding_id: Uuid) -> Result<PlanLimit, AppError>;
}

/// Background task persistence used by the worker.
#[async_trait]
pub trait TaskStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn create_task(
        &self,
        wedding_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i32,
        scheduled_at: Option<DateTime<Utc>>,
        max_retries: i32,
        timeout_seconds: Option<i32>,
    ) -> Result<Task>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Claim the highest-priority due task and mark it running.
    async fn claim_next_task(&self) -> Result<Option<Task>>;

    async fn mark_completed(&self, task_id: Uuid, result: serde_json::Value) -> Result<Task>;

    async fn mark_failed(&self, task_id: Uuid, error: serde_json::Value) -> Result<Task>;

    /// Increment the retry count and schedule the task to run again at `run_at`.
    async fn schedule_retry(
        &self,
        task_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task>;

    /// Recover running tasks whose timeout plus `grace_period_secs` has elapsed.
    ///
    /// A lost run uses up an attempt: tasks with retries left go back to
    /// pending with `retry_count` incremented, the rest are marked failed and
    /// returned so their failure can be accounted.
    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<ReapedTasks>;
}
