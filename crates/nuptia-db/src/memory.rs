//! In-memory store implementations
//!
//! Same contracts as the PostgreSQL repositories, without a database. Each
//! store keeps its state behind one mutex so every operation, including
//! outcome accounting, is atomic.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nuptia_core::models::{
    BatchFileOutcome, BatchListQuery, BatchState, FileOutcome, MediaTotals, OutcomeRecord,
    PlanLimit, PlanTier, SiteMedia, Task, TaskStatus, TaskType, UploadBatch,
};
use nuptia_core::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::traits::{BatchStore, MediaStore, PlanStore, ReapedTasks, TaskStore};
use crate::WORKER_LOST_ERROR;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BatchTables {
    batches: HashMap<Uuid, UploadBatch>,
    outcomes: HashMap<(Uuid, Uuid), BatchFileOutcome>,
}

#[derive(Clone, Default)]
pub struct InMemoryBatchStore {
    state: Arc<Mutex<BatchTables>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded outcome of a batch
    pub fn outcomes(&self, batch_id: Uuid) -> Vec<BatchFileOutcome> {
        lock(&self.state)
            .outcomes
            .values()
            .filter(|o| o.batch_id == batch_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create_batch(&self, batch: &UploadBatch) -> Result<UploadBatch, AppError> {
        let mut state = lock(&self.state);
        if state.batches.contains_key(&batch.id) {
            return Err(AppError::InvalidInput(format!(
                "Batch {} already exists",
                batch.id
            )));
        }
        state.batches.insert(batch.id, batch.clone());
        Ok(batch.clone())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<UploadBatch>, AppError> {
        Ok(lock(&self.state).batches.get(&batch_id).cloned())
    }

    async fn get_batch_for_wedding(
        &self,
        wedding_id: Uuid,
        batch_id: Uuid,
    ) -> Result<Option<UploadBatch>, AppError> {
        Ok(lock(&self.state)
            .batches
            .get(&batch_id)
            .filter(|b| b.wedding_id == wedding_id)
            .cloned())
    }

    async fn list_batches(
        &self,
        wedding_id: Uuid,
        query: &BatchListQuery,
    ) -> Result<Vec<UploadBatch>, AppError> {
        let limit = query.limit.unwrap_or(50).clamp(1, 1000) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;

        let mut batches: Vec<UploadBatch> = lock(&self.state)
            .batches
            .values()
            .filter(|b| b.wedding_id == wedding_id)
            .filter(|b| query.include_completed || b.status.accepts_outcomes())
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(batches.into_iter().skip(offset).take(limit).collect())
    }

    async fn cancel_batch(&self, wedding_id: Uuid, batch_id: Uuid) -> Result<bool, AppError> {
        let mut state = lock(&self.state);
        match state.batches.get_mut(&batch_id) {
            Some(batch) if batch.wedding_id == wedding_id && batch.status.accepts_outcomes() => {
                batch.status = BatchState::Cancelled;
                batch.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processing(&self, batch_id: Uuid) -> Result<(), AppError> {
        let mut state = lock(&self.state);
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            if batch.status == BatchState::Pending {
                batch.status = BatchState::Processing;
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        original_name: &str,
        outcome: FileOutcome,
        error: Option<&str>,
    ) -> Result<OutcomeRecord, AppError> {
        let mut state = lock(&self.state);

        if state.outcomes.contains_key(&(batch_id, file_id)) {
            return Ok(OutcomeRecord::AlreadyCounted);
        }

        let Some(batch) = state.batches.get_mut(&batch_id) else {
            return Ok(OutcomeRecord::BatchMissing);
        };
        if !batch.status.accepts_outcomes() || batch.pending_files() == 0 {
            return Ok(OutcomeRecord::Suppressed(batch.status));
        }

        match outcome {
            FileOutcome::Completed => batch.completed_files += 1,
            FileOutcome::Failed => batch.failed_files += 1,
        }
        batch.status =
            BatchState::from_counters(batch.total_files, batch.completed_files, batch.failed_files);
        batch.updated_at = Utc::now();
        let updated = batch.clone();

        state.outcomes.insert(
            (batch_id, file_id),
            BatchFileOutcome {
                batch_id,
                file_id,
                original_name: original_name.to_string(),
                outcome,
                error: error.map(str::to_string),
                recorded_at: Utc::now(),
            },
        );

        Ok(OutcomeRecord::Counted(updated))
    }

    async fn has_outcome(&self, batch_id: Uuid, file_id: Uuid) -> Result<bool, AppError> {
        Ok(lock(&self.state).outcomes.contains_key(&(batch_id, file_id)))
    }

    async fn failed_outcomes(&self, batch_id: Uuid) -> Result<Vec<BatchFileOutcome>, AppError> {
        let mut failed: Vec<BatchFileOutcome> = lock(&self.state)
            .outcomes
            .values()
            .filter(|o| o.batch_id == batch_id && o.outcome == FileOutcome::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.file_id.cmp(&b.file_id)));
        Ok(failed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryMediaStore {
    media: Arc<Mutex<HashMap<Uuid, SiteMedia>>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.media).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn insert_media(&self, media: &SiteMedia) -> Result<SiteMedia, AppError> {
        let mut rows = lock(&self.media);
        if let Some(existing) = rows.get(&media.id) {
            if existing.wedding_id != media.wedding_id {
                return Err(AppError::Internal(format!(
                    "Media {} exists under another wedding",
                    media.id
                )));
            }
            return Ok(existing.clone());
        }
        rows.insert(media.id, media.clone());
        Ok(media.clone())
    }

    async fn get_media(&self, wedding_id: Uuid, id: Uuid) -> Result<Option<SiteMedia>, AppError> {
        Ok(lock(&self.media)
            .get(&id)
            .filter(|m| m.wedding_id == wedding_id)
            .cloned())
    }

    async fn list_batch_media(&self, batch_id: Uuid) -> Result<Vec<SiteMedia>, AppError> {
        let mut media: Vec<SiteMedia> = lock(&self.media)
            .values()
            .filter(|m| m.batch_id == Some(batch_id))
            .cloned()
            .collect();
        media.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(media)
    }

    async fn completed_totals(&self, wedding_id: Uuid) -> Result<MediaTotals, AppError> {
        let rows = lock(&self.media);
        let completed = rows.values().filter(|m| {
            m.wedding_id == wedding_id && m.status == nuptia_core::models::MediaStatus::Completed
        });
        Ok(completed.fold(MediaTotals::default(), |acc, m| MediaTotals {
            file_count: acc.file_count + 1,
            total_bytes: acc.total_bytes + m.size,
        }))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPlanStore {
    tiers: Arc<Mutex<HashMap<Uuid, PlanTier>>>,
    limits: Arc<Mutex<HashMap<PlanTier, PlanLimit>>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, wedding_id: Uuid, tier: PlanTier) {
        lock(&self.tiers).insert(wedding_id, tier);
    }

    /// Override the built-in limits of a tier.
    pub fn set_limit(&self, limit: PlanLimit) {
        lock(&self.limits).insert(limit.tier, limit);
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn plan_for_wedding(&self, wedding_id: Uuid) -> Result<PlanLimit, AppError> {
        let tier = lock(&self.tiers)
            .get(&wedding_id)
            .copied()
            .unwrap_or_default();
        Ok(lock(&self.limits)
            .get(&tier)
            .copied()
            .unwrap_or_else(|| PlanLimit::default_for(tier)))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task
    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.tasks).values().cloned().collect()
    }

    /// Make every scheduled task due now, skipping retry backoff.
    pub fn make_all_due(&self) {
        let now = Utc::now();
        for task in lock(&self.tasks).values_mut() {
            if task.status == TaskStatus::Scheduled {
                task.scheduled_at = now;
            }
        }
    }

    fn update<F>(&self, task_id: Uuid, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("Task {} not found", task_id))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        wedding_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i32,
        scheduled_at: Option<DateTime<Utc>>,
        max_retries: i32,
        timeout_seconds: Option<i32>,
    ) -> Result<Task> {
        let now = Utc::now();
        let scheduled_at = scheduled_at.unwrap_or(now);
        let task = Task {
            id: Uuid::new_v4(),
            wedding_id,
            task_type,
            status: if scheduled_at > now {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Pending
            },
            priority,
            payload,
            result: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            timeout_seconds,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        lock(&self.tasks).insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(lock(&self.tasks).get(&task_id).cloned())
    }

    async fn claim_next_task(&self) -> Result<Option<Task>> {
        let now = Utc::now();
        let mut tasks = lock(&self.tasks);
        let next = tasks
            .values_mut()
            .filter(|t| t.is_ready_to_run())
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.scheduled_at.cmp(&a.scheduled_at))
            });
        Ok(next.map(|task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn mark_completed(&self, task_id: Uuid, result: serde_json::Value) -> Result<Task> {
        self.update(task_id, |task| {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, task_id: Uuid, error: serde_json::Value) -> Result<Task> {
        self.update(task_id, |task| {
            task.status = TaskStatus::Failed;
            task.last_error = error
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string);
            task.result = Some(error);
            task.completed_at = Some(Utc::now());
        })
    }

    async fn schedule_retry(
        &self,
        task_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task> {
        self.update(task_id, |task| {
            task.status = TaskStatus::Scheduled;
            task.retry_count += 1;
            task.scheduled_at = run_at;
            task.last_error = Some(error.to_string());
            task.started_at = None;
        })
    }

    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<ReapedTasks> {
        let now = Utc::now();
        let mut reaped = ReapedTasks::default();
        for task in lock(&self.tasks).values_mut() {
            let Some(started_at) = task.started_at else {
                continue;
            };
            let budget = i64::from(task.timeout_seconds.unwrap_or(3600)) + grace_period_secs;
            if task.status != TaskStatus::Running
                || started_at + ChronoDuration::seconds(budget) >= now
            {
                continue;
            }

            task.last_error = Some(WORKER_LOST_ERROR.to_string());
            task.updated_at = now;
            if task.can_retry() {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                task.started_at = None;
                reaped.requeued += 1;
            } else {
                task.status = TaskStatus::Failed;
                task.result = Some(serde_json::json!({
                    "error": WORKER_LOST_ERROR,
                    "retry_count": task.retry_count,
                    "reason": "Task failed after maximum retries"
                }));
                task.completed_at = Some(now);
                reaped.exhausted.push(task.clone());
            }
        }
        Ok(reaped)
    }
}
