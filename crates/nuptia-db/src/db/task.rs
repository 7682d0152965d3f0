use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use nuptia_core::models::{Task, TaskStatus, TaskType};

use crate::traits::{ReapedTasks, TaskStore};
use crate::WORKER_LOST_ERROR;

/// Channel name for PostgreSQL LISTEN/NOTIFY when a new task is created.
pub const TASK_NOTIFY_CHANNEL: &str = "nuptia_new_task";

const TASK_COLUMNS: &str = "id, wedding_id, task_type, status, priority, payload, result, \
    scheduled_at, started_at, completed_at, retry_count, max_retries, timeout_seconds, \
    last_error, created_at, updated_at";

/// Running tasks whose timeout plus the grace period (`$1`, seconds) has elapsed.
const STALE_RUNNING: &str = "status = 'running' \
    AND started_at IS NOT NULL \
    AND started_at + make_interval(secs => COALESCE(timeout_seconds, 3600) + $1) < NOW()";

#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    #[tracing::instrument(skip(self, payload))]
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
        let scheduled_at = scheduled_at.unwrap_or_else(Utc::now);
        let status = if scheduled_at > Utc::now() {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for task creation")?;

        let sql = format!(
            r#"
            INSERT INTO tasks (
                wedding_id, task_type, status, priority, payload, scheduled_at,
                max_retries, timeout_seconds
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let task: Task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(wedding_id)
            .bind(task_type.to_string())
            .bind(status)
            .bind(priority)
            .bind(payload)
            .bind(scheduled_at)
            .bind(max_retries)
            .bind(timeout_seconds)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    wedding_id = %wedding_id,
                    task_type = %task_type,
                    "Failed to insert task into database"
                );
                anyhow::anyhow!("Failed to insert task into database: {}", e)
            })?;

        // Workers also poll, so a failed NOTIFY only delays pickup.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(TASK_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                task_id = %task.id,
                "Failed to send pg_notify for new task, workers will discover task via polling"
            );
        }

        tx.commit()
            .await
            .context("Failed to commit transaction for task creation")?;

        tracing::info!(
            task_id = %task.id,
            wedding_id = %wedding_id,
            task_type = %task_type,
            priority = priority,
            "Task created"
        );

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task")?;
        Ok(task)
    }

    /// Tasks are claimed across all weddings; handlers scope by the payload's
    /// wedding id. `FOR UPDATE SKIP LOCKED` lets concurrent workers claim
    /// without blocking each other.
    #[tracing::instrument(skip(self))]
    async fn claim_next_task(&self) -> Result<Option<Task>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status IN ('pending', 'scheduled')
                    AND scheduled_at <= NOW()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to claim next task")?;

        if let Some(ref task) = task {
            tracing::debug!(
                task_id = %task.id,
                wedding_id = %task.wedding_id,
                task_type = %task.task_type,
                attempt = task.attempt(),
                "Task claimed"
            );
        }

        Ok(task)
    }

    #[tracing::instrument(skip(self, result))]
    async fn mark_completed(&self, task_id: Uuid, result: serde_json::Value) -> Result<Task> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'completed',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(result)
            .fetch_one(&self.pool)
            .await
            .context("Failed to mark task as completed")?;

        Ok(task)
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_failed(&self, task_id: Uuid, error: serde_json::Value) -> Result<Task> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'failed',
                result = $2,
                last_error = $2->>'error',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(error)
            .fetch_one(&self.pool)
            .await
            .context("Failed to mark task as failed")?;

        tracing::error!(
            task_id = %task_id,
            wedding_id = %task.wedding_id,
            task_type = %task.task_type,
            retry_count = task.retry_count,
            "Task failed"
        );

        Ok(task)
    }

    #[tracing::instrument(skip(self, error))]
    async fn schedule_retry(
        &self,
        task_id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Task> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'scheduled',
                retry_count = retry_count + 1,
                scheduled_at = $2,
                last_error = $3,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(run_at)
            .bind(error)
            .fetch_one(&self.pool)
            .await
            .context("Failed to schedule task retry")?;

        tracing::info!(
            task_id = %task_id,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            scheduled_at = %run_at,
            "Task retry scheduled"
        );

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<ReapedTasks> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for stale task reaping")?;

        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'failed',
                result = jsonb_build_object(
                    'error', $2::text,
                    'retry_count', retry_count,
                    'reason', 'Task failed after maximum retries'
                ),
                last_error = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE {}
                AND retry_count >= max_retries
            RETURNING {}
            "#,
            STALE_RUNNING, TASK_COLUMNS
        );
        let exhausted = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(grace_period_secs as f64)
            .bind(WORKER_LOST_ERROR)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to fail exhausted stale tasks")?;

        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'pending',
                retry_count = retry_count + 1,
                started_at = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE {}
            "#,
            STALE_RUNNING
        );
        let requeued = sqlx::query(&sql)
            .bind(grace_period_secs as f64)
            .bind(WORKER_LOST_ERROR)
            .execute(&mut *tx)
            .await
            .context("Failed to requeue stale running tasks")?
            .rows_affected();

        tx.commit()
            .await
            .context("Failed to commit stale task reaping")?;

        if requeued > 0 || !exhausted.is_empty() {
            tracing::warn!(
                requeued = requeued,
                exhausted = exhausted.len(),
                "Reaped stale running tasks"
            );
        }
        Ok(ReapedTasks {
            requeued,
            exhausted,
        })
    }
}
