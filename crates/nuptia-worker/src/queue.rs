//! Task queue: worker pool, LISTEN/NOTIFY or polling, retry, and submission.
//!
//! Shutdown: [`TaskQueue::shutdown`] signals the pool to stop; it does not wait for
//! in-flight tasks. For graceful shutdown, coordinate with your runtime and allow
//! time for running tasks to finish before process exit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use nuptia_core::models::{Priority, Task, TaskType};
use nuptia_core::{Config, TaskError};
use nuptia_db::{TaskStore, TASK_NOTIFY_CHANNEL};

use crate::context::TaskHandlerContext;

/// Delay in seconds before the next attempt: `base * (retry_count + 1)`.
#[inline]
pub(crate) fn compute_retry_backoff_seconds(base_secs: u64, retry_count: i32) -> u64 {
    base_secs.saturating_mul(retry_count.max(0) as u64 + 1)
}

/// Failure reason reported for tasks that lost their worker on every attempt.
const WORKER_LOST_REASON: &str = "Processing was interrupted too many times";

/// Whether an error returned by a handler was flagged as not worth retrying.
fn is_unrecoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TaskError>()
        .map(|te| !te.is_recoverable())
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct TaskQueueConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_seconds: i32,
    pub max_retries: i32,
    /// Base delay for linear retry backoff.
    pub retry_backoff_secs: u64,
    /// Interval in seconds between runs of the stale task reaper. 0 = disabled.
    pub stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to task timeout before reaping stale running tasks.
    pub stale_task_grace_period_secs: i64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_ms: 1000,
            default_timeout_seconds: 120,
            max_retries: 2,
            retry_backoff_secs: 10,
            stale_task_reap_interval_secs: 60,
            stale_task_grace_period_secs: 300,
        }
    }
}

impl TaskQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.task_queue_max_workers(),
            poll_interval_ms: config.task_queue_poll_interval_ms(),
            default_timeout_seconds: config.task_queue_timeout_seconds(),
            max_retries: config.task_queue_max_retries(),
            retry_backoff_secs: config.task_queue_retry_backoff_secs(),
            stale_task_reap_interval_secs: config.task_queue_stale_task_reap_interval_secs(),
            stale_task_grace_period_secs: config.task_queue_stale_task_grace_period_secs(),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    config: TaskQueueConfig,
    shutdown_tx: mpsc::Sender<()>,
}

impl TaskQueue {
    /// Create a new TaskQueue with a weak reference to the dispatch context.
    ///
    /// If `pool` is `Some`, the worker uses PostgreSQL LISTEN/NOTIFY to wake immediately
    /// when tasks are created, in addition to polling at `poll_interval_ms`.
    /// If `pool` is `None`, only polling is used.
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: TaskQueueConfig,
        context: Weak<dyn TaskHandlerContext>,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let store_clone = store.clone();
        let config_clone = config.clone();

        tokio::spawn(async move {
            Self::worker_pool(store_clone, config_clone, context, shutdown_rx, pool).await;
        });

        Self {
            store,
            config,
            shutdown_tx,
        }
    }

    /// Creates a TaskQueue that does not spawn a worker.
    ///
    /// Tasks submitted here are persisted and picked up by whichever worker
    /// process is running, or by [`TaskQueue::drain`].
    pub fn new_no_worker(store: Arc<dyn TaskStore>, config: TaskQueueConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        drop(shutdown_rx);
        Self {
            store,
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Submit a new task to the queue.
    #[tracing::instrument(skip(self, payload))]
    pub async fn submit_task(
        &self,
        wedding_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        let task = self
            .store
            .create_task(
                wedding_id,
                task_type,
                payload,
                priority.as_i32(),
                scheduled_at,
                self.config.max_retries,
                Some(self.config.default_timeout_seconds),
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    wedding_id = %wedding_id,
                    task_type = %task_type,
                    priority = priority.as_i32(),
                    "Failed to create task in store"
                );
                anyhow::anyhow!("Failed to create task in store: {}", e)
            })?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task_type,
            priority = priority.as_i32(),
            "Task submitted to queue"
        );

        Ok(task.id)
    }

    /// Claim and run due tasks one at a time until none is ready.
    /// Returns how many tasks were run.
    pub async fn drain(&self, context: Arc<dyn TaskHandlerContext>) -> Result<usize> {
        let mut processed = 0;
        while let Some(task) = self
            .store
            .claim_next_task()
            .await
            .context("Failed to claim task from queue")?
        {
            if let Err(e) = Self::process_task_with_retry(
                task,
                self.store.clone(),
                self.config.clone(),
                context.clone(),
            )
            .await
            {
                tracing::debug!(error = %e, "Drained task did not complete");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one stale task reaper pass now, outside the worker pool schedule.
    pub async fn reap_stale_tasks(&self, context: Arc<dyn TaskHandlerContext>) -> Result<usize> {
        Self::reap_once(&self.store, self.config.stale_task_grace_period_secs, &context).await
    }

    /// Requeue or fail tasks whose worker vanished. Failed ones are reported to
    /// the context like any other permanent failure. Returns how many were failed.
    async fn reap_once(
        store: &Arc<dyn TaskStore>,
        grace_period_secs: i64,
        context: &Arc<dyn TaskHandlerContext>,
    ) -> Result<usize> {
        let reaped = store
            .reap_stale_running_tasks(grace_period_secs)
            .await
            .context("Failed to reap stale running tasks")?;

        for task in &reaped.exhausted {
            tracing::error!(
                task_id = %task.id,
                retry_count = task.retry_count,
                "Task lost its worker too many times"
            );
            if let Err(e) = context.clone().on_task_failed(task, WORKER_LOST_REASON).await {
                tracing::error!(error = %e, task_id = %task.id, "on_task_failed hook failed");
            }
        }
        Ok(reaped.exhausted.len())
    }

    async fn worker_pool(
        store: Arc<dyn TaskStore>,
        config: TaskQueueConfig,
        context: Weak<dyn TaskHandlerContext>,
        mut shutdown_rx: mpsc::Receiver<()>,
        pool: Option<sqlx::PgPool>,
    ) {
        let use_listen = pool.is_some();
        tracing::info!(
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval_ms,
            listen_notify = use_listen,
            "Task queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        // Wakes the main loop when LISTEN receives a NOTIFY.
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = pool {
            let tx = notify_tx.clone();
            tokio::spawn(async move {
                loop {
                    match sqlx::postgres::PgListener::connect_with(&pool).await {
                        Ok(mut listener) => {
                            if let Err(e) = listener.listen(TASK_NOTIFY_CHANNEL).await {
                                tracing::warn!(error = %e, "LISTEN failed, will retry");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                continue;
                            }
                            while listener.recv().await.is_ok() {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "PgListener connect failed, will retry");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            });
        }

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if config.stale_task_reap_interval_secs > 0 {
            let store_for_reaper = store.clone();
            let context_for_reaper = context.clone();
            let reap_interval = Duration::from_secs(config.stale_task_reap_interval_secs);
            let grace_period = config.stale_task_grace_period_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let Some(ctx) = context_for_reaper.upgrade() else {
                                tracing::warn!("TaskHandlerContext was dropped, skipping stale task reap");
                                continue;
                            };
                            if let Err(e) = Self::reap_once(&store_for_reaper, grace_period, &ctx).await {
                                tracing::error!(error = %e, "Stale task reaper failed");
                            }
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Task queue worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    break;
                }
                _ = notify_rx.recv() => {
                    Self::claim_and_dispatch_one(&store, &config, &semaphore, &context).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch_one(&store, &config, &semaphore, &context).await;
                }
            }
        }

        tracing::info!("Task queue worker pool stopped");
    }

    async fn claim_and_dispatch_one(
        store: &Arc<dyn TaskStore>,
        config: &TaskQueueConfig,
        semaphore: &Arc<Semaphore>,
        context: &Weak<dyn TaskHandlerContext>,
    ) {
        // A claimed task with no context would sit in `running` until reaped.
        let Some(ctx) = context.upgrade() else {
            tracing::warn!("TaskHandlerContext was dropped, not claiming tasks");
            return;
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No workers available, skipping claim");
                return;
            }
        };

        match store.claim_next_task().await {
            Ok(Some(task)) => {
                let store = store.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = Self::process_task_with_retry(task, store, config, ctx).await
                    {
                        tracing::error!(error = %e, "Task processing failed");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No tasks available in queue");
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim task from queue");
            }
        }
    }

    /// Mark a task failed for good and let the context account for it.
    async fn fail_permanently(
        task: &Task,
        store: &Arc<dyn TaskStore>,
        context: &Arc<dyn TaskHandlerContext>,
        error_result: serde_json::Value,
        reason: &str,
    ) -> Result<()> {
        store
            .mark_failed(task.id, error_result)
            .await
            .context("Failed to mark task as failed")?;

        if let Err(e) = context.clone().on_task_failed(task, reason).await {
            tracing::error!(
                task_id = %task.id,
                error = %e,
                "Task failure hook failed"
            );
        }
        Ok(())
    }

    #[tracing::instrument(skip(store, config, context), fields(task.id = %task.id, task.type = %task.task_type))]
    async fn process_task_with_retry(
        task: Task,
        store: Arc<dyn TaskStore>,
        config: TaskQueueConfig,
        context: Arc<dyn TaskHandlerContext>,
    ) -> Result<()> {
        let timeout_seconds = task
            .timeout_seconds
            .unwrap_or(config.default_timeout_seconds)
            .max(1);
        let timeout_duration = Duration::from_secs(timeout_seconds as u64);

        let result =
            tokio::time::timeout(timeout_duration, context.clone().dispatch_task(&task)).await;

        match result {
            Ok(Ok(task_result)) => {
                store
                    .mark_completed(task.id, task_result)
                    .await
                    .context("Failed to mark task as completed")?;
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempt = task.attempt(),
                    "Task completed successfully"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let unrecoverable = is_unrecoverable(&e);

                tracing::error!(
                    task_id = %task.id,
                    error = %e,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    unrecoverable = unrecoverable,
                    "Task execution failed"
                );

                if unrecoverable {
                    let error_result = json!({
                        "error": e.to_string(),
                        "retry_count": task.retry_count,
                        "unrecoverable": true,
                        "reason": "Task failed with unrecoverable error"
                    });
                    Self::fail_permanently(&task, &store, &context, error_result, &e.to_string())
                        .await?;
                    tracing::error!(
                        task_id = %task.id,
                        "Task failed with unrecoverable error, will not retry"
                    );
                    return Err(e);
                }

                if task.can_retry() {
                    let backoff_seconds =
                        compute_retry_backoff_seconds(config.retry_backoff_secs, task.retry_count);
                    let run_at = Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
                    tracing::info!(
                        task_id = %task.id,
                        retry_count = task.retry_count + 1,
                        backoff_seconds = backoff_seconds,
                        "Scheduling task retry"
                    );
                    store
                        .schedule_retry(task.id, run_at, &e.to_string())
                        .await
                        .context("Failed to schedule task retry")?;
                    Ok(())
                } else {
                    let error_result = json!({
                        "error": e.to_string(),
                        "retry_count": task.retry_count,
                        "reason": "Task failed after maximum retries"
                    });
                    Self::fail_permanently(&task, &store, &context, error_result, &e.to_string())
                        .await?;
                    tracing::error!(task_id = %task.id, "Task failed after max retries");
                    Err(e)
                }
            }
            Err(_) => {
                let reason = format!("Processing timed out after {} seconds", timeout_seconds);
                let error_result = json!({
                    "error": reason,
                    "timeout_seconds": timeout_seconds,
                });
                tracing::error!(
                    task_id = %task.id,
                    timeout_seconds = timeout_seconds,
                    "Task execution timed out"
                );
                Self::fail_permanently(&task, &store, &context, error_result, &reason).await?;
                Err(anyhow::anyhow!(reason))
            }
        }
    }

    /// Signals the worker pool to stop claiming new tasks and exit the main loop.
    ///
    /// Returns immediately after sending the signal; already-spawned task
    /// handlers keep running until they complete or time out.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating task queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nuptia_core::models::TaskStatus;
    use nuptia_db::InMemoryTaskStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails with a recoverable error the first `fail_times` dispatches.
    struct FlakyContext {
        fail_times: usize,
        unrecoverable: bool,
        sleep: Option<Duration>,
        calls: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    impl FlakyContext {
        fn new(fail_times: usize) -> Self {
            Self {
                fail_times,
                unrecoverable: false,
                sleep: None,
                calls: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskHandlerContext for FlakyContext {
        async fn dispatch_task(self: Arc<Self>, _task: &Task) -> Result<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.sleep {
                sleep(d).await;
            }
            if call < self.fail_times {
                if self.unrecoverable {
                    return Err(TaskError::unrecoverable(anyhow::anyhow!("bad payload")).into());
                }
                return Err(TaskError::recoverable(anyhow::anyhow!("disk hiccup")).into());
            }
            Ok(json!({ "ok": true }))
        }

        async fn on_task_failed(self: Arc<Self>, _task: &Task, reason: &str) -> Result<()> {
            self.failures.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    fn queue(store: &InMemoryTaskStore, config: TaskQueueConfig) -> TaskQueue {
        TaskQueue::new_no_worker(Arc::new(store.clone()), config)
    }

    async fn submit(queue: &TaskQueue) -> Uuid {
        queue
            .submit_task(
                Uuid::new_v4(),
                TaskType::ProcessUpload,
                json!({}),
                Priority::Normal,
                None,
            )
            .await
            .unwrap()
    }

    #[test]
    fn retry_backoff_is_linear() {
        assert_eq!(compute_retry_backoff_seconds(10, 0), 10);
        assert_eq!(compute_retry_backoff_seconds(10, 1), 20);
        assert_eq!(compute_retry_backoff_seconds(10, 4), 50);
        assert_eq!(compute_retry_backoff_seconds(0, 3), 0);
    }

    #[test]
    fn unrecoverable_task_error_detected() {
        let err: anyhow::Error = TaskError::unrecoverable(anyhow::anyhow!("bad config")).into();
        assert!(is_unrecoverable(&err));
    }

    #[test]
    fn non_task_error_treated_as_recoverable() {
        let err: anyhow::Error = anyhow::anyhow!("generic error");
        assert!(!is_unrecoverable(&err));
        let err: anyhow::Error = TaskError::recoverable(anyhow::anyhow!("network")).into();
        assert!(!is_unrecoverable(&err));
    }

    #[tokio::test]
    async fn successful_task_is_completed() {
        let store = InMemoryTaskStore::new();
        let queue = queue(&store, TaskQueueConfig::default());
        let id = submit(&queue).await;

        let ctx = Arc::new(FlakyContext::new(0));
        assert_eq!(queue.drain(ctx).await.unwrap(), 1);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn recoverable_failure_is_retried_with_backoff() {
        let store = InMemoryTaskStore::new();
        let queue = queue(&store, TaskQueueConfig::default());
        let id = submit(&queue).await;

        let ctx = Arc::new(FlakyContext::new(1));
        queue.drain(ctx.clone()).await.unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.retry_count, 1);
        assert!(task.scheduled_at > Utc::now());
        assert_eq!(task.last_error.as_deref(), Some("disk hiccup"));

        store.make_all_due();
        queue.drain(ctx.clone()).await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(ctx.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_once() {
        let store = InMemoryTaskStore::new();
        let queue = queue(&store, TaskQueueConfig::default());
        let id = submit(&queue).await;

        let ctx = Arc::new(FlakyContext::new(usize::MAX));
        for _ in 0..3 {
            queue.drain(ctx.clone()).await.unwrap();
            store.make_all_due();
        }

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrecoverable_failure_is_not_retried() {
        let store = InMemoryTaskStore::new();
        let queue = queue(&store, TaskQueueConfig::default());
        let id = submit(&queue).await;

        let mut ctx = FlakyContext::new(1);
        ctx.unrecoverable = true;
        let ctx = Arc::new(ctx);
        queue.drain(ctx.clone()).await.unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(ctx.failures.lock().unwrap().as_slice(), ["bad payload"]);
    }

    #[tokio::test]
    async fn timed_out_task_fails_permanently() {
        let store = InMemoryTaskStore::new();
        let config = TaskQueueConfig {
            default_timeout_seconds: 1,
            ..TaskQueueConfig::default()
        };
        let queue = queue(&store, config);
        let id = submit(&queue).await;

        let mut ctx = FlakyContext::new(0);
        ctx.sleep = Some(Duration::from_secs(5));
        let ctx = Arc::new(ctx);
        queue.drain(ctx.clone()).await.unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let failures = ctx.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("timed out"));
    }

    #[tokio::test]
    async fn task_whose_worker_keeps_vanishing_fails_once() {
        let store = InMemoryTaskStore::new();
        let config = TaskQueueConfig {
            default_timeout_seconds: 0,
            stale_task_grace_period_secs: 0,
            ..TaskQueueConfig::default()
        };
        let queue = queue(&store, config);
        let id = submit(&queue).await;

        let ctx = Arc::new(FlakyContext::new(0));
        let mut failed = 0;
        for _ in 0..10 {
            // Claimed, then abandoned by a worker that never reports back.
            if store.claim_next_task().await.unwrap().is_none() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
            failed += queue.reap_stale_tasks(ctx.clone()).await.unwrap();
        }

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(failed, 1);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            ctx.failures.lock().unwrap().as_slice(),
            [WORKER_LOST_REASON]
        );
    }

    #[tokio::test]
    async fn worker_pool_picks_up_submitted_tasks() {
        let store = InMemoryTaskStore::new();
        let ctx: Arc<dyn TaskHandlerContext> = Arc::new(FlakyContext::new(0));
        let config = TaskQueueConfig {
            poll_interval_ms: 10,
            stale_task_reap_interval_secs: 0,
            ..TaskQueueConfig::default()
        };
        let queue = TaskQueue::new(Arc::new(store.clone()), config, Arc::downgrade(&ctx), None);
        let id = submit(&queue).await;

        let mut status = TaskStatus::Pending;
        for _ in 0..200 {
            status = store.get_task(id).await.unwrap().unwrap().status;
            if status == TaskStatus::Completed {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown().await;
        assert_eq!(status, TaskStatus::Completed);
    }
}
