//! Task handler context trait
//!
//! The application state implements this trait. The worker calls
//! `dispatch_task` for every claimed task; the implementation matches on task
//! type and invokes the appropriate handler.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use nuptia_core::models::Task;

/// Context for task dispatch.
///
/// The worker holds a weak reference and calls `dispatch_task` when
/// processing a claimed task.
#[async_trait]
pub trait TaskHandlerContext: Send + Sync {
    /// Dispatch a task to the appropriate handler and return the result.
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value>;

    /// Called once a task has failed for good: an unrecoverable error,
    /// retries exhausted, or a timeout. The task is already marked failed.
    async fn on_task_failed(self: Arc<Self>, _task: &Task, _reason: &str) -> Result<()> {
        Ok(())
    }
}
