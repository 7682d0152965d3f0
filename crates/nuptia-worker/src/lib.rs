//! Nuptia worker
//!
//! Background task queue: a semaphore-bounded worker pool that claims tasks
//! from a [`TaskStore`](nuptia_db::TaskStore), wakes on PostgreSQL
//! LISTEN/NOTIFY when a pool is available, retries recoverable failures with
//! linear backoff, enforces per-task timeouts and reaps tasks orphaned by a
//! crashed worker.

pub mod context;
pub mod queue;

pub use context::TaskHandlerContext;
pub use queue::{TaskQueue, TaskQueueConfig};
