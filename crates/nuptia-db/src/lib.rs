//! Nuptia Database Layer
//!
//! Repositories and data access for the upload pipeline: batches and their
//! outcome ledger, site media, plan limits and the task table. Services use
//! the store traits so they can run against [`memory`] stores in tests.

pub mod db;
pub mod memory;
pub mod traits;

/// Error recorded on a task whose worker disappeared mid-run.
pub const WORKER_LOST_ERROR: &str = "worker lost while running";

pub use db::{
    BatchRepository, MediaRepository, PlanRepository, TaskRepository, TASK_NOTIFY_CHANNEL,
};
pub use memory::{InMemoryBatchStore, InMemoryMediaStore, InMemoryPlanStore, InMemoryTaskStore};
pub use traits::{BatchStore, MediaStore, PlanStore, ReapedTasks, TaskStore};

/// Schema migrations, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
