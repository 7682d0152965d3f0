//! PostgreSQL repositories
//!
//! One repository per entity of the upload pipeline. Each implements the
//! matching store trait from [`crate::traits`].

pub mod batch;
pub mod media;
pub mod plan;
pub mod task;

pub use batch::BatchRepository;
pub use media::MediaRepository;
pub use plan::PlanRepository;
pub use task::{TaskRepository, TASK_NOTIFY_CHANNEL};
