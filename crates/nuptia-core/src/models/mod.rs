//! Data models for the upload pipeline
//!
//! Persistent entities (batches, media, plan limits, tasks) and the immutable
//! value objects computed from them (quota usage, batch progress, per-file
//! upload results).

mod batch;
mod media;
mod plan;
mod quota;
mod task;
mod upload;

pub use batch::*;
pub use media::*;
pub use plan::*;
pub use quota::*;
pub use task::*;
pub use upload::*;
