//! Parallel download orchestration: task queue, bounded worker pool and
//! run aggregation.

pub mod orchestrator;
pub mod summary;
pub mod task;

pub use orchestrator::{DownloadOrchestrator, RunEvent};
pub use summary::{FailureReason, RunSummary, TaskOutcome};
pub use task::{DownloadTask, TaskState};
