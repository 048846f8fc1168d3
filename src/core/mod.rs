//! Core domain models: tasks, the dependency graph and submissions.

pub mod analysis;
pub mod dag;
pub mod submission;
pub mod task;

pub use analysis::GraphAnalysis;
pub use dag::{CriticalPath, DependencyGraph};
pub use submission::Submission;
pub use task::{
    CancelReason, ResourceLimits, TaskId, TaskRecord, TaskResult, TaskSpec, TaskState,
    Termination, TimeoutReason,
};
