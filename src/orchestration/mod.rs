//! Orchestration layer: the coordinating loop and everything it drives.
//!
//! The [`Scheduler`] owns a run. It dispatches ready tasks into sessions,
//! feeds session exits to the [`CompletionMonitor`], and publishes
//! snapshots readable through a [`StatusHandle`].

mod monitor;
mod scheduler;
mod status;

pub use crate::config::FailurePolicy;
pub use monitor::{CompletionMonitor, RunEvent, RunOutcome};
pub use scheduler::{RunReport, Scheduler};
pub use status::{RunSnapshot, StatusHandle, TaskStatusView, STATUS_TAIL_LINES};
