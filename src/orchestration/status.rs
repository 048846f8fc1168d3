//! Read-only views of a run in progress.
//!
//! The scheduler publishes a [`RunSnapshot`] on a `watch` channel after every
//! state change. [`StatusHandle`] is the cheap, cloneable reader side handed
//! to callers that want to inspect a run without touching the scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::task::{TaskId, TaskRecord, TaskState, Termination};
use crate::session::{error_lines, SessionSummary};
use crate::util::tail_lines;

/// Lines of log included in a status view.
pub const STATUS_TAIL_LINES: usize = 50;

/// Point-in-time copy of every task record and the live sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub sessions: Vec<SessionSummary>,
}

impl RunSnapshot {
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|r| r.state == state).count()
    }
}

/// What `get_status` reports for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub termination: Option<Termination>,
    pub log_tail: Option<String>,
    /// Lines from the tail that look like errors.
    pub error_lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<RunSnapshot>,
}

impl StatusHandle {
    pub(crate) fn new(rx: watch::Receiver<RunSnapshot>) -> Self {
        Self { rx }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. Errors once the run is over
    /// and the scheduler has been dropped.
    pub async fn changed(&mut self) -> std::result::Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatusView> {
        let record = self.rx.borrow().tasks.get(id).cloned()?;
        let log_tail = record
            .log_path
            .as_deref()
            .and_then(|path| tail_lines(path, STATUS_TAIL_LINES).ok());
        let error_lines = log_tail.as_deref().map(error_lines).unwrap_or_default();
        Some(TaskStatusView {
            exit_code: record.exit_code(),
            task_id: record.id,
            state: record.state,
            started_at: record.started_at,
            completed_at: record.completed_at,
            termination: record.termination,
            log_tail,
            error_lines,
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.rx.borrow().sessions.clone()
    }
}
