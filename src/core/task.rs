//! Task data model for the dependency graph.
//!
//! A [`TaskSpec`] is what a caller submits: an opaque command plus its
//! dependencies and cost estimate. A [`TaskRecord`] is the mutable
//! bookkeeping the completion monitor keeps for that task while a run is in
//! flight. States only move forward; terminal states never change.

use std::borrow::Borrow;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::{Error, Result};

/// Caller-supplied task identifier, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Advisory per-task resource limits, applied best-effort to the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cpu_seconds.is_none() && self.max_open_files.is_none()
    }
}

fn default_cost() -> f64 {
    1.0
}

/// A unit of work as submitted.
///
/// The command is opaque: the scheduler never inspects it, it is only handed
/// to a session to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(alias = "command_spec")]
    pub command: String,
    #[serde(default)]
    pub deps: Vec<TaskId>,
    #[serde(default = "default_cost")]
    pub estimated_cost: f64,
    /// Timeout in seconds, replacing the cost-derived deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override: Option<f64>,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub resource_limits: ResourceLimits,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            deps: Vec::new(),
            estimated_cost: default_cost(),
            timeout_override: None,
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn with_deps<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_override
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Reject values that would poison scheduling arithmetic.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }
        if !self.estimated_cost.is_finite() || self.estimated_cost < 0.0 {
            return Err(Error::Validation(format!(
                "task {} has invalid estimated_cost {}",
                self.id, self.estimated_cost
            )));
        }
        if let Some(secs) = self.timeout_override {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(Error::Validation(format!(
                    "task {} has invalid timeout_override {}",
                    self.id, secs
                )));
            }
        }
        Ok(())
    }
}

/// Task lifecycle state.
///
/// `Pending -> Assigned -> Running -> {Complete | Failed | TimedOut}`, with
/// `Cancelled` (and `Failed` for resource errors) reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }

    /// Failures that trigger the run's failure policy.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::TimedOut)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Assigned) => true,
            (Assigned, Running) => true,
            (Running, Complete | TimedOut) => true,
            (Pending | Assigned | Running, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Running => "RUNNING",
            TaskState::Complete => "COMPLETE",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Why a running task was forced down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TimeoutReason {
    /// Ran longer than its deadline.
    Exceeded { elapsed: Duration, limit: Duration },
    /// Alive but produced no output for too long.
    Hung { idle: Duration, threshold: Duration },
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutReason::Exceeded { elapsed, limit } => {
                write!(f, "exceeded deadline ({:?} > {:?})", elapsed, limit)
            }
            TimeoutReason::Hung { idle, threshold } => {
                write!(f, "no output for {:?} (threshold {:?})", idle, threshold)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CancelReason {
    /// A transitive dependency failed or timed out.
    DependencyFailed { root: TaskId },
    /// Fail-fast policy tripped by another task.
    FailFast { root: TaskId },
    /// The whole run was cancelled.
    RunCancelled,
    /// Nothing could ever dispatch this task.
    Unschedulable,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::DependencyFailed { root } => write!(f, "dependency {} failed", root),
            CancelReason::FailFast { root } => write!(f, "fail-fast after {} failed", root),
            CancelReason::RunCancelled => write!(f, "run cancelled"),
            CancelReason::Unschedulable => write!(f, "unschedulable"),
        }
    }
}

/// How a task reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Termination {
    Exited { exit_code: Option<i32> },
    Rejected { message: String },
    TimedOut { reason: TimeoutReason },
    Cancelled { reason: CancelReason },
}

/// Exit code and log location of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
}

/// Runtime bookkeeping for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub session_id: Option<SessionId>,
    pub workspace: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub result: Option<TaskResult>,
    pub termination: Option<Termination>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            session_id: None,
            workspace: None,
            log_path: None,
            result: None,
            termination: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            TaskState::Assigned => self.assigned_at = Some(now),
            TaskState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.result.as_ref().and_then(|r| r.exit_code)
    }
}
