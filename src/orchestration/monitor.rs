//! Completion monitoring for a run.
//!
//! The `CompletionMonitor` owns every task's state machine. It turns session
//! exits, failures, timeouts and cancellations into forward-only state
//! transitions, tracks deadlines for running tasks, and emits coarse
//! [`RunEvent`]s: a task reached a terminal state, a level finished, the
//! whole graph finished.
//!
//! ## Deadlines
//!
//! Each running task gets a timeout of `timeout_factor × estimate` (or its
//! explicit override). Tasks on the critical path that run past their plain
//! estimate are logged once as bottlenecks; they are not stopped for it.
//!
//! ## Idempotency
//!
//! Signals for a task that is already terminal are ignored, so duplicate or
//! late exit notifications cannot change an outcome.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::core::dag::{CriticalPath, DependencyGraph};
use crate::core::task::{
    CancelReason, TaskId, TaskRecord, TaskResult, TaskState, Termination, TimeoutReason,
};
use crate::session::{Completion, Session};
use crate::{Error, Result};

/// Aggregate result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    /// Every task completed.
    Success,
    /// Some tasks completed, some did not.
    Partial,
    /// No task completed.
    Failure,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Partial => "PARTIAL",
            RunOutcome::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Coarse progress notifications for integrators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TaskTerminal { task_id: TaskId, state: TaskState },
    LevelComplete { level: usize },
    GraphComplete { outcome: RunOutcome },
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    estimate: Duration,
    timeout: Duration,
}

pub struct CompletionMonitor {
    records: BTreeMap<TaskId, TaskRecord>,
    levels: Vec<Vec<TaskId>>,
    levels_reported: usize,
    limits: HashMap<TaskId, Limits>,
    running_since: HashMap<TaskId, Instant>,
    critical: HashSet<TaskId>,
    flagged: HashSet<TaskId>,
    events: mpsc::UnboundedSender<RunEvent>,
    finished: bool,
}

impl CompletionMonitor {
    pub fn new(
        graph: &DependencyGraph,
        levels: Vec<Vec<TaskId>>,
        critical_path: &CriticalPath,
        timing: &Timing,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        let mut records = BTreeMap::new();
        let mut limits = HashMap::new();
        for task in graph.tasks() {
            records.insert(task.id.clone(), TaskRecord::new(task.id.clone()));
            limits.insert(
                task.id.clone(),
                Limits {
                    estimate: timing.estimate(task),
                    timeout: timing.timeout_for(task),
                },
            );
        }
        Self {
            records,
            levels,
            levels_reported: 0,
            limits,
            running_since: HashMap::new(),
            critical: critical_path.tasks.iter().cloned().collect(),
            flagged: HashSet::new(),
            events,
            finished: false,
        }
    }

    pub fn record(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    /// All records, ordered by task id.
    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.values()
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn is_pending(&self, id: &TaskId) -> bool {
        self.state(id) == Some(TaskState::Pending)
    }

    pub fn completed(&self) -> HashSet<TaskId> {
        self.records
            .values()
            .filter(|r| r.state == TaskState::Complete)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn non_terminal(&self) -> Vec<TaskId> {
        self.records
            .values()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.records.values().all(TaskRecord::is_terminal)
    }

    fn record_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// PENDING -> ASSIGNED: a session slot is reserved for the task.
    pub fn assign(&mut self, id: &TaskId) -> Result<()> {
        self.record_mut(id)?.transition(TaskState::Assigned)
    }

    /// ASSIGNED -> RUNNING: the task's session is up.
    pub fn mark_running(&mut self, id: &TaskId, session: &Session) -> Result<()> {
        let record = self.record_mut(id)?;
        record.transition(TaskState::Running)?;
        record.session_id = Some(session.id.clone());
        record.workspace = Some(session.workspace());
        record.log_path = Some(session.log_path());
        self.running_since.insert(id.clone(), Instant::now());
        info!(task = %id, session = %session.id, "task running");
        Ok(())
    }

    /// Session exited: COMPLETE on exit code 0, FAILED otherwise.
    pub fn signal_completion(
        &mut self,
        id: &TaskId,
        completion: &Completion,
    ) -> Result<Option<TaskState>> {
        let state = if completion.success {
            TaskState::Complete
        } else {
            TaskState::Failed
        };
        let result = TaskResult {
            exit_code: completion.exit_code,
            log_path: completion.log_path.clone(),
        };
        self.settle(
            id,
            state,
            Termination::Exited {
                exit_code: completion.exit_code,
            },
            Some(result),
        )
    }

    /// Fail a task that never produced an exit code (workspace, spawn or
    /// resource errors).
    pub fn fail(&mut self, id: &TaskId, message: impl Into<String>) -> Result<Option<TaskState>> {
        self.settle(
            id,
            TaskState::Failed,
            Termination::Rejected {
                message: message.into(),
            },
            None,
        )
    }

    pub fn time_out(&mut self, id: &TaskId, reason: TimeoutReason) -> Result<Option<TaskState>> {
        let result = self.record(id).and_then(|r| {
            r.log_path.clone().map(|log_path| TaskResult {
                exit_code: None,
                log_path,
            })
        });
        self.settle(id, TaskState::TimedOut, Termination::TimedOut { reason }, result)
    }

    pub fn cancel(&mut self, id: &TaskId, reason: CancelReason) -> Result<Option<TaskState>> {
        self.settle(id, TaskState::Cancelled, Termination::Cancelled { reason }, None)
    }

    fn settle(
        &mut self,
        id: &TaskId,
        state: TaskState,
        termination: Termination,
        result: Option<TaskResult>,
    ) -> Result<Option<TaskState>> {
        let record = self.record_mut(id)?;
        if record.is_terminal() {
            debug!(task = %id, current = %record.state, ignored = %state, "task already terminal");
            return Ok(None);
        }
        record.transition(state)?;
        record.termination = Some(termination.clone());
        if result.is_some() {
            record.result = result;
        }
        self.running_since.remove(id);

        match &termination {
            Termination::Exited { exit_code } if state == TaskState::Complete => {
                info!(task = %id, ?exit_code, "task complete")
            }
            Termination::Exited { exit_code } => warn!(task = %id, ?exit_code, "task failed"),
            Termination::Rejected { message } => warn!(task = %id, %message, "task failed"),
            Termination::TimedOut { reason } => warn!(task = %id, %reason, "task timed out"),
            Termination::Cancelled { reason } => info!(task = %id, %reason, "task cancelled"),
        }

        let _ = self.events.send(RunEvent::TaskTerminal {
            task_id: id.clone(),
            state,
        });
        self.report_levels();
        Ok(Some(state))
    }

    // Levels are announced in order, each once every task in it is terminal.
    fn report_levels(&mut self) {
        while let Some(level) = self.levels.get(self.levels_reported) {
            let done = level
                .iter()
                .all(|id| self.records.get(id).is_some_and(TaskRecord::is_terminal));
            if !done {
                break;
            }
            info!(level = self.levels_reported, "level complete");
            let _ = self.events.send(RunEvent::LevelComplete {
                level: self.levels_reported,
            });
            self.levels_reported += 1;
        }
    }

    /// Running tasks past their deadline at `now`.
    ///
    /// Also logs, once per task, critical-path tasks running past their
    /// estimate.
    pub fn expired(&mut self, now: Instant) -> Vec<(TaskId, TimeoutReason)> {
        let mut expired = Vec::new();
        let mut running: Vec<(&TaskId, &Instant)> = self.running_since.iter().collect();
        running.sort();
        for (id, started) in running {
            let Some(limits) = self.limits.get(id) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(*started);
            if self.critical.contains(id) && elapsed > limits.estimate && !self.flagged.contains(id)
            {
                warn!(
                    task = %id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    estimate_ms = limits.estimate.as_millis() as u64,
                    "bottleneck: critical-path task running past its estimate"
                );
                self.flagged.insert(id.clone());
            }
            if elapsed > limits.timeout {
                expired.push((
                    id.clone(),
                    TimeoutReason::Exceeded {
                        elapsed,
                        limit: limits.timeout,
                    },
                ));
            }
        }
        expired
    }

    pub fn is_bottleneck(&self, id: &TaskId) -> bool {
        self.flagged.contains(id)
    }

    pub fn outcome(&self) -> RunOutcome {
        let total = self.records.len();
        let complete = self
            .records
            .values()
            .filter(|r| r.state == TaskState::Complete)
            .count();
        if complete == total {
            RunOutcome::Success
        } else if complete == 0 {
            RunOutcome::Failure
        } else {
            RunOutcome::Partial
        }
    }

    /// Emit the graph-complete event. Later calls are no-ops.
    pub fn finish(&mut self) -> RunOutcome {
        let outcome = self.outcome();
        if !self.finished {
            self.finished = true;
            let _ = self.events.send(RunEvent::GraphComplete { outcome });
        }
        outcome
    }
}
