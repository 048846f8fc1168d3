//! The coordinating loop for a run.
//!
//! The [`Scheduler`] owns everything mutable about a run: the dependency
//! graph, the [`SessionManager`], the [`CompletionMonitor`] and the slot and
//! memory reservations of running tasks. Nothing else writes to them, so
//! there are no locks. Observers read a [`RunSnapshot`] published on a
//! `watch` channel after every change.
//!
//! # Loop
//!
//! Each iteration dispatches whatever is ready and fits, publishes a
//! snapshot, then waits for the first of:
//!
//! - a session exit notification (the primary completion signal),
//! - the poll tick, which checks deadlines and hang heuristics,
//! - whole-run cancellation.
//!
//! Ready tasks are dispatched in priority order: critical-path tasks first,
//! then by number of transitive dependents, then by estimated cost, then by
//! id. Independent ready tasks have no ordering guarantee beyond that.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FailurePolicy, SchedulerConfig};
use crate::core::dag::{CriticalPath, DependencyGraph};
use crate::core::task::{CancelReason, TaskId, TaskRecord, TaskSpec, TaskState, TimeoutReason};
use crate::orchestration::monitor::{CompletionMonitor, RunEvent, RunOutcome};
use crate::orchestration::status::{RunSnapshot, StatusHandle};
use crate::session::{
    Completion, Session, SessionEvent, SessionId, SessionManager, SessionStatus,
};
use crate::{Error, Result};

/// Final account of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Every task's record, ordered by id.
    pub tasks: Vec<TaskRecord>,
    pub levels: Vec<Vec<TaskId>>,
    pub critical_path: CriticalPath,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Most sessions that were running at once.
    pub peak_concurrency: usize,
}

impl RunReport {
    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|r| r.id.as_str() == id)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|r| r.state == state).count()
    }
}

#[derive(Debug, Clone)]
struct Priority {
    critical: bool,
    dependents: usize,
    cost: f64,
}

#[derive(Debug, Clone)]
struct Reservation {
    session_id: SessionId,
    memory_mb: u64,
}

enum Wake {
    Cancelled,
    Session(SessionEvent),
    Tick,
}

pub struct Scheduler {
    run_id: Uuid,
    graph: DependencyGraph,
    config: SchedulerConfig,
    levels: Vec<Vec<TaskId>>,
    critical_path: CriticalPath,
    priorities: HashMap<TaskId, Priority>,
    sessions: SessionManager,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    monitor: CompletionMonitor,
    /// Slot and memory held by each running task.
    active: HashMap<TaskId, Reservation>,
    /// Memory held by terminated sessions until their process group is
    /// reaped. Each entry also holds a slot.
    stopping: HashMap<SessionId, u64>,
    reserved_memory_mb: u64,
    peak_concurrency: usize,
    cancel: CancellationToken,
    status_tx: watch::Sender<RunSnapshot>,
}

impl Scheduler {
    /// Validate the graph and prepare a run.
    ///
    /// Fails before anything is dispatched when the graph has a cycle, the
    /// configuration is unusable, or the session environment is missing.
    ///
    /// The scheduler's `concurrency_limit` is the one cap for the run: the
    /// session manager's `max_sessions` is set to match it.
    pub fn new(
        graph: DependencyGraph,
        mut config: SchedulerConfig,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<Self> {
        if config.concurrency_limit == 0 {
            return Err(Error::Config("concurrency limit must be at least 1".into()));
        }
        if config.sessions.max_sessions != config.concurrency_limit {
            debug!(
                max_sessions = config.sessions.max_sessions,
                concurrency = config.concurrency_limit,
                "aligning session cap with concurrency limit"
            );
            config.sessions.max_sessions = config.concurrency_limit;
        }
        graph.validate()?;
        let levels = graph.compute_levels()?;
        let critical_path = graph.critical_path()?;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::with_events(config.sessions.clone(), session_tx);
        sessions.preflight()?;

        let priorities = graph
            .tasks()
            .into_iter()
            .map(|task| {
                let priority = Priority {
                    critical: critical_path.contains(&task.id),
                    dependents: graph.transitive_dependents(&task.id).len(),
                    cost: task.estimated_cost,
                };
                (task.id.clone(), priority)
            })
            .collect();

        let monitor = CompletionMonitor::new(
            &graph,
            levels.clone(),
            &critical_path,
            config.timing(),
            events,
        );
        let (status_tx, _) = watch::channel(RunSnapshot::default());

        let scheduler = Self {
            run_id: Uuid::new_v4(),
            graph,
            config,
            levels,
            critical_path,
            priorities,
            sessions,
            session_rx,
            monitor,
            active: HashMap::new(),
            stopping: HashMap::new(),
            reserved_memory_mb: 0,
            peak_concurrency: 0,
            cancel: CancellationToken::new(),
            status_tx,
        };
        scheduler.publish();
        Ok(scheduler)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn levels(&self) -> &[Vec<TaskId>] {
        &self.levels
    }

    pub fn critical_path(&self) -> &CriticalPath {
        &self.critical_path
    }

    /// Token that cancels the whole run when triggered. Cancelling more
    /// than once has no further effect.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle::new(self.status_tx.subscribe())
    }

    /// Pending tasks whose dependencies are complete, in dispatch order.
    pub fn ready_queue(&self) -> Vec<TaskId> {
        let completed = self.monitor.completed();
        let mut ready: Vec<&TaskSpec> = self
            .graph
            .ready(&completed)
            .into_iter()
            .filter(|task| self.monitor.is_pending(&task.id))
            .collect();
        ready.sort_by(|a, b| self.compare(&a.id, &b.id));
        ready.into_iter().map(|task| task.id.clone()).collect()
    }

    fn compare(&self, a: &TaskId, b: &TaskId) -> Ordering {
        match (self.priorities.get(a), self.priorities.get(b)) {
            (Some(pa), Some(pb)) => pb
                .critical
                .cmp(&pa.critical)
                .then_with(|| pb.dependents.cmp(&pa.dependents))
                .then_with(|| pb.cost.total_cmp(&pa.cost))
                .then_with(|| a.cmp(b)),
            _ => a.cmp(b),
        }
    }

    /// Drive the run until every task is terminal.
    pub async fn run(mut self) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(
            run = %self.run_id,
            tasks = self.graph.len(),
            levels = self.levels.len(),
            concurrency = self.config.concurrency_limit,
            critical_cost = self.critical_path.total_cost,
            "run started"
        );

        match self.sessions.cleanup_orphaned().await {
            Ok(report) if !report.is_empty() => {
                info!(reconciled = report.reconciled.len(), "recovered orphaned sessions")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan recovery failed"),
        }

        let cancel = self.cancel.clone();
        let mut tick = interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                self.cancel_all(CancelReason::RunCancelled);
            } else {
                self.dispatch_ready().await;
            }
            self.publish();

            if self.monitor.all_terminal() {
                break;
            }
            if self.slots_in_use() == 0 {
                // Nothing running or stopping, and nothing could start.
                warn!(remaining = self.monitor.non_terminal().len(), "no task can be dispatched");
                self.cancel_all(CancelReason::Unschedulable);
                continue;
            }

            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = self.session_rx.recv() => match event {
                    Some(event) => Wake::Session(event),
                    None => Wake::Tick,
                },
                _ = tick.tick() => Wake::Tick,
            };
            match wake {
                Wake::Cancelled => info!(run = %self.run_id, "run cancellation requested"),
                Wake::Session(event) => self.handle_session_event(event),
                Wake::Tick => self.check_health(),
            }
        }

        self.sessions.shutdown().await;
        let outcome = self.monitor.finish();
        self.publish();

        let report = RunReport {
            run_id: self.run_id,
            outcome,
            tasks: self.monitor.records().cloned().collect(),
            levels: self.levels,
            critical_path: self.critical_path,
            started_at,
            finished_at: Utc::now(),
            peak_concurrency: self.peak_concurrency,
        };
        info!(
            run = %report.run_id,
            %outcome,
            complete = report.count(TaskState::Complete),
            failed = report.count(TaskState::Failed),
            timed_out = report.count(TaskState::TimedOut),
            cancelled = report.count(TaskState::Cancelled),
            "run finished"
        );
        Ok(report)
    }

    async fn dispatch_ready(&mut self) {
        for id in self.ready_queue() {
            if self.slots_in_use() >= self.config.concurrency_limit {
                break;
            }
            // An earlier dispatch failure may have cancelled this one.
            if !self.monitor.is_pending(&id) {
                continue;
            }
            let Some(task) = self.graph.get(&id).cloned() else {
                continue;
            };

            let memory_mb = task.resource_limits.memory_mb.unwrap_or(0);
            if let Some(budget) = self.config.memory_budget_mb {
                if memory_mb > budget {
                    let err = Error::ResourceBudget {
                        task: id.to_string(),
                        required: memory_mb,
                        budget,
                    };
                    self.reject(&id, err.to_string());
                    continue;
                }
                if self.reserved_memory_mb + memory_mb > budget {
                    debug!(task = %id, memory_mb, reserved = self.reserved_memory_mb, "waiting for memory");
                    continue;
                }
            }

            self.start(&task, memory_mb).await;
        }
    }

    async fn start(&mut self, task: &TaskSpec, memory_mb: u64) {
        if let Err(e) = self.monitor.assign(&task.id) {
            warn!(task = %task.id, error = %e, "cannot assign task");
            return;
        }
        let session = match self.sessions.create(task).await {
            Ok(session) => session,
            Err(e) => {
                self.reject(&task.id, e.to_string());
                return;
            }
        };
        if let Err(e) = self.monitor.mark_running(&task.id, &session) {
            warn!(task = %task.id, error = %e, "cannot mark task running");
            match self.sessions.terminate(&session.id) {
                Ok(true) => {
                    self.stopping.insert(session.id.clone(), 0);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(task = %task.id, session = %session.id, error = %e, "failed to stop session")
                }
            }
            self.reject(&task.id, e.to_string());
            return;
        }

        self.active.insert(
            task.id.clone(),
            Reservation {
                session_id: session.id,
                memory_mb,
            },
        );
        self.reserved_memory_mb += memory_mb;
        self.peak_concurrency = self.peak_concurrency.max(self.slots_in_use());
    }

    fn slots_in_use(&self) -> usize {
        self.active.len() + self.stopping.len()
    }

    fn release(&mut self, id: &TaskId) -> Option<Reservation> {
        let reservation = self.active.remove(id)?;
        self.reserved_memory_mb = self.reserved_memory_mb.saturating_sub(reservation.memory_mb);
        Some(reservation)
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Exited {
                task_id,
                session_id,
                exit_code,
            } => self.handle_exit(task_id, session_id, exit_code),
            SessionEvent::Reaped {
                task_id,
                session_id,
            } => {
                self.sessions.reaped(&session_id);
                if let Some(memory_mb) = self.stopping.remove(&session_id) {
                    self.reserved_memory_mb = self.reserved_memory_mb.saturating_sub(memory_mb);
                    debug!(task = %task_id, session = %session_id, "stopped session reaped");
                }
            }
        }
    }

    fn handle_exit(&mut self, task_id: TaskId, session_id: SessionId, exit_code: Option<i32>) {
        // Sessions stopped for a timeout or cancellation were already released.
        if self.active.get(&task_id).map(|r| &r.session_id) != Some(&session_id) {
            debug!(task = %task_id, session = %session_id, "ignoring exit of released session");
            return;
        }
        self.release(&task_id);

        let completion = match self.sessions.signal_completion(&session_id, exit_code) {
            Ok(completion) => completion,
            Err(e) => {
                warn!(session = %session_id, error = %e, "session bookkeeping missing");
                Completion {
                    success: exit_code == Some(0),
                    session_id,
                    exit_code,
                    log_path: self
                        .monitor
                        .record(&task_id)
                        .and_then(|r| r.log_path.clone())
                        .unwrap_or_default(),
                }
            }
        };

        match self.monitor.signal_completion(&task_id, &completion) {
            Ok(Some(TaskState::Failed)) => self.on_failure(&task_id),
            Ok(_) => {}
            Err(e) => warn!(task = %task_id, error = %e, "cannot record completion"),
        }
    }

    fn check_health(&mut self) {
        for (id, reason) in self.monitor.expired(Instant::now()) {
            self.time_out(&id, reason);
        }

        let running: Vec<(TaskId, SessionId)> = self
            .active
            .iter()
            .map(|(task, r)| (task.clone(), r.session_id.clone()))
            .collect();
        for (task, session) in running {
            match self.sessions.poll(&session) {
                Ok(SessionStatus::Hung { idle, threshold }) => {
                    self.time_out(&task, TimeoutReason::Hung { idle, threshold })
                }
                // Exits arrive as session events.
                Ok(_) => {}
                Err(e) => debug!(session = %session, error = %e, "poll failed"),
            }
        }
    }

    fn time_out(&mut self, id: &TaskId, reason: TimeoutReason) {
        let settled = match self.monitor.time_out(id, reason) {
            Ok(settled) => settled,
            Err(e) => {
                warn!(task = %id, error = %e, "cannot time out task");
                None
            }
        };
        self.stop_session(id);
        if settled.is_some() {
            self.on_failure(id);
        }
    }

    fn reject(&mut self, id: &TaskId, message: String) {
        match self.monitor.fail(id, message) {
            Ok(Some(_)) => self.on_failure(id),
            Ok(None) => {}
            Err(e) => warn!(task = %id, error = %e, "cannot fail task"),
        }
    }

    /// Terminate a running task's session. Its slot and memory stay held
    /// until the process group is reaped.
    fn stop_session(&mut self, id: &TaskId) {
        let Some(reservation) = self.active.remove(id) else {
            return;
        };
        match self.sessions.terminate(&reservation.session_id) {
            Ok(true) => {
                self.stopping
                    .insert(reservation.session_id, reservation.memory_mb);
            }
            Ok(false) => {
                self.reserved_memory_mb = self.reserved_memory_mb.saturating_sub(reservation.memory_mb);
            }
            Err(e) => {
                warn!(task = %id, session = %reservation.session_id, error = %e, "failed to stop session");
                self.reserved_memory_mb = self.reserved_memory_mb.saturating_sub(reservation.memory_mb);
            }
        }
    }

    fn on_failure(&mut self, root: &TaskId) {
        match self.config.failure_policy {
            FailurePolicy::CascadeCancel => {
                let dependents = self.graph.transitive_dependents(root);
                if !dependents.is_empty() {
                    info!(task = %root, dependents = dependents.len(), "cascading cancellation");
                }
                for id in dependents {
                    let reason = CancelReason::DependencyFailed { root: root.clone() };
                    if let Err(e) = self.monitor.cancel(&id, reason) {
                        warn!(task = %id, error = %e, "cannot cancel dependent");
                    }
                }
            }
            FailurePolicy::FailFast => {
                warn!(task = %root, "fail-fast: cancelling remaining tasks");
                self.cancel_all(CancelReason::FailFast { root: root.clone() });
            }
        }
    }

    fn cancel_all(&mut self, reason: CancelReason) {
        for id in self.monitor.non_terminal() {
            self.stop_session(&id);
            if let Err(e) = self.monitor.cancel(&id, reason.clone()) {
                warn!(task = %id, error = %e, "cannot cancel task");
            }
        }
    }

    fn publish(&self) {
        let mut sessions: Vec<_> = self.sessions.active_sessions().map(Session::summary).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let snapshot = RunSnapshot {
            tasks: self
                .monitor
                .records()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
            sessions,
        };
        self.status_tx.send_replace(snapshot);
    }
}
