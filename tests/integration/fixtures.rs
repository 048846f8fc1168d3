//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scheduler harness rooted in a temporary directory
//! - Predefined graph shapes
//! - Timing assertions on task records

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use conductor::config::SchedulerConfig;
use conductor::core::{DependencyGraph, TaskRecord, TaskSpec};
use conductor::orchestration::{RunEvent, RunReport, Scheduler};

/// A scheduler configuration rooted in a temporary directory, with timing
/// scaled for tests: one cost unit is one second.
pub struct Harness {
    /// Keeps the sessions root alive for the test.
    pub temp_dir: TempDir,
    pub config: SchedulerConfig,
}

impl Harness {
    pub fn new(concurrency: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config =
            SchedulerConfig::new(temp_dir.path().join("sessions")).with_concurrency(concurrency);
        config.poll_interval = Duration::from_millis(50);
        config.sessions.grace_period = Duration::from_millis(500);
        config.sessions.timing.cost_unit = Duration::from_secs(1);
        config.sessions.timing.min_timeout = Duration::from_millis(200);
        Self { temp_dir, config }
    }

    pub fn root(&self) -> PathBuf {
        self.config.sessions.root.clone()
    }

    pub fn scheduler(&self, graph: DependencyGraph) -> (Scheduler, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler =
            Scheduler::new(graph, self.config.clone(), tx).expect("Failed to create scheduler");
        (scheduler, rx)
    }

    /// Run the graph to completion and collect every emitted event.
    pub async fn run(&self, graph: DependencyGraph) -> (RunReport, Vec<RunEvent>) {
        let (scheduler, mut rx) = self.scheduler(graph);
        let report = tokio::time::timeout(Duration::from_secs(60), scheduler.run())
            .await
            .expect("run did not finish in time")
            .expect("run failed");
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (report, events)
    }
}

/// A -> {B, C} -> D, each task running `command`.
pub fn diamond(command: &str) -> DependencyGraph {
    DependencyGraph::from_tasks([
        TaskSpec::new("A", command),
        TaskSpec::new("B", command).with_deps(["A"]),
        TaskSpec::new("C", command).with_deps(["A"]),
        TaskSpec::new("D", command).with_deps(["B", "C"]),
    ])
    .expect("diamond is valid")
}

/// `count` tasks with no dependencies.
pub fn independent(count: usize, command: &str) -> DependencyGraph {
    DependencyGraph::from_tasks((0..count).map(|i| TaskSpec::new(format!("task-{i}"), command)))
        .expect("independent tasks are valid")
}

pub fn started(record: &TaskRecord) -> DateTime<Utc> {
    record.started_at.expect("task never started")
}

pub fn completed(record: &TaskRecord) -> DateTime<Utc> {
    record.completed_at.expect("task never completed")
}

/// True when the RUNNING intervals of two tasks overlap.
pub fn overlapped(a: &TaskRecord, b: &TaskRecord) -> bool {
    started(a) < completed(b) && started(b) < completed(a)
}
