//! Failure handling tests.
//!
//! These tests verify validation at submission, cascade-cancel, fail-fast
//! and per-task resource errors.

use std::fs;

use tokio::sync::mpsc;

use conductor::config::FailurePolicy;
use conductor::core::{
    CancelReason, DependencyGraph, Submission, TaskId, TaskSpec, TaskState, Termination,
};
use conductor::orchestration::{RunOutcome, Scheduler};
use conductor::Error;

use crate::fixtures::Harness;

/// Test: Cyclic submission is rejected before anything runs
/// Given A -> B -> A
/// When the submission is loaded
/// Then validation fails naming both members and no session directory exists
#[tokio::test]
async fn test_cycle_rejected_without_sessions() {
    let harness = Harness::new(2);
    let submission = Submission::from_json(
        r#"{"tasks": [
            {"id": "A", "command": "true", "deps": ["B"]},
            {"id": "B", "command": "true", "deps": ["A"]}
        ]}"#,
    )
    .unwrap();

    let err = submission.into_graph().unwrap_err();
    match &err {
        Error::CyclicDependency { members } => {
            assert!(members.contains(&"A".to_string()));
            assert!(members.contains(&"B".to_string()));
        }
        other => panic!("expected cycle error, got {other}"),
    }
    assert_eq!(err.exit_code(), 2);
    assert!(!harness.root().exists());
}

/// Test: Cycle introduced after construction is caught by the scheduler
#[tokio::test]
async fn test_scheduler_validates_graph() {
    let harness = Harness::new(2);
    let mut graph = DependencyGraph::from_tasks([
        TaskSpec::new("A", "true"),
        TaskSpec::new("B", "true").with_deps(["A"]),
    ])
    .unwrap();
    graph
        .add_dependency(&TaskId::from("B"), &TaskId::from("A"))
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = Scheduler::new(graph, harness.config.clone(), tx).err().unwrap();
    assert!(err.is_validation());
    assert!(!harness.root().exists());
}

/// Test: Unknown dependency is rejected at add time
#[test]
fn test_unknown_dependency_rejected() {
    let mut graph = DependencyGraph::new();
    graph.add(TaskSpec::new("A", "true")).unwrap();
    let err = graph
        .add(TaskSpec::new("B", "true").with_deps(["missing"]))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDependency { .. }));
    assert!(!graph.contains(&TaskId::from("B")));
}

/// Test: Cascade-cancel spares independent branches
/// Given bad -> child -> grandchild, and an independent sibling
/// When bad exits nonzero
/// Then its descendants are CANCELLED without ever starting and the sibling completes
#[tokio::test]
async fn test_cascade_cancel_default() {
    let harness = Harness::new(4);
    assert_eq!(harness.config.failure_policy, FailurePolicy::CascadeCancel);
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("bad", "echo 'error: broken build' >&2; exit 2"),
        TaskSpec::new("child", "true").with_deps(["bad"]),
        TaskSpec::new("grandchild", "true").with_deps(["child"]),
        TaskSpec::new("sibling", "sleep 0.3"),
    ])
    .unwrap();
    let (report, _) = harness.run(graph).await;

    assert_eq!(report.outcome, RunOutcome::Partial);
    let bad = report.task("bad").unwrap();
    assert_eq!(bad.state, TaskState::Failed);
    assert_eq!(bad.exit_code(), Some(2));

    for id in ["child", "grandchild"] {
        let record = report.task(id).unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
        assert!(record.started_at.is_none());
        assert_eq!(
            record.termination,
            Some(Termination::Cancelled {
                reason: CancelReason::DependencyFailed {
                    root: TaskId::from("bad")
                }
            })
        );
    }
    assert_eq!(report.task("sibling").unwrap().state, TaskState::Complete);
}

/// Test: Fail-fast override cancels running work
/// Given a failing task and a long independent task, with fail-fast
/// When the first task fails
/// Then the long task is CANCELLED and its process group is gone
#[tokio::test]
async fn test_fail_fast_override() {
    let mut harness = Harness::new(4);
    harness.config.failure_policy = FailurePolicy::FailFast;
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("bad", "sleep 0.3; exit 1"),
        TaskSpec::new("long", "sleep 60").with_cost(100.0),
        TaskSpec::new("after-long", "true").with_deps(["long"]),
    ])
    .unwrap();
    let (report, _) = harness.run(graph).await;

    assert_eq!(report.outcome, RunOutcome::Failure);
    assert_eq!(report.task("bad").unwrap().state, TaskState::Failed);
    let long = report.task("long").unwrap();
    assert_eq!(long.state, TaskState::Cancelled);
    assert!(long.started_at.is_some());
    assert_eq!(report.task("after-long").unwrap().state, TaskState::Cancelled);

    let session = long.session_id.as_ref().unwrap();
    let pgid = conductor::Session::load(&harness.root().join(session.as_str()))
        .unwrap()
        .pgid
        .unwrap();
    assert!(!conductor::process::ProcessGroup::is_alive(pgid));
}

/// Test: Workspace failure is fatal for the task only
/// Given a sessions root that becomes unusable after startup
/// When tasks are dispatched
/// Then each dispatched task is FAILED with the workspace error and the run still finishes
#[tokio::test]
async fn test_workspace_failure_fails_task_only() {
    let harness = Harness::new(2);
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("A", "true"),
        TaskSpec::new("B", "true").with_deps(["A"]),
        TaskSpec::new("C", "true"),
    ])
    .unwrap();
    let (scheduler, _rx) = harness.scheduler(graph);

    // Preflight created the root; replace it with a plain file.
    fs::remove_dir_all(harness.root()).unwrap();
    fs::write(harness.root(), "not a directory").unwrap();

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failure);
    for id in ["A", "C"] {
        let record = report.task(id).unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(matches!(
            &record.termination,
            Some(Termination::Rejected { message }) if message.contains("workspace")
        ));
    }
    assert_eq!(report.task("B").unwrap().state, TaskState::Cancelled);
}

/// Test: Missing shell is a global precondition failure
#[test]
fn test_missing_shell_fails_whole_run() {
    let mut harness = Harness::new(2);
    harness.config.sessions.shell = "no-such-shell-anywhere".to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = Scheduler::new(DependencyGraph::new(), harness.config.clone(), tx)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Environment(_)));
    assert_eq!(err.exit_code(), 3);
}

/// Test: Memory budget too small for a task fails it without running
#[tokio::test]
async fn test_memory_budget_exceeded_is_resource_error() {
    let mut harness = Harness::new(2);
    harness.config.memory_budget_mb = Some(128);
    let submission = Submission::from_toml(
        r#"
        [[tasks]]
        id = "huge"
        command = "true"
        resource_limits = { memory_mb = 4096 }

        [[tasks]]
        id = "small"
        command = "true"
        "#,
    )
    .unwrap();
    let (report, _) = harness.run(submission.into_graph().unwrap()).await;

    let huge = report.task("huge").unwrap();
    assert_eq!(huge.state, TaskState::Failed);
    assert!(huge.session_id.is_none());
    assert!(matches!(
        &huge.termination,
        Some(Termination::Rejected { message }) if message.contains("memory budget")
    ));
    assert_eq!(report.task("small").unwrap().state, TaskState::Complete);
    assert_eq!(report.outcome, RunOutcome::Partial);
}
