//! Timeout, hang, cancellation and crash-recovery tests.

use std::fs;
use std::time::{Duration, Instant};

use chrono::Utc;

use conductor::core::{
    CancelReason, DependencyGraph, TaskId, TaskSpec, TaskState, Termination, TimeoutReason,
};
use conductor::orchestration::RunOutcome;
use conductor::process::ProcessGroup;
use conductor::session::{
    MarkerStatus, Session, SessionId, SessionMetadata, EXIT_CODE_FILE, METADATA_FILE, STATUS_FILE,
};

use crate::fixtures::{completed, started, Harness};

fn pgid_of(harness: &Harness, session: &SessionId) -> i32 {
    Session::load(&harness.root().join(session.as_str()))
        .unwrap()
        .pgid
        .unwrap()
}

/// Test: Silent task that never exits is timed out at its deadline
/// Given timeout_factor 2 and hang_factor 4, and a cost-1 task that sleeps forever
/// When the run proceeds
/// Then it is TIMED_OUT for exceeding its 2s deadline, within one poll of it,
/// and its process group is gone
#[tokio::test]
async fn test_sleep_forever_times_out() {
    let mut harness = Harness::new(2);
    harness.config.sessions.timing.timeout_factor = 2.0;
    harness.config.sessions.timing.hang_factor = 4.0;
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("stuck", "sleep 1000"),
        TaskSpec::new("after", "true").with_deps(["stuck"]),
    ])
    .unwrap();

    let begin = Instant::now();
    let (report, _) = harness.run(graph).await;
    let elapsed = begin.elapsed();

    let stuck = report.task("stuck").unwrap();
    assert_eq!(stuck.state, TaskState::TimedOut);
    match &stuck.termination {
        Some(Termination::TimedOut {
            reason: TimeoutReason::Exceeded { limit, .. },
        }) => assert_eq!(*limit, Duration::from_secs(2)),
        other => panic!("expected deadline timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(2), "timed out after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "timed out after {elapsed:?}");

    let after = report.task("after").unwrap();
    assert_eq!(after.state, TaskState::Cancelled);
    assert_eq!(report.outcome, RunOutcome::Failure);

    let pgid = pgid_of(&harness, stuck.session_id.as_ref().unwrap());
    assert!(!ProcessGroup::is_alive(pgid));
}

/// Test: Busy task past its explicit deadline
/// Given a task that keeps printing, with a 1s timeout override
/// When the deadline passes
/// Then it is TIMED_OUT for exceeding the deadline, not for hanging
#[tokio::test]
async fn test_timeout_override_exceeded() {
    let harness = Harness::new(2);
    let graph = DependencyGraph::from_tasks([TaskSpec::new(
        "chatty",
        "while true; do echo tick; sleep 0.1; done",
    )
    .with_timeout(Duration::from_secs(1))])
    .unwrap();
    let (report, _) = harness.run(graph).await;

    let chatty = report.task("chatty").unwrap();
    assert_eq!(chatty.state, TaskState::TimedOut);
    match &chatty.termination {
        Some(Termination::TimedOut {
            reason: TimeoutReason::Exceeded { limit, .. },
        }) => assert_eq!(*limit, Duration::from_secs(1)),
        other => panic!("expected deadline timeout, got {other:?}"),
    }
    let pgid = pgid_of(&harness, chatty.session_id.as_ref().unwrap());
    assert!(!ProcessGroup::is_alive(pgid));
}

/// Test: Slow but active task is not treated as hung
/// Given a task that prints every 0.3s for 2.5s with cost 3 (hang threshold 9s)
/// When it finishes
/// Then it is COMPLETE
#[tokio::test]
async fn test_slow_task_is_not_hung() {
    let harness = Harness::new(1);
    let graph = DependencyGraph::from_tasks([TaskSpec::new(
        "slow",
        "for i in 1 2 3 4 5 6 7 8; do echo $i; sleep 0.3; done",
    )
    .with_cost(3.0)])
    .unwrap();
    let (report, _) = harness.run(graph).await;
    assert_eq!(report.task("slow").unwrap().state, TaskState::Complete);
}

/// Test: Silent task with a long explicit deadline is caught as hung
/// Given a 60s timeout override and a fixed 1s hang threshold
/// When the task prints nothing
/// Then it is TIMED_OUT as hung long before the deadline
#[tokio::test]
async fn test_silent_task_with_long_deadline_is_hung() {
    let mut harness = Harness::new(1);
    harness.config.sessions.timing.hang_threshold = Some(Duration::from_secs(1));
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("silent", "sleep 1000").with_timeout(Duration::from_secs(60))
    ])
    .unwrap();

    let begin = Instant::now();
    let (report, _) = harness.run(graph).await;
    assert!(begin.elapsed() < Duration::from_secs(5));

    let silent = report.task("silent").unwrap();
    assert_eq!(silent.state, TaskState::TimedOut);
    assert!(matches!(
        &silent.termination,
        Some(Termination::TimedOut {
            reason: TimeoutReason::Hung { threshold, .. }
        }) if *threshold == Duration::from_secs(1)
    ));
}

/// Test: Quiet task inside its deadline is not treated as hung
/// Given default factors (deadline 3s for cost 1) and a task silent for 2.5s
/// When it finishes
/// Then it is COMPLETE
#[tokio::test]
async fn test_quiet_task_within_deadline_completes() {
    let harness = Harness::new(1);
    let graph = DependencyGraph::from_tasks([TaskSpec::new("quiet", "sleep 2.5")]).unwrap();
    let (report, _) = harness.run(graph).await;

    let quiet = report.task("quiet").unwrap();
    assert_eq!(quiet.state, TaskState::Complete, "{:?}", quiet.termination);
    assert_eq!(quiet.exit_code(), Some(0));
}

/// Test: A stopped session keeps its slot until its group is gone
/// Given one slot, a 2s grace period and a task that ignores SIGTERM past its deadline
/// When it is timed out
/// Then the next task starts only after the stubborn group was killed
#[tokio::test]
async fn test_timed_out_session_holds_slot_until_reaped() {
    let mut harness = Harness::new(1);
    harness.config.sessions.grace_period = Duration::from_secs(2);
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new(
            "a-stubborn",
            "trap '' TERM; while true; do echo x; sleep 0.05; done",
        )
        .with_cost(2.0)
        .with_timeout(Duration::from_millis(500)),
        TaskSpec::new("b-next", "true"),
    ])
    .unwrap();
    let (report, _) = harness.run(graph).await;

    let stubborn = report.task("a-stubborn").unwrap();
    assert_eq!(stubborn.state, TaskState::TimedOut);
    let next = report.task("b-next").unwrap();
    assert_eq!(next.state, TaskState::Complete);

    let waited = started(next) - completed(stubborn);
    assert!(
        waited.num_milliseconds() >= 1500,
        "b-next started {}ms after a-stubborn timed out",
        waited.num_milliseconds()
    );
    assert_eq!(report.peak_concurrency, 1);

    let pgid = pgid_of(&harness, stubborn.session_id.as_ref().unwrap());
    assert!(!ProcessGroup::is_alive(pgid));
}

/// Test: Task killed by a signal is a failure
/// Given a task that kills its own session shell
/// When the session dies without writing an exit code
/// Then the task is FAILED with no exit code
#[tokio::test]
async fn test_signal_death_is_failure() {
    let harness = Harness::new(1);
    let graph = DependencyGraph::from_tasks([TaskSpec::new("suicide", "kill -9 $$")]).unwrap();
    let (report, _) = harness.run(graph).await;

    let record = report.task("suicide").unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.exit_code(), None);
}

/// Test: Whole-run cancellation
/// Given a finished task, a running task and a pending dependent
/// When the run is cancelled twice
/// Then every non-terminal task is CANCELLED once and finished work is kept
#[tokio::test]
async fn test_run_cancellation() {
    let harness = Harness::new(2);
    let graph = DependencyGraph::from_tasks([
        TaskSpec::new("quick", "true"),
        TaskSpec::new("long", "sleep 60").with_cost(100.0),
        TaskSpec::new("after", "true").with_deps(["long"]),
    ])
    .unwrap();
    let (scheduler, _rx) = harness.scheduler(graph);
    let token = scheduler.cancellation_token();
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(500)).await;
    token.cancel();
    token.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancelled run did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(report.task("quick").unwrap().state, TaskState::Complete);
    for id in ["long", "after"] {
        let record = report.task(id).unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
        assert_eq!(
            record.termination,
            Some(Termination::Cancelled {
                reason: CancelReason::RunCancelled
            })
        );
    }
    assert_eq!(report.outcome, RunOutcome::Partial);

    let long = report.task("long").unwrap();
    let pgid = pgid_of(&harness, long.session_id.as_ref().unwrap());
    assert!(!ProcessGroup::is_alive(pgid));
}

/// Test: Stale sessions from a crashed run are reconciled at startup
/// Given two RUNNING session directories with no live process, one with an exit code
/// When a new run starts under the same root
/// Then both are finalized from their exit-code files
#[tokio::test]
async fn test_orphans_reconciled_on_startup() {
    let harness = Harness::new(1);
    let stale = |name: &str, exit_code: Option<&str>| {
        let id = SessionId(format!("{name}_1"));
        let dir = harness.root().join(id.as_str());
        fs::create_dir_all(dir.join("workspace")).unwrap();
        let metadata = SessionMetadata {
            task_id: TaskId::from(name),
            session_id: id.clone(),
            created_at: Utc::now(),
            command: "make".to_string(),
            pid: None,
            hang_threshold_ms: 1000,
        };
        fs::write(dir.join(METADATA_FILE), serde_json::to_string(&metadata).unwrap()).unwrap();
        fs::write(dir.join(STATUS_FILE), "RUNNING\n").unwrap();
        if let Some(code) = exit_code {
            fs::write(dir.join(EXIT_CODE_FILE), code).unwrap();
        }
        dir
    };
    let finished = stale("finished", Some("0\n"));
    let crashed = stale("crashed", None);

    let graph = DependencyGraph::from_tasks([TaskSpec::new("fresh", "true")]).unwrap();
    let (report, _) = harness.run(graph).await;
    assert_eq!(report.outcome, RunOutcome::Success);

    assert_eq!(
        Session::load(&finished).unwrap().marker(),
        Some(MarkerStatus::Complete)
    );
    assert_eq!(
        Session::load(&crashed).unwrap().marker(),
        Some(MarkerStatus::Failed)
    );
}
