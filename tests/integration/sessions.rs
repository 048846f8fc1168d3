//! Detached session command tests.
//!
//! These mirror the command surface: sessions are created by one manager
//! and inspected, captured and destroyed by others, with only the files on
//! disk in common.

use std::time::Duration;

use tempfile::TempDir;

use conductor::config::{Config, SessionConfig};
use conductor::core::TaskSpec;
use conductor::process::ProcessGroup;
use conductor::session::{error_lines, Disposal, MarkerStatus, SessionId, SessionManager};
use conductor::Error;

fn session_config(dir: &TempDir) -> SessionConfig {
    let mut config = SessionConfig::new(dir.path().join("sessions"));
    config.grace_period = Duration::from_millis(300);
    config
}

async fn wait_for_marker(sessions: &SessionManager, id: &SessionId) -> MarkerStatus {
    for _ in 0..100 {
        let summary = sessions.summary(id).unwrap();
        if summary.status != MarkerStatus::Running {
            return summary.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {id} never finished");
}

/// Test: Create, list, status and capture across managers
/// Given a detached session that writes an error
/// When a fresh manager inspects it
/// Then the marker, exit code, log and error hints are all visible
#[tokio::test]
async fn test_detached_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mut creator = SessionManager::new(session_config(&dir));
    let session = creator
        .create(&TaskSpec::new("compile", "echo compiling; echo 'error: missing semicolon'; exit 1"))
        .await
        .unwrap();
    drop(creator);

    let viewer = SessionManager::new(session_config(&dir));
    assert_eq!(wait_for_marker(&viewer, &session.id).await, MarkerStatus::Failed);

    let listed = viewer.list_sessions().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task_id.as_str(), "compile");
    assert_eq!(listed[0].exit_code, Some(1));
    assert!(!listed[0].alive);

    let tail = viewer.capture(&session.id, 50).unwrap();
    assert_eq!(tail, "compiling\nerror: missing semicolon");
    assert_eq!(error_lines(&tail), vec!["error: missing semicolon".to_string()]);
    assert!(listed[0].workspace.is_dir());
}

/// Test: Detached sessions share the cap through the filesystem
/// Given max_sessions = 1 and one live detached session
/// When another manager tries to create a session
/// Then it fails with an environment-class error (exit code 3)
#[tokio::test]
async fn test_detached_cap_counts_live_sessions() {
    let dir = TempDir::new().unwrap();
    let mut config = session_config(&dir);
    config.max_sessions = 1;

    let mut first = SessionManager::new(config.clone());
    let live = first.create(&TaskSpec::new("live", "sleep 30")).await.unwrap();

    let mut second = SessionManager::new(config.clone());
    let err = second
        .create(&TaskSpec::new("blocked", "true"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrencyLimit { max: 1 }));
    assert_eq!(err.exit_code(), 3);

    let disposal = second.destroy(&live.id).await.unwrap();
    assert_eq!(disposal, Disposal::Removed(live.dir.clone()));
    assert!(!ProcessGroup::is_alive(live.pgid.unwrap()));

    second.create(&TaskSpec::new("unblocked", "true")).await.unwrap();
}

/// Test: Unknown session ids are not-found errors (exit code 1)
#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let dir = TempDir::new().unwrap();
    let mut sessions = SessionManager::new(session_config(&dir));
    let missing = SessionId::parse("nothing_123").unwrap();

    for err in [
        sessions.summary(&missing).unwrap_err(),
        sessions.capture(&missing, 10).unwrap_err(),
        sessions.destroy(&missing).await.unwrap_err(),
        SessionId::parse("../escape").unwrap_err(),
    ] {
        assert!(matches!(err, Error::SessionNotFound(_)));
        assert_eq!(err.exit_code(), 1);
    }
}

/// Test: Corrupt session metadata is an environment error (exit code 3)
#[test]
fn test_corrupt_metadata_is_environment_error() {
    let dir = TempDir::new().unwrap();
    let sessions = SessionManager::new(session_config(&dir));
    let id = SessionId::parse("broken_1").unwrap();
    let session_dir = sessions.config().root.join(id.as_str());
    std::fs::create_dir_all(&session_dir).unwrap();
    std::fs::write(session_dir.join("metadata.json"), "{not json").unwrap();

    let err = sessions.summary(&id).unwrap_err();
    assert!(matches!(err, Error::Json(_)));
    assert_eq!(err.exit_code(), 3);
}

/// Test: Cleanup-all stops live sessions and removes every directory
#[tokio::test]
async fn test_cleanup_all() {
    let dir = TempDir::new().unwrap();
    let mut creator = SessionManager::new(session_config(&dir));
    let live = creator.create(&TaskSpec::new("live", "sleep 30")).await.unwrap();
    let done = creator.create(&TaskSpec::new("done", "true")).await.unwrap();
    wait_for_marker(&creator, &done.id).await;

    let mut sweeper = SessionManager::new(session_config(&dir));
    let report = sweeper.cleanup_all().await.unwrap();
    assert_eq!(report.removed.len(), 2);
    assert!(report.failed.is_empty());
    assert!(sweeper.list_sessions().unwrap().is_empty());
    assert!(!ProcessGroup::is_alive(live.pgid.unwrap()));
}

/// Test: Archive retention keeps the newest sessions only
#[tokio::test]
async fn test_archive_history_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = session_config(&dir);
    config.archive_on_destroy = true;
    config.history_limit = 2;
    let mut sessions = SessionManager::new(config);

    let mut ids = Vec::new();
    for i in 0..3 {
        let session = sessions
            .create(&TaskSpec::new(format!("job-{i}"), "echo kept"))
            .await
            .unwrap();
        wait_for_marker(&sessions, &session.id).await;
        ids.push(session.id);
    }
    for id in &ids {
        assert!(matches!(
            sessions.destroy(id).await.unwrap(),
            Disposal::Archived(_)
        ));
    }

    let archive = sessions.config().archive_dir();
    assert!(!archive.join(ids[0].as_str()).exists());
    assert!(archive.join(ids[1].as_str()).exists());
    assert!(archive.join(ids[2].as_str()).join("output.log").exists());
}

/// Test: Config file drives the session configuration
#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conductor.toml");
    let root = dir.path().join("custom-sessions");
    let config = Config {
        sessions_dir: Some(root.display().to_string()),
        max_sessions: 2,
        archive_on_destroy: true,
        history_limit: 5,
        ..Config::default()
    };
    config.save(&path).unwrap();

    let loaded = Config::load(Some(&path)).unwrap();
    let sessions = loaded.session_config().unwrap();
    assert_eq!(sessions.root, root);
    assert_eq!(sessions.max_sessions, 2);
    assert!(sessions.archive_on_destroy);
    assert_eq!(sessions.history_limit, 5);
}
