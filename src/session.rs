//! Isolated execution sessions.
//!
//! A session is one task's private environment: a directory holding its
//! `workspace/`, `output.log`, `status.txt`, `exit-code.txt` and
//! `metadata.json`, plus a process group running the task's command. The
//! [`SessionManager`] owns the live set and is only ever driven by one
//! coordinator, so it needs no locking.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::core::task::{TaskId, TaskSpec};
use crate::process::ProcessGroup;
use crate::util::{blocking, blocking_with_timeout, read_trimmed, tail_lines};
use crate::{Error, Result};

pub const WORKSPACE_DIR: &str = "workspace";
pub const LOG_FILE: &str = "output.log";
pub const STATUS_FILE: &str = "status.txt";
pub const EXIT_CODE_FILE: &str = "exit-code.txt";
pub const METADATA_FILE: &str = "metadata.json";
pub const ARCHIVE_DIR: &str = "archive";

/// Upper bound on creating a session directory.
const LAYOUT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ID_PREFIX: usize = 48;

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(error|failed|fatal|critical)\b|Exception|Traceback|panicked at|Segmentation fault|core dumped",
    )
    .unwrap()
});

/// Unique session identifier: sanitized task id plus a monotonic
/// microsecond stamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate(task: &TaskId) -> Self {
        Self(format!("{}_{}", sanitize_name(task.as_str()), next_stamp()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids name directories under the sessions root; reject anything that
    /// could escape it.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s != ARCHIVE_DIR
            && !s.starts_with('.')
            && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::SessionNotFound(s.to_string()))
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn next_stamp() -> u64 {
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Make a task id safe for a directory name.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_ID_PREFIX)
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Contents of `status.txt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerStatus {
    Running,
    Complete,
    Failed,
}

impl MarkerStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "RUNNING" => Some(Self::Running),
            "COMPLETE" => Some(Self::Complete),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarkerStatus::Running => "RUNNING",
            MarkerStatus::Complete => "COMPLETE",
            MarkerStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub hang_threshold_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub task_id: TaskId,
    pub dir: PathBuf,
    pub command: String,
    pub pgid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub hang_threshold: Duration,
}

impl Session {
    pub fn workspace(&self) -> PathBuf {
        self.dir.join(WORKSPACE_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn exit_code_path(&self) -> PathBuf {
        self.dir.join(EXIT_CODE_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Rebuild a session from its directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let metadata: SessionMetadata =
            serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE))?)?;
        Ok(Self {
            id: metadata.session_id,
            task_id: metadata.task_id,
            dir: dir.to_path_buf(),
            command: metadata.command,
            pgid: metadata.pid.and_then(|pid| i32::try_from(pid).ok()),
            created_at: metadata.created_at,
            hang_threshold: Duration::from_millis(metadata.hang_threshold_ms),
        })
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            task_id: self.task_id.clone(),
            session_id: self.id.clone(),
            created_at: self.created_at,
            command: self.command.clone(),
            pid: self.pgid.and_then(|p| u32::try_from(p).ok()),
            hang_threshold_ms: u64::try_from(self.hang_threshold.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn write_metadata(&self) -> Result<()> {
        fs::write(
            self.metadata_path(),
            serde_json::to_string_pretty(&self.metadata())?,
        )?;
        Ok(())
    }

    pub fn marker(&self) -> Option<MarkerStatus> {
        read_trimmed(&self.status_path()).and_then(|s| MarkerStatus::parse(&s))
    }

    pub fn exit_marker(&self) -> Option<i32> {
        read_trimmed(&self.exit_code_path()).and_then(|s| s.parse().ok())
    }

    pub fn write_marker(&self, status: MarkerStatus) -> Result<()> {
        fs::write(self.status_path(), format!("{status}\n"))?;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.pgid.is_some_and(ProcessGroup::is_alive)
    }

    /// Time since the log was last written, or since creation if it never was.
    pub fn idle_for(&self) -> Duration {
        let since_created = (Utc::now() - self.created_at).to_std().unwrap_or_default();
        fs::metadata(self.log_path())
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(since_created, |idle| idle.min(since_created))
    }

    pub fn log_tail(&self, lines: usize) -> Result<String> {
        tail_lines(&self.log_path(), lines)
    }

    /// Read the on-disk state of this session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            task_id: self.task_id.clone(),
            status: self.marker().unwrap_or(MarkerStatus::Failed),
            exit_code: self.exit_marker(),
            created_at: self.created_at,
            alive: self.is_alive(),
            workspace: self.workspace(),
            log_path: self.log_path(),
        }
    }
}

/// Liveness check result for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Running { idle: Duration },
    /// Alive but silent past its hang threshold.
    Hung { idle: Duration, threshold: Duration },
    /// The process group is gone.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub status: MarkerStatus,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
    pub workspace: PathBuf,
    pub log_path: PathBuf,
}

/// Final word on a session whose process exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub session_id: SessionId,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub log_path: PathBuf,
}

/// Notifications from a session's background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session's shell exited (native exit notification).
    Exited {
        task_id: TaskId,
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    /// A terminated session's process group is gone and its slot is free.
    Reaped {
        task_id: TaskId,
        session_id: SessionId,
    },
}

/// Where a destroyed session's files went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    Archived(PathBuf),
    Removed(PathBuf),
}

/// Lines from a log tail that look like failures.
pub fn error_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| ERROR_LINE_RE.is_match(line))
        .map(str::to_string)
        .collect()
}

pub struct SessionManager {
    config: SessionConfig,
    active: HashMap<SessionId, Session>,
    by_task: HashMap<TaskId, SessionId>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    reapers: HashMap<SessionId, JoinHandle<()>>,
}

impl SessionManager {
    /// A manager whose sessions outlive it: nobody waits on the processes,
    /// the wrapper's marker files are the only record of completion.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            active: HashMap::new(),
            by_task: HashMap::new(),
            events: None,
            reapers: HashMap::new(),
        }
    }

    /// A manager that reports every process exit on `events`.
    pub fn with_events(config: SessionConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Global preconditions: the shell exists and the root is writable.
    pub fn preflight(&self) -> Result<()> {
        if !ProcessGroup::is_available(&self.config.shell) {
            return Err(Error::Environment(format!(
                "shell `{}` not found",
                self.config.shell
            )));
        }
        fs::create_dir_all(&self.config.root).map_err(|e| {
            Error::Environment(format!(
                "cannot create sessions root {}: {}",
                self.config.root.display(),
                e
            ))
        })?;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_sessions(&self) -> impl Iterator<Item = &Session> {
        self.active.values()
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.active.get(id)
    }

    /// Terminated sessions whose process group may still be alive.
    pub fn stopping_count(&self) -> usize {
        self.reapers.values().filter(|h| !h.is_finished()).count()
    }

    /// Forget the reaper of a session whose [`SessionEvent::Reaped`] was
    /// handled, freeing its place under the cap.
    pub fn reaped(&mut self, id: &SessionId) {
        self.reapers.remove(id);
    }

    // Detached managers share the cap with sessions from other processes.
    fn occupancy(&self) -> usize {
        if self.events.is_some() {
            return self.active.len() + self.stopping_count();
        }
        self.scan()
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|s| s.marker() == Some(MarkerStatus::Running) && s.is_alive())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Create the session directory and start the task's process group.
    pub async fn create(&mut self, task: &TaskSpec) -> Result<Session> {
        if self.occupancy() >= self.config.max_sessions {
            return Err(Error::ConcurrencyLimit {
                max: self.config.max_sessions,
            });
        }
        if self.by_task.contains_key(&task.id) {
            return Err(Error::SessionExists(task.id.to_string()));
        }

        let id = SessionId::generate(&task.id);
        let mut session = Session {
            dir: self.config.root.join(id.as_str()),
            id,
            task_id: task.id.clone(),
            command: task.command.clone(),
            pgid: None,
            created_at: Utc::now(),
            hang_threshold: self.config.timing.hang_threshold_for(task),
        };

        let root = self.config.root.clone();
        let layout = session.clone();
        blocking_with_timeout(LAYOUT_TIMEOUT, move || prepare_layout(&root, &layout)).await?;

        let mut child = match self.spawn(&session, task) {
            Ok(child) => child,
            Err(e) => {
                let _ = session.write_marker(MarkerStatus::Failed);
                return Err(e);
            }
        };
        session.pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        if let Err(e) = session.write_metadata() {
            warn!(session = %session.id, error = %e, "failed to record session pid");
        }

        if let Some(events) = &self.events {
            let events = events.clone();
            let task_id = session.task_id.clone();
            let session_id = session.id.clone();
            tokio::spawn(async move {
                let exit_code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "failed to wait on session");
                        None
                    }
                };
                let _ = events.send(SessionEvent::Exited {
                    task_id,
                    session_id,
                    exit_code,
                });
            });
        }

        info!(
            task = %session.task_id,
            session = %session.id,
            pgid = session.pgid,
            "session created"
        );
        self.by_task.insert(session.task_id.clone(), session.id.clone());
        self.active.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn spawn(&self, session: &Session, task: &TaskSpec) -> Result<tokio::process::Child> {
        let log_path = session.log_path();
        let stdout = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(|source| Error::Workspace {
                path: log_path.clone(),
                source,
            })?;
        let stderr = stdout.try_clone()?;

        let mut cmd = ProcessGroup::command(
            &self.config.shell,
            &task.command,
            &session.workspace(),
            &session.exit_code_path(),
            &session.status_path(),
        );
        cmd.stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("CONDUCTOR_TASK_ID", task.id.as_str())
            .env("CONDUCTOR_SESSION_ID", session.id.as_str())
            .env("CONDUCTOR_WORKSPACE", session.workspace());

        if !ProcessGroup::apply_limits(&mut cmd, task.resource_limits) {
            warn!(task = %task.id, "resource limits are not supported on this platform");
        }

        cmd.spawn().map_err(|source| Error::Spawn {
            task: task.id.to_string(),
            source,
        })
    }

    /// Check liveness and output recency of an active session.
    pub fn poll(&self, id: &SessionId) -> Result<SessionStatus> {
        let session = self
            .active
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        if !session.is_alive() {
            return Ok(SessionStatus::Exited);
        }
        let idle = session.idle_for();
        if idle > session.hang_threshold {
            Ok(SessionStatus::Hung {
                idle,
                threshold: session.hang_threshold,
            })
        } else {
            Ok(SessionStatus::Running { idle })
        }
    }

    /// Record that an active session's process exited.
    ///
    /// The process exit code wins; the wrapper's `exit-code.txt` fills in
    /// when the process died to a signal.
    pub fn signal_completion(&mut self, id: &SessionId, exit_code: Option<i32>) -> Result<Completion> {
        let session = self
            .active
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        self.by_task.remove(&session.task_id);

        let exit_code = exit_code.or_else(|| session.exit_marker());
        let success = exit_code == Some(0);
        let marker = if success {
            MarkerStatus::Complete
        } else {
            MarkerStatus::Failed
        };
        if session.marker() != Some(marker) {
            if let Err(e) = session.write_marker(marker) {
                warn!(session = %id, error = %e, "failed to write status marker");
            }
        }
        debug!(session = %id, ?exit_code, success, "session completed");

        Ok(Completion {
            session_id: session.id.clone(),
            exit_code,
            success,
            log_path: session.log_path(),
        })
    }

    /// Stop an active session's process group without blocking the caller.
    ///
    /// SIGTERM is sent immediately; SIGKILL follows after the grace period
    /// from a background reaper, which reports [`SessionEvent::Reaped`] once
    /// the group is gone. Until then the session still counts against the
    /// cap. Files stay on disk.
    ///
    /// Returns true when a reaper was started, false when there was no
    /// process group to stop.
    pub fn terminate(&mut self, id: &SessionId) -> Result<bool> {
        let session = self
            .active
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        self.by_task.remove(&session.task_id);

        if session.marker() == Some(MarkerStatus::Running) {
            let _ = session.write_marker(MarkerStatus::Failed);
        }
        info!(session = %id, task = %session.task_id, "terminating session");
        let Some(pgid) = session.pgid else {
            return Ok(false);
        };
        let grace = self.config.grace_period;
        let events = self.events.clone();
        let task_id = session.task_id.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move {
            match ProcessGroup::terminate(pgid, grace).await {
                Ok(forced) => debug!(session = %session_id, forced, "session terminated"),
                Err(e) => warn!(session = %session_id, error = %e, "failed to terminate session"),
            }
            if let Some(events) = events {
                let _ = events.send(SessionEvent::Reaped {
                    task_id,
                    session_id,
                });
            }
        });
        self.reapers.insert(session.id, handle);
        Ok(true)
    }

    /// Stop the session if it is running, then archive or delete its files
    /// per the retention setting.
    pub async fn destroy(&mut self, id: &SessionId) -> Result<Disposal> {
        if self.active.contains_key(id) {
            self.terminate(id)?;
        }
        if let Some(handle) = self.reapers.remove(id) {
            let _ = handle.await;
        }

        let dir = self.config.root.join(id.as_str());
        if !dir.join(METADATA_FILE).exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        let session = Session::load(&dir)?;
        if let Some(pgid) = session.pgid {
            if ProcessGroup::is_alive(pgid) {
                ProcessGroup::terminate(pgid, self.config.grace_period).await?;
            }
        }
        if session.marker() == Some(MarkerStatus::Running) {
            let _ = session.write_marker(MarkerStatus::Failed);
        }

        let disposal = if self.config.archive_on_destroy {
            let archive = self.config.archive_dir();
            let dest = archive.join(id.as_str());
            let src = dir.clone();
            let moved = dest.clone();
            blocking(move || {
                fs::create_dir_all(&archive)?;
                fs::rename(&src, &moved)?;
                Ok(())
            })
            .await?;
            self.prune_archive()?;
            Disposal::Archived(dest)
        } else {
            let src = dir.clone();
            blocking(move || Ok(fs::remove_dir_all(&src)?)).await?;
            Disposal::Removed(dir)
        };
        info!(session = %id, ?disposal, "session destroyed");
        Ok(disposal)
    }

    /// Terminate whatever is still active and wait for every reaper.
    pub async fn shutdown(&mut self) {
        let ids: Vec<SessionId> = self.active.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.terminate(&id) {
                warn!(session = %id, error = %e, "failed to terminate session on shutdown");
            }
        }
        let reapers: Vec<JoinHandle<()>> = self.reapers.drain().map(|(_, h)| h).collect();
        let _ = futures::future::join_all(reapers).await;
    }

    /// Locate a session, active or on disk.
    pub fn find(&self, id: &SessionId) -> Result<Session> {
        if let Some(session) = self.active.get(id) {
            return Ok(session.clone());
        }
        let dir = self.config.root.join(id.as_str());
        if !dir.join(METADATA_FILE).exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Session::load(&dir)
    }

    pub fn summary(&self, id: &SessionId) -> Result<SessionSummary> {
        Ok(self.find(id)?.summary())
    }

    pub fn capture(&self, id: &SessionId, lines: usize) -> Result<String> {
        self.find(id)?.log_tail(lines)
    }

    /// Every session directory under the root, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.scan()?.iter().map(Session::summary).collect())
    }

    pub(crate) fn scan(&self) -> Result<Vec<Session>> {
        scan_dir(&self.config.root)
    }

    pub(crate) fn is_active(&self, id: &SessionId) -> bool {
        self.active.contains_key(id)
    }
}

pub(crate) fn scan_dir(root: &Path) -> Result<Vec<Session>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() || path.file_name().is_some_and(|n| n == ARCHIVE_DIR) {
            continue;
        }
        if !path.join(METADATA_FILE).exists() {
            continue;
        }
        match Session::load(&path) {
            Ok(session) => sessions.push(session),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session"),
        }
    }
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(sessions)
}

fn prepare_layout(root: &Path, session: &Session) -> Result<()> {
    let fail = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Error::Workspace { path, source }
    };

    fs::create_dir_all(root).map_err(fail(root))?;
    // create_dir, not create_dir_all: an existing directory means a clash.
    fs::create_dir(&session.dir).map_err(fail(&session.dir))?;

    let result = (|| -> Result<()> {
        let workspace = session.workspace();
        fs::create_dir(&workspace).map_err(fail(&workspace))?;
        let log = session.log_path();
        fs::File::create(&log).map_err(fail(&log))?;
        session.write_marker(MarkerStatus::Running)?;
        session.write_metadata()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_dir_all(&session.dir);
    }
    result
}
