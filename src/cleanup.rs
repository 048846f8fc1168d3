//! Orphan recovery and bulk cleanup for session directories.
//!
//! # Orphan Detection
//!
//! A session is orphaned when its `status.txt` still says RUNNING but no
//! live process backs it (the coordinator crashed, or the group was killed
//! from outside). Such sessions are reconciled from `exit-code.txt`. A
//! session whose process is alive but has been silent past its recorded
//! hang threshold is terminated.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::process::ProcessGroup;
use crate::session::{scan_dir, Disposal, MarkerStatus, SessionId, SessionManager};
use crate::Result;

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Dead RUNNING sessions whose status was repaired.
    pub reconciled: Vec<SessionId>,
    /// Hung sessions whose process group was stopped.
    pub terminated: Vec<SessionId>,
    /// Session directories deleted.
    pub removed: Vec<PathBuf>,
    /// Session directories moved to the archive.
    pub archived: Vec<PathBuf>,
    /// Archived sessions dropped by the history limit.
    pub pruned: Vec<PathBuf>,
    /// Sessions that could not be handled, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.reconciled.len()
            + self.terminated.len()
            + self.removed.len()
            + self.archived.len()
            + self.pruned.len()
            + self.failed.len()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.reconciled.extend(other.reconciled);
        self.terminated.extend(other.terminated);
        self.removed.extend(other.removed);
        self.archived.extend(other.archived);
        self.pruned.extend(other.pruned);
        self.failed.extend(other.failed);
    }
}

impl SessionManager {
    /// Reconcile dead RUNNING sessions and stop hung ones.
    ///
    /// Sessions this manager is actively driving are left alone.
    pub async fn cleanup_orphaned(&mut self) -> Result<CleanupReport> {
        let mut report = CleanupReport::new();
        let grace = self.config().grace_period;

        for session in self.scan()? {
            if self.is_active(&session.id) || session.marker() != Some(MarkerStatus::Running) {
                continue;
            }

            if !session.is_alive() {
                let exit_code = session.exit_marker();
                let marker = if exit_code == Some(0) {
                    MarkerStatus::Complete
                } else {
                    MarkerStatus::Failed
                };
                match session.write_marker(marker) {
                    Ok(()) => {
                        warn!(
                            session = %session.id,
                            task = %session.task_id,
                            ?exit_code,
                            status = %marker,
                            "orphaned session reconciled"
                        );
                        report.reconciled.push(session.id);
                    }
                    Err(e) => report.failed.push((session.id.to_string(), e.to_string())),
                }
                continue;
            }

            let idle = session.idle_for();
            let hung = session.hang_threshold > Duration::ZERO && idle > session.hang_threshold;
            let Some(pgid) = session.pgid.filter(|_| hung) else {
                continue;
            };
            warn!(
                session = %session.id,
                idle_ms = idle.as_millis() as u64,
                "orphaned session hung, terminating"
            );
            match ProcessGroup::terminate(pgid, grace).await {
                Ok(_) => {
                    let _ = session.write_marker(MarkerStatus::Failed);
                    report.terminated.push(session.id);
                }
                Err(e) => report.failed.push((session.id.to_string(), e.to_string())),
            }
        }

        if !report.is_empty() {
            info!(
                reconciled = report.reconciled.len(),
                terminated = report.terminated.len(),
                "orphan cleanup finished"
            );
        }
        Ok(report)
    }

    /// Destroy every session under the root, active or not.
    pub async fn cleanup_all(&mut self) -> Result<CleanupReport> {
        let mut report = self.cleanup_orphaned().await?;
        let ids: Vec<SessionId> = self.scan()?.into_iter().map(|s| s.id).collect();
        for id in ids {
            match self.destroy(&id).await {
                Ok(Disposal::Archived(path)) => report.archived.push(path),
                Ok(Disposal::Removed(path)) => report.removed.push(path),
                Err(e) => {
                    warn!(session = %id, error = %e, "failed to destroy session");
                    report.failed.push((id.to_string(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Keep only the newest `history_limit` archived sessions.
    pub fn prune_archive(&self) -> Result<Vec<PathBuf>> {
        let mut archived = scan_dir(&self.config().archive_dir())?;
        let limit = self.config().history_limit;
        if archived.len() <= limit {
            return Ok(Vec::new());
        }
        // Oldest first; drop from the front.
        let excess = archived.len() - limit;
        let mut pruned = Vec::with_capacity(excess);
        for session in archived.drain(..excess) {
            match std::fs::remove_dir_all(&session.dir) {
                Ok(()) => pruned.push(session.dir),
                Err(e) => warn!(path = %session.dir.display(), error = %e, "failed to prune archive"),
            }
        }
        Ok(pruned)
    }
}
