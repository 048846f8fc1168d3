//! Process-group control for session processes.
//!
//! Every session runs as the leader of its own process group, so a single
//! `killpg` reaches the task and anything it forked. The wrapper script
//! records the task's exit code and completion marker before exiting, which
//! lets sessions be reconciled even when nobody was waiting on the process.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::core::task::ResourceLimits;
#[cfg(unix)]
use crate::Error;
use crate::Result;

/// `$0` for the wrapper shell.
pub const WRAPPER_NAME: &str = "conductor-session";

/// Runs `$1` in a subshell, writes its exit code to `$2`, then the
/// completion marker to `$3`, then exits with the same code.
pub const WRAPPER_SCRIPT: &str = r#"( eval "$1" )
code=$?
printf '%s\n' "$code" > "$2"
if [ "$code" -eq 0 ]; then echo COMPLETE > "$3"; else echo FAILED > "$3"; fi
exit "$code""#;

const LIVENESS_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

pub struct ProcessGroup;

impl ProcessGroup {
    /// Whether the shell that runs sessions can be found.
    pub fn is_available(shell: &str) -> bool {
        which::which(shell).is_ok()
    }

    /// Build the wrapper command for one session.
    ///
    /// The caller wires stdout and stderr; stdin is closed.
    pub fn command(
        shell: &str,
        task_command: &str,
        workspace: &Path,
        exit_file: &Path,
        status_file: &Path,
    ) -> Command {
        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(WRAPPER_SCRIPT)
            .arg(WRAPPER_NAME)
            .arg(task_command)
            .arg(exit_file)
            .arg(status_file)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Install rlimits in the child before exec. Returns false when the
    /// platform cannot apply them.
    #[cfg(unix)]
    pub fn apply_limits(cmd: &mut Command, limits: ResourceLimits) -> bool {
        if limits.is_empty() {
            return true;
        }

        macro_rules! set_rlimit {
            ($resource:expr, $value:expr) => {{
                let value = $value as libc::rlim_t;
                let limit = libc::rlimit {
                    rlim_cur: value,
                    rlim_max: value,
                };
                // A refused limit must not keep the task from starting.
                let _ = libc::setrlimit($resource, &limit);
            }};
        }

        // SAFETY: the closure only calls setrlimit, which is
        // async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(mb) = limits.memory_mb {
                    set_rlimit!(libc::RLIMIT_AS, mb.saturating_mul(1024 * 1024));
                }
                if let Some(secs) = limits.cpu_seconds {
                    set_rlimit!(libc::RLIMIT_CPU, secs);
                }
                if let Some(files) = limits.max_open_files {
                    set_rlimit!(libc::RLIMIT_NOFILE, files);
                }
                Ok(())
            });
        }
        true
    }

    #[cfg(not(unix))]
    pub fn apply_limits(_cmd: &mut Command, limits: ResourceLimits) -> bool {
        limits.is_empty()
    }

    /// True while any process in the group exists.
    #[cfg(unix)]
    pub fn is_alive(pgid: i32) -> bool {
        if !Self::is_foreign_group(pgid) {
            return false;
        }
        // SAFETY: signal 0 only checks existence and permission.
        let rc = unsafe { libc::killpg(pgid, 0) };
        let exists =
            rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        if !exists {
            return false;
        }
        // Zombies still answer killpg; on Linux look for a member that is not one.
        #[cfg(target_os = "linux")]
        if let Some(live) = live_member_in_group(pgid) {
            return live;
        }
        true
    }

    #[cfg(not(unix))]
    pub fn is_alive(_pgid: i32) -> bool {
        false
    }

    /// Send `signal` to the whole group. A group that is already gone is
    /// not an error.
    #[cfg(unix)]
    pub fn signal(pgid: i32, signal: Signal) -> Result<()> {
        if !Self::is_foreign_group(pgid) {
            return Err(Error::Validation(format!(
                "refusing to signal process group {pgid}"
            )));
        }
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: killpg has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid, sig) } == 0 {
            debug!(pgid, ?signal, "signalled process group");
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err.into())
        }
    }

    #[cfg(not(unix))]
    pub fn signal(_pgid: i32, _signal: Signal) -> Result<()> {
        Ok(())
    }

    // Never touch init, an invalid id, or the group we belong to.
    #[cfg(unix)]
    fn is_foreign_group(pgid: i32) -> bool {
        // SAFETY: getpgrp cannot fail.
        pgid > 1 && pgid != unsafe { libc::getpgrp() }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Returns true when the group had to be killed.
    pub async fn terminate(pgid: i32, grace: Duration) -> Result<bool> {
        if !Self::is_alive(pgid) {
            return Ok(false);
        }
        Self::signal(pgid, Signal::Terminate)?;

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !Self::is_alive(pgid) {
                return Ok(false);
            }
            sleep(LIVENESS_POLL).await;
        }
        if !Self::is_alive(pgid) {
            return Ok(false);
        }

        warn!(pgid, grace_ms = grace.as_millis() as u64, "grace period expired, killing process group");
        Self::signal(pgid, Signal::Kill)?;
        for _ in 0..40 {
            if !Self::is_alive(pgid) {
                break;
            }
            sleep(LIVENESS_POLL).await;
        }
        Ok(true)
    }
}

/// Scan `/proc` for a non-zombie process whose process group is `pgid`.
#[cfg(target_os = "linux")]
fn live_member_in_group(pgid: i32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // The command name may contain spaces; fields resume after its ')'.
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let state = fields.next();
        let pgrp = fields.nth(1).and_then(|f| f.parse::<i32>().ok());
        if pgrp == Some(pgid) && state != Some("Z") && state != Some("X") {
            return Some(true);
        }
    }
    Some(false)
}
