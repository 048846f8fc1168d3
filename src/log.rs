//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Log levels:
//! - ERROR: failures that abort a command
//! - WARN: recoverable trouble (timeouts, hangs, orphan recovery, bottlenecks)
//! - INFO: run and task lifecycle
//! - DEBUG: scheduling decisions and session bookkeeping
//! - TRACE: per-tick health checks
//!
//! The filter comes from `CONDUCTOR_LOG` (any `EnvFilter` directive) when set,
//! otherwise `debug` with `--debug` and `info` without. Logs go to stderr so
//! stdout carries only command output.

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CONDUCTOR_LOG";

/// Install the global subscriber. Later calls are ignored.
pub fn init(debug: bool) {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug,info"
    } else {
        "info"
    }
}
