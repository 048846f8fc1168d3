//! Shared helpers for blocking filesystem work.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Bytes read from the end of a log when tailing it.
const TAIL_WINDOW: u64 = 64 * 1024;

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Last `lines` lines of a text file. Only the final 64 KiB are read.
pub fn tail_lines(path: &Path, lines: usize) -> Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > TAIL_WINDOW {
        file.seek(SeekFrom::Start(len - TAIL_WINDOW))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

/// File contents with surrounding whitespace removed, `None` if absent or
/// empty.
pub fn read_trimmed(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
