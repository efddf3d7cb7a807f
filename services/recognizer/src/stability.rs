//! File stability gate.
//!
//! A capture process may still be writing an image when its creation event
//! arrives. The gate polls the file size until two consecutive polls agree,
//! or until the timeout elapses, in which case the file is accepted anyway.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Result of waiting for a file to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Size unchanged between two consecutive polls
    Stable,
    /// Still changing when the timeout elapsed; accepted as best effort
    TimedOut,
    /// The file does not exist (or vanished while polling)
    Missing,
}

impl Stability {
    /// Whether processing should go ahead.
    pub fn proceed(self) -> bool {
        !matches!(self, Stability::Missing)
    }
}

/// Poll `path` until its size settles or `timeout` elapses.
pub async fn wait_for_stable(path: &Path, timeout: Duration, poll_interval: Duration) -> Stability {
    let mut last_size = match file_size(path).await {
        Some(size) => size,
        None => return Stability::Missing,
    };

    let deadline = Instant::now() + timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(path = %path.display(), size = last_size, "File still growing at timeout");
            return Stability::TimedOut;
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;

        let size = match file_size(path).await {
            Some(size) => size,
            None => return Stability::Missing,
        };

        trace!(path = %path.display(), size, last_size, "Polled file size");

        if size == last_size {
            return Stability::Stable;
        }
        last_size = size;
    }
}

/// Boolean form of [`wait_for_stable`]: false only when the file is missing.
pub async fn is_stable(path: &Path, timeout: Duration, poll_interval: Duration) -> bool {
    wait_for_stable(path, timeout, poll_interval).await.proceed()
}

async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(_) => None,
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot stat file");
            None
        }
    }
}
