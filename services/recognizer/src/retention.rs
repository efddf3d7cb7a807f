//! Age-based eviction of archived images.
//!
//! One sweep walks the archive tree depth first, deletes every file whose
//! modification time is older than the cutoff and then removes directories
//! left empty, children before parents. The archive root itself is never
//! removed.

use crate::config::RetentionConfig;
use crate::supervisor::{supervise, RestartPolicy};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Errors that abort a whole sweep. Per-entry failures never do.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Archive root {path} is unreadable: {source}")]
    RootUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Sweep task failed: {0}")]
    Task(String),
}

/// Outcome of a single sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub files_deleted: u64,
    pub dirs_removed: u64,
    /// Entries that could not be inspected or removed
    pub failures: u64,
}

/// Deletes archived images older than the retention cutoff
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    root: PathBuf,
    max_age: Duration,
    policy: RestartPolicy,
}

impl RetentionSweeper {
    pub fn new(config: &RetentionConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: config.max_age(),
            policy: RestartPolicy {
                after_success: config.sweep_interval(),
                after_failure: config.retry_interval(),
            },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sweep the archive tree once, treating `now` as the current time.
    ///
    /// A file is deleted only when its age strictly exceeds the cutoff. A
    /// missing archive root is an empty archive, not an error.
    pub fn sweep_once(&self, now: SystemTime) -> Result<SweepReport, SweepError> {
        match std::fs::metadata(&self.root) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "Archive root does not exist yet");
                return Ok(SweepReport::default());
            }
            Err(source) => {
                return Err(SweepError::RootUnreadable {
                    path: self.root.clone(),
                    source,
                })
            }
        }

        let mut report = SweepReport::default();

        for entry in WalkDir::new(&self.root).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read archive entry");
                    report.failures += 1;
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if remove_if_empty(path) {
                    report.dirs_removed += 1;
                }
                continue;
            }

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "Failed to read modification time");
                    report.failures += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read metadata");
                    report.failures += 1;
                    continue;
                }
            };

            // Files stamped in the future have age zero.
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= self.max_age {
                continue;
            }

            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Deleted expired image");
                    report.files_deleted += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete expired image");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run one sweep on the blocking pool and record metrics.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        let sweeper = self.clone();
        let report = tokio::task::spawn_blocking(move || sweeper.sweep_once(SystemTime::now()))
            .await
            .map_err(|e| SweepError::Task(e.to_string()))??;

        metrics::counter!("retention.files_deleted").increment(report.files_deleted);
        metrics::counter!("retention.dirs_removed").increment(report.dirs_removed);

        info!(
            files_deleted = report.files_deleted,
            dirs_removed = report.dirs_removed,
            failures = report.failures,
            "Retention sweep completed"
        );

        Ok(report)
    }

    /// Sweep now, then on the configured cadence until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let sweeper = &self;
        supervise("retention", self.policy, cancel, move || async move {
            sweeper.run_once().await.map(|_| ())
        })
        .await;
    }
}

fn remove_if_empty(dir: &Path) -> bool {
    let empty = match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Failed to list directory");
            return false;
        }
    };

    if !empty {
        return false;
    }

    match std::fs::remove_dir(dir) {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed empty archive directory");
            true
        }
        Err(e) => {
            // An archiver may have written into it since the listing.
            debug!(path = %dir.display(), error = %e, "Failed to remove directory");
            false
        }
    }
}
