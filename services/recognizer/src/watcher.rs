//! Drop directory watcher.
//!
//! Filesystem notifications are forwarded from the `notify` callback thread
//! into a bounded channel and consumed by a single worker, so at most one
//! capture is being detected at any time. A watch session ends on any
//! notification failure and is restarted by the supervisor after a fixed
//! backoff.

use crate::config::WatcherConfig;
use crate::pipeline::{CaptureEvent, CaptureOutcome, CaptureProcessor};
use crate::supervisor::{supervise, RestartPolicy};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Reasons a watch session ends
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Notification error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Drop directory {0} does not exist")]
    DirectoryMissing(PathBuf),

    #[error("Drop directory {0} was removed")]
    DirectoryRemoved(PathBuf),

    #[error("Failed to scan drop directory: {0}")]
    Scan(#[from] std::io::Error),

    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Watches the drop directory and feeds captures to a [`CaptureProcessor`]
pub struct CaptureWatcher {
    drop_dir: PathBuf,
    queue_size: usize,
    restart_backoff: Duration,
    processor: Arc<CaptureProcessor>,
}

impl CaptureWatcher {
    pub fn new(config: &WatcherConfig, processor: Arc<CaptureProcessor>) -> Self {
        Self {
            drop_dir: config.drop_dir.clone(),
            queue_size: config.queue_size.max(1),
            restart_backoff: config.restart_backoff(),
            processor,
        }
    }

    pub fn drop_dir(&self) -> &Path {
        &self.drop_dir
    }

    /// Keep a watch session alive until cancelled, restarting it after every
    /// failure.
    pub async fn run(self, cancel: CancellationToken) {
        let watcher = &self;
        let session_cancel = cancel.clone();
        supervise(
            "watcher",
            RestartPolicy::fixed(self.restart_backoff),
            cancel,
            move || watcher.watch_session(session_cancel.clone()),
        )
        .await;
    }

    /// Accepted image files already present in the drop directory, oldest
    /// name first.
    pub async fn scan_existing(&self) -> Result<Vec<PathBuf>, WatchError> {
        let mut entries = tokio::fs::read_dir(&self.drop_dir).await?;
        let mut paths = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && self.processor.accepts(&path) {
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// One watch session: establish the watch, process files that arrived
    /// while no watch was active, then handle events until cancelled or the
    /// watch fails.
    pub async fn watch_session(&self, cancel: CancellationToken) -> Result<(), WatchError> {
        match tokio::fs::metadata(&self.drop_dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(WatchError::DirectoryMissing(self.drop_dir.clone())),
        }

        let (tx, mut rx) = mpsc::channel(self.queue_size);

        // The callback runs on notify's own thread, outside the runtime.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&self.drop_dir, RecursiveMode::NonRecursive)?;

        info!(drop_dir = %self.drop_dir.display(), "Watching drop directory");

        let pending = self.scan_existing().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Processing files already in drop directory");
        }
        for path in pending {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.dispatch(path).await;
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };

            match event {
                Some(Ok(event)) => self.handle_event(event).await?,
                Some(Err(e)) => return Err(WatchError::Notify(e)),
                None => return Err(WatchError::ChannelClosed),
            }
        }
    }

    async fn handle_event(&self, event: Event) -> Result<(), WatchError> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    if self.processor.accepts(&path) {
                        self.dispatch(path).await;
                    } else {
                        trace!(path = %path.display(), "Ignoring event for non-image path");
                    }
                }
            }
            EventKind::Remove(_) => {
                let removed_self = event.paths.iter().any(|p| p == &self.drop_dir);
                let still_dir = tokio::fs::metadata(&self.drop_dir)
                    .await
                    .map(|meta| meta.is_dir())
                    .unwrap_or(false);
                if removed_self || !still_dir {
                    return Err(WatchError::DirectoryRemoved(self.drop_dir.clone()));
                }
            }
            _ => {}
        }

        Ok(())
    }

    async fn dispatch(&self, path: PathBuf) -> CaptureOutcome {
        let outcome = self.processor.process(CaptureEvent::new(path)).await;
        match &outcome {
            CaptureOutcome::LoadFailed { missing: true } => {
                debug!("Event for a capture file that is already gone")
            }
            CaptureOutcome::PersistFailed { plate } => {
                warn!(plate = %plate, "Recognized plate was not persisted")
            }
            _ => trace!(outcome = ?outcome, "Capture processed"),
        }
        outcome
    }
}
