//! Per-file processing: stability gate, detection, archive, record, cleanup.

use crate::archiver::ImageArchiver;
use crate::audit_log::AuditLog;
use crate::config::Config;
use crate::detector::{
    annotate_plate, encode_jpeg, load_label_font, DetectError, PlateDetector, PlateResult,
};
use crate::record_store::{RecordId, RecordStore};
use crate::snapshot::{LatestSnapshot, Snapshot};
use crate::stability::{wait_for_stable, Stability};
use ab_glyph::FontArc;
use chrono::{DateTime, Local, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// A file observed in the drop directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEvent {
    pub path: PathBuf,
    pub detected_at: DateTime<Utc>,
}

impl CaptureEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Terminal state of one processed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A plate was read, archived and recorded
    Recognized { record_id: RecordId, plate: String },
    /// No plate found; nothing archived
    NotRecognized,
    /// A plate was read but archiving or recording it failed
    PersistFailed { plate: String },
    /// The file could not be loaded. `missing` means it was already gone
    LoadFailed { missing: bool },
    /// Not an accepted image file; left untouched
    Ignored,
}

enum Analysis {
    Undecodable(image::ImageError),
    Failed(DetectError),
    Panicked(String),
    Miss,
    Hit { plate: PlateResult, jpeg: Vec<u8> },
}

/// Drives one capture file through the pipeline
pub struct CaptureProcessor {
    extensions: Vec<String>,
    stability_timeout: Duration,
    stability_poll: Duration,
    detector: Arc<dyn PlateDetector>,
    snapshot: Arc<LatestSnapshot>,
    archiver: ImageArchiver,
    store: Arc<RecordStore>,
    audit_log: AuditLog,
    jpeg_quality: u8,
    label_font: Option<FontArc>,
}

impl CaptureProcessor {
    pub fn new(
        config: &Config,
        detector: Arc<dyn PlateDetector>,
        snapshot: Arc<LatestSnapshot>,
        store: Arc<RecordStore>,
    ) -> Self {
        Self {
            extensions: config
                .watcher
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            stability_timeout: config.watcher.stability_timeout(),
            stability_poll: config.watcher.stability_poll(),
            detector,
            snapshot,
            archiver: ImageArchiver::new(&config.archive.root),
            store,
            audit_log: AuditLog::new(&config.archive.audit_log),
            jpeg_quality: config.archive.jpeg_quality,
            label_font: config
                .detector
                .label_font
                .as_deref()
                .and_then(|path| match load_label_font(path) {
                    Ok(font) => Some(font),
                    Err(e) => {
                        warn!(error = %e, "Label font unusable, annotating without text");
                        None
                    }
                }),
        }
    }

    /// Whether `path` has one of the accepted image extensions
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|accepted| *accepted == ext)
            })
            .unwrap_or(false)
    }

    /// Process one capture file to a terminal state.
    #[instrument(skip(self, event), fields(path = %event.path.display()))]
    pub async fn process(&self, event: CaptureEvent) -> CaptureOutcome {
        let path = event.path.as_path();

        if !self.accepts(path) {
            debug!("Ignoring non-image file");
            metrics::counter!("captures.ignored").increment(1);
            return CaptureOutcome::Ignored;
        }

        match wait_for_stable(path, self.stability_timeout, self.stability_poll).await {
            Stability::Missing => return self.load_failed(path, true).await,
            Stability::TimedOut => debug!("Proceeding with a file that is still growing"),
            Stability::Stable => {}
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.load_failed(path, true).await,
            Err(e) => {
                warn!(error = %e, "Failed to read capture file");
                return self.load_failed(path, false).await;
            }
        };

        let outcome = match self.analyze(bytes).await {
            Analysis::Undecodable(e) => {
                warn!(error = %e, "Failed to decode capture file");
                return self.load_failed(path, false).await;
            }
            Analysis::Failed(e) => {
                warn!(error = %e, "Plate detection failed");
                metrics::counter!("captures.not_recognized").increment(1);
                CaptureOutcome::NotRecognized
            }
            Analysis::Panicked(message) => {
                error!(error = %message, "Plate detection panicked");
                metrics::counter!("captures.detector_panics").increment(1);
                CaptureOutcome::NotRecognized
            }
            Analysis::Miss => {
                debug!("No plate recognized");
                metrics::counter!("captures.not_recognized").increment(1);
                CaptureOutcome::NotRecognized
            }
            Analysis::Hit { plate, jpeg } => self.persist(plate, jpeg).await,
        };

        remove_capture(path).await;
        outcome
    }

    async fn analyze(&self, bytes: Vec<u8>) -> Analysis {
        let detector = Arc::clone(&self.detector);
        let quality = self.jpeg_quality;
        let font = self.label_font.clone();

        let task = tokio::task::spawn_blocking(move || {
            let image = match image::load_from_memory(&bytes) {
                Ok(image) => image,
                Err(e) => return Analysis::Undecodable(e),
            };

            let started = Instant::now();
            let result = detector.detect(&image);
            metrics::histogram!("detector.duration_seconds").record(started.elapsed().as_secs_f64());

            match result {
                Ok(Some(plate)) => {
                    let annotated = annotate_plate(&image, &plate, font.as_ref());
                    match encode_jpeg(&annotated, quality) {
                        Ok(jpeg) => Analysis::Hit { plate, jpeg },
                        Err(e) => Analysis::Failed(e),
                    }
                }
                Ok(None) => Analysis::Miss,
                Err(e) => Analysis::Failed(e),
            }
        });

        match task.await {
            Ok(analysis) => analysis,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Analysis::Panicked(message)
            }
            Err(e) => Analysis::Panicked(e.to_string()),
        }
    }

    async fn persist(&self, plate: PlateResult, jpeg: Vec<u8>) -> CaptureOutcome {
        let recognized_at = Utc::now();
        let text = plate.text;

        self.snapshot.update(Snapshot {
            plate: text.clone(),
            recognized_at,
            jpeg: jpeg.clone(),
        });

        let local = recognized_at.with_timezone(&Local);
        let image_path = match self.archiver.archive(&jpeg, &text, &local).await {
            Ok(path) => path,
            Err(e) => {
                error!(plate = %text, error = %e, "Failed to archive annotated image");
                metrics::counter!("captures.persist_failed").increment(1);
                return CaptureOutcome::PersistFailed { plate: text };
            }
        };

        // An archived image without a record is left for retention to age out.
        let record_id = match self.store.append(&text, &image_path, recognized_at).await {
            Ok(id) => id,
            Err(e) => {
                error!(plate = %text, error = %e, "Failed to store plate record");
                metrics::counter!("captures.persist_failed").increment(1);
                return CaptureOutcome::PersistFailed { plate: text };
            }
        };

        self.audit_log.append(recognized_at, &text).await;

        info!(plate = %text, record_id, image_path = %image_path.display(), "Plate recognized");
        metrics::counter!("captures.recognized").increment(1);

        CaptureOutcome::Recognized {
            record_id,
            plate: text,
        }
    }

    async fn load_failed(&self, path: &Path, missing: bool) -> CaptureOutcome {
        metrics::counter!("captures.load_failed").increment(1);

        if missing {
            debug!(path = %path.display(), "Capture file already gone");
        } else {
            remove_capture(path).await;
        }

        CaptureOutcome::LoadFailed { missing }
    }
}

async fn remove_capture(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed capture file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove capture file"),
    }
}
