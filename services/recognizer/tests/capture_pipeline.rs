//! End-to-end tests for capture processing against a real SQLite store and a
//! temporary directory tree.

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use plate_recognizer::config::Config;
use plate_recognizer::detector::encode_jpeg;
use plate_recognizer::{
    CaptureEvent, CaptureOutcome, CaptureProcessor, CaptureWatcher, CommandRecognizer,
    ContourPlateDetector, DetectError, LatestSnapshot, PlateDetector, PlateResult, QueryService,
    RecordStore, TextRecognizer, WatchError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Returns the same answer for every image and counts calls.
struct FixedDetector {
    plate: Option<&'static str>,
    calls: AtomicUsize,
}

impl FixedDetector {
    fn new(plate: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            plate,
            calls: AtomicUsize::new(0),
        })
    }
}

impl PlateDetector for FixedDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Option<PlateResult>, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plate.map(|text| PlateResult {
            text: text.to_string(),
            region: Rect::at(4, 4).of_size(20, 10),
        }))
    }
}

/// Panics on every image, like a detector hitting a bug deep inside a
/// native library.
struct PanickingDetector;

impl PlateDetector for PanickingDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Option<PlateResult>, DetectError> {
        panic!("contour buffer overrun");
    }
}

/// OCR stand-in that reads the same text from every crop.
struct FixedText(&'static str);

impl TextRecognizer for FixedText {
    fn recognize(&self, _crop: &GrayImage) -> Result<Option<String>, DetectError> {
        Ok(Some(self.0.to_string()))
    }
}

/// A bright plate with dark glyph strokes on a dark backdrop.
fn plate_scene() -> RgbImage {
    let mut img = RgbImage::from_pixel(400, 300, Rgb([30, 30, 30]));
    draw_filled_rect_mut(&mut img, Rect::at(60, 110).of_size(280, 80), Rgb([230, 230, 230]));
    for x in [90, 130, 170, 210, 250, 290] {
        draw_filled_rect_mut(&mut img, Rect::at(x, 130).of_size(8, 40), Rgb([40, 40, 40]));
    }
    img
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

struct Harness {
    dir: TempDir,
    config: Config,
    store: Arc<RecordStore>,
    snapshot: Arc<LatestSnapshot>,
    processor: Arc<CaptureProcessor>,
}

impl Harness {
    async fn new(detector: Arc<dyn PlateDetector>) -> Self {
        Self::with_config(detector, |_| {}).await
    }

    async fn with_config(
        detector: Arc<dyn PlateDetector>,
        customize: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut config = Config::default();
        config.watcher.drop_dir = root.join("capture");
        config.watcher.stability_timeout_ms = 500;
        config.watcher.stability_poll_ms = 20;
        config.archive.root = root.join("static/archive");
        config.archive.public_root = root.join("static");
        config.archive.audit_log = root.join("license_plates.txt");
        config.database.url = format!("sqlite://{}", root.join("plates.db").display());
        customize(&mut config);
        config.validate().unwrap();

        std::fs::create_dir_all(&config.watcher.drop_dir).unwrap();

        let store = Arc::new(RecordStore::new(&config.database).await.unwrap());
        store.run_migrations().await.unwrap();

        let snapshot = Arc::new(LatestSnapshot::new());
        let processor = Arc::new(CaptureProcessor::new(
            &config,
            detector,
            snapshot.clone(),
            store.clone(),
        ));

        Self {
            dir,
            config,
            store,
            snapshot,
            processor,
        }
    }

    fn drop_path(&self, name: &str) -> PathBuf {
        self.config.watcher.drop_dir.join(name)
    }

    fn drop_image(&self, name: &str) -> PathBuf {
        let path = self.drop_path(name);
        RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]))
            .save(&path)
            .unwrap();
        path
    }

    /// Write an image next to the drop directory and rename it in, so the
    /// watcher never sees a half-written file.
    fn move_in_image(&self, name: &str) -> PathBuf {
        let staged = self.dir.path().join(name);
        RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]))
            .save(&staged)
            .unwrap();
        let path = self.drop_path(name);
        std::fs::rename(&staged, &path).unwrap();
        path
    }

    async fn process(&self, path: &Path) -> CaptureOutcome {
        self.processor.process(CaptureEvent::new(path)).await
    }
}

fn archived_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

#[tokio::test]
async fn recognized_capture_is_archived_recorded_and_removed() {
    let harness = Harness::new(FixedDetector::new(Some("AB123CD"))).await;
    let path = harness.drop_image("cam1.jpg");

    let outcome = harness.process(&path).await;

    let record_id = match outcome {
        CaptureOutcome::Recognized { record_id, plate } => {
            assert_eq!(plate, "AB123CD");
            record_id
        }
        other => panic!("unexpected outcome: {other:?}"),
    };

    assert!(!path.exists(), "drop file must be removed");

    let latest = harness.store.latest().await.unwrap().unwrap();
    assert_eq!(latest.id, record_id);
    assert_eq!(latest.plate, "AB123CD");
    assert!(latest.image_path.exists());
    assert!(latest.image_path.starts_with(&harness.config.archive.root));
    assert!(latest
        .image_path
        .to_string_lossy()
        .ends_with("_AB123CD.jpeg"));

    let archived = archived_files(&harness.config.archive.root);
    assert_eq!(archived, vec![latest.image_path.clone()]);
    image::open(&archived[0]).expect("archived image is a valid JPEG");

    let audit = std::fs::read_to_string(&harness.config.archive.audit_log).unwrap();
    assert_eq!(audit.lines().count(), 1);
    assert!(audit.ends_with(",AB123CD\n"));

    let snapshot = harness.snapshot.get().unwrap();
    assert_eq!(snapshot.plate, "AB123CD");
    assert!(!snapshot.jpeg.is_empty());
}

#[tokio::test]
async fn query_service_presents_relative_paths() {
    let harness = Harness::new(FixedDetector::new(Some("XY987"))).await;
    let path = harness.drop_image("cam1.jpeg");
    harness.process(&path).await;

    let query = QueryService::new(
        harness.store.clone(),
        harness.snapshot.clone(),
        &harness.config.archive.public_root,
    );

    let view = query.latest().await.unwrap().unwrap();
    assert_eq!(view.plate, "XY987");
    assert!(view.image_path.starts_with("archive/"), "{}", view.image_path);
    assert_eq!(query.latest_plate().as_deref(), Some("XY987"));

    assert_eq!(query.delete_all().await.unwrap(), 1);
    assert!(query.latest().await.unwrap().is_none());
    assert!(query.recent(10).await.unwrap().is_empty());
    assert!(query.snapshot().is_none());
}

#[tokio::test]
async fn unrecognized_capture_is_removed_without_record() {
    let harness = Harness::new(FixedDetector::new(None)).await;
    let path = harness.drop_image("cam1.jpg");

    let outcome = harness.process(&path).await;

    assert_eq!(outcome, CaptureOutcome::NotRecognized);
    assert!(!path.exists());
    assert_eq!(harness.store.count().await.unwrap(), 0);
    assert!(archived_files(&harness.config.archive.root).is_empty());
    assert!(harness.snapshot.get().is_none());
    assert!(!harness.config.archive.audit_log.exists());
}

#[tokio::test]
async fn uniform_image_yields_no_plate() {
    let detector = ContourPlateDetector::new(
        &Config::default().detector,
        Box::new(CommandRecognizer::new(&Config::default().detector.ocr)),
    );
    let harness = Harness::new(Arc::new(detector)).await;
    let path = harness.drop_path("gray.jpg");
    RgbImage::from_pixel(500, 300, Rgb([127, 127, 127]))
        .save(&path)
        .unwrap();

    let outcome = harness.process(&path).await;

    assert_eq!(outcome, CaptureOutcome::NotRecognized);
    assert!(!path.exists());
    assert_eq!(harness.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn corrupt_image_is_removed_without_detection() {
    let detector = FixedDetector::new(Some("AB123CD"));
    let harness = Harness::new(detector.clone()).await;
    let path = harness.drop_path("broken.jpg");
    std::fs::write(&path, b"definitely not a jpeg").unwrap();

    let outcome = harness.process(&path).await;

    assert_eq!(outcome, CaptureOutcome::LoadFailed { missing: false });
    assert!(!path.exists());
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn vanished_capture_is_reported_missing() {
    let detector = FixedDetector::new(Some("AB123CD"));
    let harness = Harness::new(detector.clone()).await;

    let outcome = harness.process(&harness.drop_path("gone.jpg")).await;

    assert_eq!(outcome, CaptureOutcome::LoadFailed { missing: true });
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_image_files_are_left_alone() {
    let detector = FixedDetector::new(Some("AB123CD"));
    let harness = Harness::new(detector.clone()).await;

    for name in ["notes.txt", "frame.png", "noext"] {
        let path = harness.drop_path(name);
        std::fs::write(&path, b"payload").unwrap();

        assert_eq!(harness.process(&path).await, CaptureOutcome::Ignored);
        assert!(path.exists(), "{name} must not be deleted");
    }
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn extension_match_is_case_insensitive() {
    let harness = Harness::new(FixedDetector::new(None)).await;
    assert!(harness.processor.accepts(Path::new("a/B.JPG")));
    assert!(harness.processor.accepts(Path::new("a/b.Jpeg")));
    assert!(!harness.processor.accepts(Path::new("a/b.jpg.txt")));
}

#[tokio::test]
async fn startup_scan_lists_only_images() {
    let harness = Harness::new(FixedDetector::new(None)).await;
    harness.drop_image("b.jpg");
    harness.drop_image("a.jpeg");
    std::fs::write(harness.drop_path("c.txt"), b"x").unwrap();
    std::fs::create_dir(harness.drop_path("nested.jpg")).unwrap();

    let watcher = CaptureWatcher::new(&harness.config.watcher, harness.processor.clone());
    let pending = watcher.scan_existing().await.unwrap();

    assert_eq!(
        pending,
        vec![harness.drop_path("a.jpeg"), harness.drop_path("b.jpg")]
    );
}

#[tokio::test]
async fn watch_session_drains_files_present_at_start() {
    let harness = Harness::new(FixedDetector::new(Some("AB123CD"))).await;
    let first = harness.drop_image("first.jpg");
    let second = harness.drop_image("second.jpg");

    let watcher = Arc::new(CaptureWatcher::new(
        &harness.config.watcher,
        harness.processor.clone(),
    ));
    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        async move { watcher.watch_session(cancel).await }
    });

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while first.exists() || second.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    cancel.cancel();

    assert!(drained.is_ok(), "files were not processed in time");
    assert!(session.await.unwrap().is_ok());
    assert_eq!(harness.store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn watch_session_requires_drop_directory() {
    let harness = Harness::new(FixedDetector::new(None)).await;
    let mut watcher_config = harness.config.watcher.clone();
    watcher_config.drop_dir = harness.dir.path().join("missing");

    let watcher = CaptureWatcher::new(&watcher_config, harness.processor.clone());
    let result = watcher.watch_session(CancellationToken::new()).await;

    assert!(matches!(result, Err(WatchError::DirectoryMissing(_))));
}

#[tokio::test]
async fn plate_scene_is_read_by_contour_detector() {
    let detector = ContourPlateDetector::new(
        &Config::default().detector,
        Box::new(FixedText("AB 123-CD")),
    );
    let harness = Harness::new(Arc::new(detector)).await;
    let path = harness.drop_path("plate.jpg");
    std::fs::write(&path, encode_jpeg(&plate_scene(), 95).unwrap()).unwrap();

    let outcome = harness.process(&path).await;

    match outcome {
        CaptureOutcome::Recognized { plate, .. } => assert_eq!(plate, "AB123CD"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!path.exists());
    assert_eq!(harness.store.count().await.unwrap(), 1);

    let latest = harness.store.latest().await.unwrap().unwrap();
    let archived = image::open(&latest.image_path).unwrap().to_rgb8();
    assert_eq!(archived.dimensions(), (400, 300));
}

#[tokio::test]
async fn archive_failure_leaves_no_record() {
    let harness = Harness::with_config(FixedDetector::new(Some("AB123CD")), |config| {
        // A regular file where the archive directory should be.
        let blocker = config.archive.public_root.with_file_name("archive-blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        config.archive.root = blocker;
    })
    .await;
    let path = harness.drop_image("cam1.jpg");

    let outcome = harness.process(&path).await;

    assert_eq!(
        outcome,
        CaptureOutcome::PersistFailed {
            plate: "AB123CD".to_string()
        }
    );
    assert!(!path.exists(), "drop file must be removed");
    assert_eq!(harness.store.count().await.unwrap(), 0);
    assert!(!harness.config.archive.audit_log.exists());
}

#[tokio::test]
async fn detector_panic_is_contained() {
    let harness = Harness::new(Arc::new(PanickingDetector)).await;
    let first = harness.drop_image("first.jpg");
    let second = harness.drop_image("second.jpg");

    assert_eq!(harness.process(&first).await, CaptureOutcome::NotRecognized);
    assert_eq!(harness.process(&second).await, CaptureOutcome::NotRecognized);

    assert!(!first.exists());
    assert!(!second.exists());
    assert_eq!(harness.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn watch_session_processes_files_arriving_later() {
    let harness = Harness::new(FixedDetector::new(Some("AB123CD"))).await;

    let watcher = Arc::new(CaptureWatcher::new(
        &harness.config.watcher,
        harness.processor.clone(),
    ));
    let cancel = CancellationToken::new();
    let session = tokio::spawn({
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        async move { watcher.watch_session(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let notes = harness.drop_path("notes.txt");
    std::fs::write(&notes, b"shift log").unwrap();
    let image = harness.move_in_image("late.jpg");

    // The capture is removed only after its record is written.
    let processed = wait_until(|| !image.exists()).await;
    cancel.cancel();

    assert!(processed, "image was not picked up from a live event");
    assert!(session.await.unwrap().is_ok());
    assert_eq!(harness.store.count().await.unwrap(), 1);
    assert!(notes.exists());
}

#[tokio::test]
async fn watcher_recovers_after_drop_directory_is_recreated() {
    let harness = Harness::with_config(FixedDetector::new(Some("AB123CD")), |config| {
        config.watcher.restart_backoff_secs = 1;
    })
    .await;

    let watcher = CaptureWatcher::new(&harness.config.watcher, harness.processor.clone());
    let cancel = CancellationToken::new();
    let running = tokio::spawn(watcher.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let drop_dir = harness.config.watcher.drop_dir.clone();
    std::fs::remove_dir_all(&drop_dir).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::create_dir(&drop_dir).unwrap();
    let image = harness.move_in_image("after.jpg");

    let processed = wait_until(|| !image.exists()).await;
    cancel.cancel();
    running.await.unwrap();

    assert!(processed, "watcher did not resume on the new directory");
    assert_eq!(harness.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn unreadable_label_font_still_records_plate() {
    let harness = Harness::with_config(FixedDetector::new(Some("AB123CD")), |config| {
        let font = config.archive.public_root.with_file_name("label.ttf");
        std::fs::write(&font, b"not a font").unwrap();
        config.detector.label_font = Some(font);
    })
    .await;
    let path = harness.drop_image("cam1.jpg");

    let outcome = harness.process(&path).await;

    assert!(matches!(outcome, CaptureOutcome::Recognized { .. }));
    assert_eq!(harness.store.count().await.unwrap(), 1);
}
