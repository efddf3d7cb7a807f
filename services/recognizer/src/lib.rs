//! Platewatch Plate Recognizer
//!
//! Licence plate recognition service for a single capture host. An external
//! camera process drops JPEG images into a watched directory; every image is
//! checked for a plate-shaped region, the region is read with OCR, and
//! recognized plates are archived, recorded in SQLite and exposed through a
//! small HTTP API. A background sweep evicts archived images after the
//! retention window.
//!
//! ## Features
//!
//! - **Serialized capture processing**: one worker drains filesystem
//!   notifications, so at most one detection runs at a time
//! - **File stability gate**: images still being written are polled until
//!   their size settles
//! - **Date/hour partitioned archive**: annotated images stored under
//!   `archive/{date}/{hour}/`
//! - **Supervised loops**: the watcher and the retention sweep restart after
//!   failures instead of exiting
//!
//! ## Architecture
//!
//! ```text
//! Drop directory            Archive tree              SQLite
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ *.jpg        │          │ archive/     │          │ plates       │
//! │ *.jpeg       │          │   {date}/    │          └──────────────┘
//! └──────────────┘          │   {hour}/    │                 ▲
//!        │                  └──────────────┘                 │
//!        ▼                     ▲        ▲                    │
//! ┌──────────────┐             │        │             ┌──────────────┐
//! │ Capture      │             │        └─────────────│ Retention    │
//! │ Watcher      │             │                      │ Sweeper      │
//! └──────────────┘             │                      └──────────────┘
//!        │ mpsc                │                             │
//!        ▼                     │                             │
//! ┌──────────────┐      ┌──────────────┐          ┌──────────────┐
//! │ Stability    │─────▶│ Plate        │─────────▶│ Record       │
//! │ Gate         │      │ Detector     │          │ Store        │
//! └──────────────┘      └──────────────┘          └──────────────┘
//!                              │                         │
//!                              ▼                         ▼
//!                       ┌──────────────┐          ┌──────────────┐
//!                       │ Latest       │─────────▶│ Query        │
//!                       │ Snapshot     │          │ API          │
//!                       └──────────────┘          └──────────────┘
//! ```

pub mod api;
pub mod archiver;
pub mod audit_log;
pub mod config;
pub mod detector;
pub mod ocr;
pub mod pipeline;
pub mod query;
pub mod record_store;
pub mod retention;
pub mod snapshot;
pub mod stability;
pub mod supervisor;
pub mod watcher;

pub use api::AppState;
pub use archiver::{ArchiveError, ImageArchiver};
pub use audit_log::AuditLog;
pub use config::Config;
pub use detector::{ContourPlateDetector, DetectError, PlateDetector, PlateResult};
pub use ocr::{build_recognizer, CommandRecognizer, TextRecognizer};
pub use pipeline::{CaptureEvent, CaptureOutcome, CaptureProcessor};
pub use query::{PlateView, QueryService};
pub use record_store::{PlateRecord, RecordId, RecordStore, StoreError};
pub use retention::{RetentionSweeper, SweepError, SweepReport};
pub use snapshot::{LatestSnapshot, Snapshot};
pub use stability::{is_stable, wait_for_stable, Stability};
pub use supervisor::{supervise, RestartPolicy};
pub use watcher::{CaptureWatcher, WatchError};
