use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// The most recent successful recognition, kept for live preview.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub plate: String,
    pub recognized_at: DateTime<Utc>,
    /// Annotated image, JPEG encoded
    pub jpeg: Vec<u8>,
}

/// Single-slot holder for the latest [`Snapshot`].
///
/// Writers replace the whole value behind an `Arc`, so readers observe either
/// the previous snapshot or the new one in full.
#[derive(Debug, Default)]
pub struct LatestSnapshot {
    slot: RwLock<Option<Arc<Snapshot>>>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: Snapshot) {
        *self.slot.write() = Some(Arc::new(snapshot));
    }

    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.slot.read().clone()
    }

    /// Plate text of the latest snapshot
    pub fn plate(&self) -> Option<String> {
        self.slot.read().as_ref().map(|s| s.plate.clone())
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}
