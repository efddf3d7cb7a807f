use crate::record_store::{PlateRecord, RecordId, RecordStore, StoreError};
use crate::snapshot::{LatestSnapshot, Snapshot};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// A plate record as presented to API consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateView {
    pub id: RecordId,
    pub plate: String,
    /// ISO-8601 local time
    pub recognized_at: DateTime<Local>,
    /// Path relative to the public static root. The file may have been
    /// removed by retention.
    pub image_path: String,
}

/// Read-side accessors over the record store and the live snapshot
pub struct QueryService {
    store: Arc<RecordStore>,
    snapshot: Arc<LatestSnapshot>,
    public_root: PathBuf,
}

impl QueryService {
    pub fn new(
        store: Arc<RecordStore>,
        snapshot: Arc<LatestSnapshot>,
        public_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            snapshot,
            public_root: public_root.into(),
        }
    }

    /// Newest first, at most `limit` records
    pub async fn recent(&self, limit: u32) -> Result<Vec<PlateView>, StoreError> {
        let records = self.store.recent(limit).await?;
        Ok(records.into_iter().map(|r| self.view(r)).collect())
    }

    pub async fn latest(&self) -> Result<Option<PlateView>, StoreError> {
        Ok(self.store.latest().await?.map(|r| self.view(r)))
    }

    /// Delete every record and forget the live snapshot
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        let deleted = self.store.delete_all().await?;
        self.snapshot.clear();
        info!(deleted, "Records reset");
        Ok(deleted)
    }

    /// Plate text of the most recent recognition since startup
    pub fn latest_plate(&self) -> Option<String> {
        self.snapshot.plate()
    }

    /// Annotated image of the most recent recognition since startup
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.get()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn view(&self, record: PlateRecord) -> PlateView {
        PlateView {
            id: record.id,
            plate: record.plate,
            recognized_at: record.recognized_at.with_timezone(&Local),
            image_path: public_path(&self.public_root, &record.image_path),
        }
    }
}

/// `path` relative to `public_root` with forward slashes, or the stored path
/// unchanged when it lies outside the public root.
fn public_path(public_root: &Path, path: &Path) -> String {
    match path.strip_prefix(public_root) {
        Ok(relative) => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
