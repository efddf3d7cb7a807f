use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Store-assigned record identifier; increases with every insert
pub type RecordId = i64;

/// Errors raised by the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Stored timestamp out of range: {0}")]
    Timestamp(i64),
}

/// A recognized plate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateRecord {
    /// Unique record ID
    pub id: RecordId,
    /// Plate text (letters and digits)
    pub plate: String,
    /// Recognition instant
    pub recognized_at: DateTime<Utc>,
    /// Archived annotated image; may have been removed by retention since
    pub image_path: PathBuf,
}

#[derive(FromRow)]
struct PlateRow {
    id: i64,
    plate: String,
    recognized_at_us: i64,
    image_path: String,
}

impl TryFrom<PlateRow> for PlateRecord {
    type Error = StoreError;

    fn try_from(row: PlateRow) -> Result<Self, Self::Error> {
        let recognized_at = DateTime::from_timestamp_micros(row.recognized_at_us)
            .ok_or(StoreError::Timestamp(row.recognized_at_us))?;

        Ok(Self {
            id: row.id,
            plate: row.plate,
            recognized_at,
            image_path: PathBuf::from(row.image_path),
        })
    }
}

/// Append-only store of recognized plates in SQLite
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Open (creating if needed) the database and build a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.connect_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a record; a single statement, so readers never see it half written
    #[instrument(skip(self, image_path), fields(image_path = %image_path.display()))]
    pub async fn append(
        &self,
        plate: &str,
        image_path: &Path,
        recognized_at: DateTime<Utc>,
    ) -> Result<RecordId, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO plates (plate, recognized_at_us, image_path)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(plate)
        .bind(recognized_at.timestamp_micros())
        .bind(image_path.to_string_lossy().into_owned())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();

        debug!(id, plate = %plate, "Plate record appended");
        metrics::counter!("records.appended").increment(1);

        Ok(id)
    }

    /// Most recent records first, at most `limit` of them
    pub async fn recent(&self, limit: u32) -> Result<Vec<PlateRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, PlateRow>(
            r#"
            SELECT id, plate, recognized_at_us, image_path
            FROM plates
            ORDER BY recognized_at_us DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PlateRecord::try_from).collect()
    }

    /// The most recent record, if any
    pub async fn latest(&self) -> Result<Option<PlateRecord>, StoreError> {
        Ok(self.recent(1).await?.into_iter().next())
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plates")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Remove every record (administrative reset)
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM plates")
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(deleted_count = deleted, "Deleted all plate records");

        Ok(deleted)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
