use super::{ChangeSource, RecordStore, SourceSignal, StoreChange, StoreError};
use crate::config::DatabaseConfig;
use crate::photo::{BlobRef, NewPhotoRecord, PhotoId, PhotoRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Channel the `photos` trigger notifies on
pub const CHANGE_CHANNEL: &str = "photo_changes";

const SELECT_COLUMNS: &str = "id, seq, blob_path, original_filename, size_bytes, \
                              content_type, uploader_label, uploaded_at";

/// Row as stored in the `photos` table
#[derive(Debug, FromRow)]
struct PhotoRow {
    id: Uuid,
    seq: i64,
    blob_path: String,
    original_filename: String,
    size_bytes: i64,
    content_type: String,
    uploader_label: Option<String>,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<PhotoRow> for PhotoRecord {
    type Error = StoreError;

    fn try_from(row: PhotoRow) -> Result<Self, Self::Error> {
        let content_type = row
            .content_type
            .parse()
            .map_err(|v| StoreError::Serialization(format!("unknown content type {v}")))?;
        let size_bytes = u64::try_from(row.size_bytes)
            .map_err(|_| StoreError::Serialization(format!("negative size {}", row.size_bytes)))?;

        Ok(PhotoRecord {
            id: PhotoId::from_uuid(row.id),
            blob_ref: BlobRef::new(row.blob_path),
            original_filename: row.original_filename,
            size_bytes,
            content_type,
            uploader_label: row.uploader_label,
            uploaded_at: row.uploaded_at,
            seq: row.seq,
        })
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Connection(e.to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn into_records(rows: Vec<PhotoRow>) -> Result<Vec<PhotoRecord>, StoreError> {
    rows.into_iter().map(PhotoRecord::try_from).collect()
}

/// Photo records in PostgreSQL, with change notifications over LISTEN/NOTIFY
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn list(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PhotoRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM photos ORDER BY uploaded_at DESC, seq DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_records(rows)
    }

    async fn get(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM photos WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(PhotoRecord::try_from).transpose()
    }

    #[instrument(skip(self, record), fields(photo_id = %record.id))]
    async fn insert(&self, record: NewPhotoRecord) -> Result<PhotoRecord, StoreError> {
        let size_bytes = i64::try_from(record.size_bytes)
            .map_err(|_| StoreError::Backend(format!("size {} out of range", record.size_bytes)))?;

        // uploaded_at never goes backwards, even across a clock step
        let row = sqlx::query_as::<_, PhotoRow>(&format!(
            r#"
            INSERT INTO photos (
                id, blob_path, original_filename, size_bytes,
                content_type, uploader_label, uploaded_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                GREATEST(clock_timestamp(), (SELECT MAX(uploaded_at) FROM photos))
            )
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(record.id.as_uuid())
        .bind(record.blob_ref.as_str())
        .bind(&record.original_filename)
        .bind(size_bytes)
        .bind(record.content_type.as_str())
        .bind(&record.uploader_label)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let record = PhotoRecord::try_from(row)?;
        debug!(seq = record.seq, blob_ref = %record.blob_ref, "Photo record inserted");
        Ok(record)
    }

    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM photos WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM photos")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        info!(deleted_count = result.rows_affected(), "Deleted all photo records");
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM photos")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(count.0.max(0) as u64)
    }

    async fn oldest(&self) -> Result<Option<PhotoRecord>, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM photos ORDER BY uploaded_at ASC, seq ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(PhotoRecord::try_from).transpose()
    }

    async fn subscribe(&self) -> Result<Option<Box<dyn ChangeSource>>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(db_error)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(db_error)?;

        info!(channel = CHANGE_CHANNEL, "Listening for photo changes");
        Ok(Some(Box::new(PgChangeSource { listener })))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

struct PgChangeSource {
    listener: PgListener,
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn next(&mut self) -> Result<SourceSignal, StoreError> {
        match self.listener.try_recv().await {
            Ok(Some(notification)) => parse_notification(notification.payload()),
            // The listener reconnected; anything sent meanwhile is lost
            Ok(None) => {
                warn!("Change listener reconnected, notifications may have been missed");
                Ok(SourceSignal::Gap)
            }
            Err(e) => Err(StoreError::Connection(e.to_string())),
        }
    }
}

/// Parse a trigger payload such as `{"type":"inserted","id":"..."}`
fn parse_notification(payload: &str) -> Result<SourceSignal, StoreError> {
    match serde_json::from_str::<StoreChange>(payload) {
        Ok(change) => Ok(SourceSignal::Change(change)),
        Err(e) => {
            // Unparseable payloads are treated as lost changes
            warn!(error = %e, payload, "Unreadable change notification");
            Ok(SourceSignal::Gap)
        }
    }
}
