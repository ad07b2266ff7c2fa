use crate::feed::{ChangeEvent, ChangeFeed};
use crate::photo::{
    blob_path, ContentType, NewPhotoRecord, PhotoId, PhotoRecord, MAX_PHOTO_BYTES,
    MIN_PHOTO_BYTES,
};
use crate::retention::RetentionManager;
use crate::store::{Backend, StoreError};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

/// Why an upload was refused
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("photo is {size} bytes, the limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("photo is {size} bytes, the minimum is {min}")]
    TooSmall { size: u64, min: u64 },

    #[error("declared size {declared} does not match the {actual} bytes received")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("storage failure: {0}")]
    StorageFailure(#[source] StoreError),
}

impl IngestError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::TooSmall { .. } => "TOO_SMALL",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }

    /// Validation errors are the uploader's fault and have no side effects
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::StorageFailure(_))
    }
}

/// An upload as received from a guest
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub data: Bytes,
    /// MIME type as declared by the client
    pub content_type: String,
    /// Size as declared by the client
    pub size_bytes: u64,
    pub filename: String,
    pub uploader_label: Option<String>,
}

impl PhotoUpload {
    /// An upload whose declared size is the length of `data`
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>, filename: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            size_bytes: data.len() as u64,
            data,
            content_type: content_type.into(),
            filename: filename.into(),
            uploader_label: None,
        }
    }

    pub fn with_uploader(mut self, label: impl Into<String>) -> Self {
        self.uploader_label = Some(label.into());
        self
    }

    pub fn with_declared_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// Check an upload without touching any store
pub fn validate(upload: &PhotoUpload) -> Result<ContentType, IngestError> {
    let content_type = ContentType::from_mime(&upload.content_type)
        .ok_or_else(|| IngestError::UnsupportedType(upload.content_type.clone()))?;

    if upload.size_bytes > MAX_PHOTO_BYTES {
        return Err(IngestError::TooLarge {
            size: upload.size_bytes,
            max: MAX_PHOTO_BYTES,
        });
    }
    if upload.size_bytes < MIN_PHOTO_BYTES {
        return Err(IngestError::TooSmall {
            size: upload.size_bytes,
            min: MIN_PHOTO_BYTES,
        });
    }

    let actual = upload.data.len() as u64;
    if actual != upload.size_bytes {
        return Err(IngestError::SizeMismatch {
            declared: upload.size_bytes,
            actual,
        });
    }

    Ok(content_type)
}

fn normalize_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Validates uploads and turns them into stored photos
#[derive(Clone)]
pub struct IngestGateway {
    backend: Backend,
    feed: Arc<ChangeFeed>,
    retention: RetentionManager,
    uploads: Arc<Semaphore>,
}

impl IngestGateway {
    pub fn new(
        backend: Backend,
        feed: Arc<ChangeFeed>,
        retention: RetentionManager,
        upload_concurrency: usize,
    ) -> Self {
        Self {
            backend,
            feed,
            retention,
            uploads: Arc::new(Semaphore::new(upload_concurrency.max(1))),
        }
    }

    /// Validate and persist an upload.
    ///
    /// On success the record exists, the retention cap holds again and an
    /// `inserted` event has been published. On failure nothing is left behind.
    #[instrument(skip(self, upload), fields(filename = %upload.filename, size_bytes = upload.size_bytes))]
    pub async fn ingest(&self, upload: PhotoUpload) -> Result<PhotoRecord, IngestError> {
        let content_type = match validate(&upload) {
            Ok(content_type) => content_type,
            Err(e) => {
                debug!(error = %e, "Rejected upload");
                metrics::counter!("wall.ingest.rejected", "reason" => e.code()).increment(1);
                return Err(e);
            }
        };

        let id = PhotoId::new();
        let path = blob_path(id, content_type, Utc::now());

        let blob_ref = {
            let _permit = self.uploads.acquire().await.map_err(|_| {
                IngestError::StorageFailure(StoreError::Backend("upload limiter closed".to_string()))
            })?;

            let started = Instant::now();
            let blob_ref = self
                .backend
                .blobs
                .put(&path, upload.data, content_type)
                .await
                .map_err(|e| {
                    error!(photo_id = %id, error = %e, "Failed to store photo bytes");
                    metrics::counter!("wall.ingest.failed", "stage" => "blob").increment(1);
                    IngestError::StorageFailure(e)
                })?;
            metrics::histogram!("wall.upload.duration_seconds")
                .record(started.elapsed().as_secs_f64());
            blob_ref
        };

        let new_record = NewPhotoRecord {
            id,
            blob_ref: blob_ref.clone(),
            original_filename: upload.filename,
            size_bytes: upload.size_bytes,
            content_type,
            uploader_label: normalize_label(upload.uploader_label),
        };

        let gate = self.feed.order_gate().await;
        let record = match self.backend.records.insert(new_record).await {
            Ok(record) => record,
            Err(e) => {
                drop(gate);
                // Don't leave bytes nobody references
                if let Err(cleanup) = self.backend.blobs.delete(&blob_ref).await {
                    error!(
                        photo_id = %id,
                        blob_ref = %blob_ref,
                        error = %cleanup,
                        "Failed to remove blob after record insert failed"
                    );
                }
                error!(photo_id = %id, error = %e, "Failed to insert photo record");
                metrics::counter!("wall.ingest.failed", "stage" => "record").increment(1);
                return Err(IngestError::StorageFailure(e));
            }
        };

        self.retention.enforce().await;
        self.feed.publish(ChangeEvent::Inserted {
            record: record.clone(),
        });
        drop(gate);

        metrics::counter!("wall.photos.ingested").increment(1);
        metrics::counter!("wall.photos.ingested_bytes").increment(record.size_bytes);
        info!(
            photo_id = %record.id,
            content_type = %record.content_type,
            seq = record.seq,
            "Photo ingested"
        );

        Ok(record)
    }
}
