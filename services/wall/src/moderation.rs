use crate::feed::{ChangeEvent, ChangeFeed};
use crate::photo::PhotoId;
use crate::store::{Backend, StoreError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Blob deletes in flight during clear-all
const CLEAR_CONCURRENCY: usize = 16;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
}

/// Result of deleting one photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing to do; already deleted counts as success
    AlreadyGone,
}

impl DeleteOutcome {
    pub fn deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Host-side removal of photos
#[derive(Clone)]
pub struct Moderator {
    backend: Backend,
    feed: Arc<ChangeFeed>,
}

impl Moderator {
    pub fn new(backend: Backend, feed: Arc<ChangeFeed>) -> Self {
        Self { backend, feed }
    }

    /// Delete one photo, blob first. If the blob cannot be deleted the record
    /// is kept so it never points at nothing.
    #[instrument(skip(self))]
    pub async fn delete_one(&self, id: PhotoId) -> Result<DeleteOutcome, ModerationError> {
        let Some(record) = self.backend.records.get(id).await? else {
            return Ok(DeleteOutcome::AlreadyGone);
        };

        if let Err(e) = self.backend.blobs.delete(&record.blob_ref).await {
            error!(blob_ref = %record.blob_ref, error = %e, "Failed to delete photo blob");
            return Err(e.into());
        }

        let _gate = self.feed.order_gate().await;
        if !self.backend.records.delete(id).await? {
            // Someone else got there between our get and delete
            return Ok(DeleteOutcome::AlreadyGone);
        }
        self.feed.publish(ChangeEvent::Deleted { id });

        metrics::counter!("wall.photos.deleted").increment(1);
        info!("Photo deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Remove every photo. Blob deletes are best effort; the records always
    /// go. Returns the number of records removed.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<u64, ModerationError> {
        // Held throughout so no upload lands between listing and wiping
        let _gate = self.feed.order_gate().await;
        let records = self.backend.records.list().await?;

        let blobs = self.backend.blobs.clone();
        let failures = stream::iter(records)
            .map(move |record| {
                let blobs = blobs.clone();
                async move {
                    blobs
                        .delete(&record.blob_ref)
                        .await
                        .map_err(|e| (record.blob_ref, e))
                }
            })
            .buffer_unordered(CLEAR_CONCURRENCY)
            .filter_map(|result| async move { result.err() })
            .collect::<Vec<_>>()
            .await;

        for (blob_ref, e) in &failures {
            warn!(blob_ref = %blob_ref, error = %e, "Failed to delete blob during clear");
        }

        let removed = self.backend.records.delete_all().await?;
        self.feed.publish(ChangeEvent::Cleared);

        metrics::counter!("wall.photos.deleted").increment(removed);
        info!(removed, blob_failures = failures.len(), "Cleared all photos");
        Ok(removed)
    }
}
