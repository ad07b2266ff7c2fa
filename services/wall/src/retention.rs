use crate::feed::{ChangeEvent, ChangeFeed};
use crate::store::Backend;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Keeps the live photo count at or below `max_photos` by evicting the oldest
#[derive(Clone)]
pub struct RetentionManager {
    backend: Backend,
    feed: Arc<ChangeFeed>,
    max_photos: u64,
}

impl RetentionManager {
    pub fn new(backend: Backend, feed: Arc<ChangeFeed>, max_photos: u64) -> Self {
        Self {
            backend,
            feed,
            max_photos,
        }
    }

    pub fn max_photos(&self) -> u64 {
        self.max_photos
    }

    /// Evict oldest photos until the count is within the cap.
    ///
    /// Never fails: a blob that cannot be deleted is logged and left behind,
    /// a record that cannot be deleted ends the pass until the next upload.
    /// The caller holds the feed's ordering gate.
    pub async fn enforce(&self) -> usize {
        let mut evicted = 0;

        loop {
            let count = match self.backend.records.count().await {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "Retention could not count photos");
                    break;
                }
            };
            if count <= self.max_photos {
                break;
            }

            let oldest = match self.backend.records.oldest().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Retention could not find the oldest photo");
                    break;
                }
            };

            if let Err(e) = self.backend.blobs.delete(&oldest.blob_ref).await {
                error!(
                    photo_id = %oldest.id,
                    blob_ref = %oldest.blob_ref,
                    error = %e,
                    "Failed to delete evicted blob"
                );
            }

            match self.backend.records.delete(oldest.id).await {
                // Another instance evicted it first; the count is re-read next
                Ok(false) => {
                    debug!(photo_id = %oldest.id, "Evicted photo was already gone");
                }
                Ok(true) => {
                    self.feed.publish(ChangeEvent::Deleted { id: oldest.id });
                    metrics::counter!("wall.photos.evicted").increment(1);
                    evicted += 1;
                }
                Err(e) => {
                    warn!(photo_id = %oldest.id, error = %e, "Failed to delete evicted record");
                    break;
                }
            }
        }

        if evicted > 0 {
            info!(evicted, max_photos = self.max_photos, "Evicted oldest photos");
        }
        evicted
    }
}
