use crate::config::{Config, FeedConfig};
use crate::feed::{self, ChangeEvent, ChangeFeed, SubscriptionHandle};
use crate::ingest::{IngestError, IngestGateway, PhotoUpload};
use crate::moderation::{DeleteOutcome, ModerationError, Moderator};
use crate::photo::{BlobRef, PhotoId, PhotoRecord};
use crate::retention::RetentionManager;
use crate::store::{Backend, StoreError};
use crate::sync::PhotoSource;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Tunables for a [`PhotoWall`]
#[derive(Debug, Clone)]
pub struct WallOptions {
    /// Live photo cap; the oldest are evicted beyond it
    pub max_photos: u64,
    /// Concurrent blob uploads
    pub upload_concurrency: usize,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for WallOptions {
    fn default() -> Self {
        Self {
            max_photos: 500,
            upload_concurrency: 10,
            event_capacity: 1024,
        }
    }
}

impl WallOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_photos: config.retention.max_photos,
            upload_concurrency: config.ingest.upload_concurrency,
            event_capacity: config.feed.channel_capacity,
        }
    }
}

/// The photo store and its live change feed, behind one handle
#[derive(Clone)]
pub struct PhotoWall {
    backend: Backend,
    feed: Arc<ChangeFeed>,
    ingest: IngestGateway,
    moderator: Moderator,
}

impl PhotoWall {
    /// Build a wall over `backend`. The feed starts out knowing every photo
    /// already stored.
    pub async fn new(backend: Backend, options: WallOptions) -> Result<Self, StoreError> {
        let feed = Arc::new(ChangeFeed::new(options.event_capacity));
        let known = feed.sync_with(backend.records.as_ref()).await?;

        let retention = RetentionManager::new(backend.clone(), feed.clone(), options.max_photos);
        let ingest = IngestGateway::new(
            backend.clone(),
            feed.clone(),
            retention,
            options.upload_concurrency,
        );
        let moderator = Moderator::new(backend.clone(), feed.clone());

        info!(
            backend = backend.name,
            photos = known,
            max_photos = options.max_photos,
            "Photo wall ready"
        );

        Ok(Self {
            backend,
            feed,
            ingest,
            moderator,
        })
    }

    /// All live photos, newest first
    pub async fn list_photos(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        self.backend.records.list().await
    }

    pub async fn get_photo(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        self.backend.records.get(id).await
    }

    pub async fn upload_photo(&self, upload: PhotoUpload) -> Result<PhotoRecord, IngestError> {
        self.ingest.ingest(upload).await
    }

    pub async fn delete_photo(&self, id: PhotoId) -> Result<DeleteOutcome, ModerationError> {
        self.moderator.delete_one(id).await
    }

    /// Remove every photo, returning how many records went
    pub async fn clear_photos(&self) -> Result<u64, ModerationError> {
        self.moderator.clear_all().await
    }

    /// Register a callback for change events; drop the handle to stop
    pub fn on_change<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        self.feed.on_change(callback)
    }

    /// Change events as a stream
    pub fn events(&self) -> impl Stream<Item = ChangeEvent> + Send + Unpin + 'static {
        self.feed.stream()
    }

    pub async fn resolve_url(&self, blob_ref: &BlobRef) -> Result<String, StoreError> {
        self.backend.blobs.public_url(blob_ref).await
    }

    /// A photo's record and bytes, `None` if either is missing
    pub async fn photo_bytes(&self, id: PhotoId) -> Result<Option<(PhotoRecord, Bytes)>, StoreError> {
        let Some(record) = self.backend.records.get(id).await? else {
            return Ok(None);
        };
        let bytes = self.backend.blobs.get(&record.blob_ref).await?;
        Ok(bytes.map(|bytes| (record, bytes)))
    }

    /// Start following store changes made outside this process
    pub fn start_feed(&self, config: &FeedConfig) -> JoinHandle<()> {
        feed::spawn_driver(self.feed.clone(), self.backend.records.clone(), config.clone())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.records.ping().await
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

#[async_trait]
impl PhotoSource for PhotoWall {
    type Error = StoreError;

    async fn list(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        self.list_photos().await
    }
}
