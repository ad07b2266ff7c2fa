//! Record and blob storage.
//!
//! Every backend implements the same two contracts: [`RecordStore`] for photo
//! metadata and [`BlobStore`] for image bytes. The rest of the service only
//! ever sees a [`Backend`], so ingest, retention, moderation and the change
//! feed do not know which implementation is running.

pub mod local;
pub mod memory;
pub mod postgres;
pub mod s3;

use crate::config::{BackendKind, Config};
use crate::photo::{BlobRef, ContentType, NewPhotoRecord, PhotoId, PhotoRecord};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use postgres::PostgresRecordStore;
pub use s3::S3BlobStore;

/// Errors from record and blob store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of row-level change reported by a native subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Deleted,
}

/// A row-level change as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: PhotoId,
}

/// What a native subscription can yield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSignal {
    Change(StoreChange),
    /// Changes may have been lost (transport dropped and recovered, or the
    /// subscriber fell behind). The consumer must reconcile with `list()`.
    Gap,
}

/// An open native change subscription
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next signal. An error means the subscription is dead and
    /// must be reopened.
    async fn next(&mut self) -> Result<SourceSignal, StoreError>;
}

/// Durable photo metadata
///
/// Implementations must be `Send + Sync` and safe for concurrent access;
/// single-record insert and delete must be atomic.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All live records, newest first
    async fn list(&self) -> Result<Vec<PhotoRecord>, StoreError>;

    async fn get(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError>;

    /// Insert a record, stamping `uploaded_at` and `seq`
    async fn insert(&self, record: NewPhotoRecord) -> Result<PhotoRecord, StoreError>;

    /// Delete a record. Returns `true` if it existed.
    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError>;

    /// Delete every record. Returns how many were removed.
    async fn delete_all(&self) -> Result<u64, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// The single oldest record by `(uploaded_at, seq)`
    async fn oldest(&self) -> Result<Option<PhotoRecord>, StoreError>;

    /// Open a native change subscription. `None` if the backend has none.
    async fn subscribe(&self) -> Result<Option<Box<dyn ChangeSource>>, StoreError> {
        Ok(None)
    }

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StoreError> {
        self.count().await.map(|_| ())
    }
}

/// Durable storage for image bytes
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `path` and return a reference to them
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<BlobRef, StoreError>;

    /// Fetch bytes. `None` if the blob does not exist.
    async fn get(&self, blob: &BlobRef) -> Result<Option<Bytes>, StoreError>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, blob: &BlobRef) -> Result<(), StoreError>;

    /// A URL a browser can fetch the image from
    async fn public_url(&self, blob: &BlobRef) -> Result<String, StoreError>;
}

/// The active storage backend: one record store plus one blob store
#[derive(Clone)]
pub struct Backend {
    pub name: &'static str,
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Backend {
    pub fn new(
        name: &'static str,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            name,
            records,
            blobs,
        }
    }

    /// Backend over a single in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self::new("memory", store.clone(), store)
    }

    /// Backend over a single local document store
    pub fn local(store: Arc<LocalStore>) -> Self {
        Self::new("local", store.clone(), store)
    }

    /// Build the backend selected in configuration
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let backend = match config.backend.kind {
            BackendKind::Durable => {
                let database = config
                    .database
                    .as_ref()
                    .context("durable backend requires database configuration")?;
                let s3 = config
                    .s3
                    .as_ref()
                    .context("durable backend requires s3 configuration")?;

                let records = PostgresRecordStore::new(database)
                    .await
                    .context("Failed to initialize record store")?;
                if database.run_migrations {
                    records
                        .run_migrations()
                        .await
                        .context("Failed to run database migrations")?;
                }

                let blobs = S3BlobStore::new(s3)
                    .await
                    .context("Failed to initialize blob store")?;

                Self::new("durable", Arc::new(records), Arc::new(blobs))
            }
            BackendKind::Local => {
                let store = LocalStore::open(&config.local.dir)
                    .await
                    .context("Failed to open local photo store")?;
                Self::local(Arc::new(store))
            }
            BackendKind::Memory => Self::memory(Arc::new(MemoryStore::new())),
        };

        info!(backend = backend.name, "Storage backend ready");
        Ok(backend)
    }
}
