//! Local fallback store.
//!
//! The whole record list lives in one JSON document under a well-known key
//! (`eventPhotos.json` in the configured directory), newest first. Image bytes
//! are inlined into the records as base64 `data:` URIs, so a blob can never
//! outlive its record. There is no native change subscription; the change
//! feed polls this store. A small watermark file beside the document keeps
//! sequence numbers and upload times from going backwards after deletes.
//!
//! Every operation reads the document from disk, so several processes sharing
//! the directory see each other's writes on their next poll.

use super::{BlobStore, RecordStore, StoreError};
use crate::photo::{sort_newest_first, BlobRef, ContentType, NewPhotoRecord, PhotoId, PhotoRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Storage key of the photo document
pub const STORAGE_KEY: &str = "eventPhotos";

/// Highest sequence and upload time ever handed out. Lives beside the photo
/// document so neither goes backwards when the newest photos are deleted.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct Watermark {
    last_seq: i64,
    last_uploaded_at: Option<DateTime<Utc>>,
}

pub struct LocalStore {
    path: PathBuf,
    watermark_path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl LocalStore {
    /// Open (or create) the store in `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{STORAGE_KEY}.json"));
        let watermark_path = dir.join(format!("{STORAGE_KEY}.seq.json"));

        let store = Self {
            path,
            watermark_path,
            lock: Mutex::new(()),
        };
        let existing = store.load().await?;
        info!(
            path = %store.path.display(),
            photos = existing.len(),
            "Opened local photo store"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut records: Vec<PhotoRecord> = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Serialization(format!("corrupt photo document: {e}")))?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn load_watermark(&self) -> Result<Watermark, StoreError> {
        let raw = match tokio::fs::read(&self.watermark_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Watermark::default()),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(Watermark::default());
        }
        serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Serialization(format!("corrupt sequence watermark: {e}")))
    }

    /// Write the document atomically: temp file, then rename over the old one
    async fn persist(&self, records: &[PhotoRecord]) -> Result<(), StoreError> {
        write_atomic(&self.path, records).await?;
        debug!(photos = records.len(), "Persisted photo document");
        Ok(())
    }
}

async fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let body = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Encode bytes as a `data:` URI
pub fn to_data_uri(data: &[u8], content_type: ContentType) -> String {
    format!("data:{};base64,{}", content_type.mime(), STANDARD.encode(data))
}

/// Decode a `data:` URI produced by [`to_data_uri`]
pub fn from_data_uri(uri: &str) -> Result<(ContentType, Vec<u8>), StoreError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| StoreError::Serialization("not a data URI".to_string()))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| StoreError::Serialization("data URI is not base64".to_string()))?;
    let content_type = ContentType::from_mime(mime)
        .ok_or_else(|| StoreError::Serialization(format!("unsupported data URI type {mime}")))?;
    let data = STANDARD
        .decode(payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok((content_type, data))
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn list(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn get(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|r| r.id == id))
    }

    #[instrument(skip(self, record), fields(photo_id = %record.id))]
    async fn insert(&self, record: NewPhotoRecord) -> Result<PhotoRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Backend(format!("duplicate photo id {}", record.id)));
        }

        // Documents written before the watermark existed still count
        let mut mark = self.load_watermark().await?;
        if let Some(newest) = records.first() {
            mark.last_seq = mark.last_seq.max(newest.seq);
            mark.last_uploaded_at = mark.last_uploaded_at.max(Some(newest.uploaded_at));
        }

        let now = Utc::now();
        let uploaded_at = match mark.last_uploaded_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let seq = mark.last_seq + 1;

        // Burn the sequence first; a failed document write only leaves a gap
        write_atomic(
            &self.watermark_path,
            &Watermark {
                last_seq: seq,
                last_uploaded_at: Some(uploaded_at),
            },
        )
        .await?;

        let record = record.into_record(uploaded_at, seq);
        records.insert(0, record.clone());
        self.persist(&records).await?;
        Ok(record)
    }

    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.persist(&records).await?;
        Ok(true)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        let removed = self.load().await?.len() as u64;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.list().await?.len() as u64)
    }

    async fn oldest(&self) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.list().await?.pop())
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    /// Inline blobs carry no path; the reference is the data itself
    async fn put(
        &self,
        _path: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<BlobRef, StoreError> {
        Ok(BlobRef::new(to_data_uri(&data, content_type)))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Bytes>, StoreError> {
        let (_, data) = from_data_uri(blob.as_str())?;
        Ok(Some(Bytes::from(data)))
    }

    /// The bytes go away with the record that holds them
    async fn delete(&self, _blob: &BlobRef) -> Result<(), StoreError> {
        Ok(())
    }

    async fn public_url(&self, blob: &BlobRef) -> Result<String, StoreError> {
        Ok(blob.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(store_ref: BlobRef) -> NewPhotoRecord {
        NewPhotoRecord {
            id: PhotoId::new(),
            blob_ref: store_ref,
            original_filename: "party.png".to_string(),
            size_bytes: 1200,
            content_type: ContentType::Png,
            uploader_label: Some("Ana".to_string()),
        }
    }

    #[test]
    fn test_data_uri_round_trip() {
        let uri = to_data_uri(b"\x89PNG not really", ContentType::Png);
        assert!(uri.starts_with("data:image/png;base64,"));

        let (content_type, data) = from_data_uri(&uri).unwrap();
        assert_eq!(content_type, ContentType::Png);
        assert_eq!(data, b"\x89PNG not really");
    }

    #[test]
    fn test_from_data_uri_rejects_garbage() {
        assert!(from_data_uri("photos/a.jpg").is_err());
        assert!(from_data_uri("data:image/png,plain").is_err());
        assert!(from_data_uri("data:text/plain;base64,aGk=").is_err());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let blob = store
            .put("ignored", Bytes::from_static(b"pixels"), ContentType::Png)
            .await
            .unwrap();
        let first = store.insert(new_record(blob.clone())).await.unwrap();
        let second = store.insert(new_record(blob)).await.unwrap();
        assert_eq!(second.seq, first.seq + 1);
        drop(store);

        let reopened = LocalStore::open(dir.path()).await.unwrap();
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(reopened.oldest().await.unwrap().unwrap().id, first.id);

        let bytes = BlobStore::get(&reopened, &listed[0].blob_ref).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"pixels"[..]));
    }

    #[tokio::test]
    async fn test_document_is_a_single_array_under_the_storage_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let blob = BlobRef::new(to_data_uri(b"x", ContentType::Gif));
        store.insert(new_record(blob)).await.unwrap();

        assert_eq!(store.path(), dir.path().join("eventPhotos.json"));
        let raw = std::fs::read(store.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_delete_all_empties_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let blob = BlobRef::new(to_data_uri(b"x", ContentType::Gif));
        store.insert(new_record(blob.clone())).await.unwrap();
        store.insert(new_record(blob)).await.unwrap();

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.delete_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sequence_never_reused_after_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let blob = BlobRef::new(to_data_uri(b"x", ContentType::Gif));

        store.insert(new_record(blob.clone())).await.unwrap();
        let newest = store.insert(new_record(blob.clone())).await.unwrap();
        assert!(RecordStore::delete(&store, newest.id).await.unwrap());

        let after_delete = store.insert(new_record(blob.clone())).await.unwrap();
        assert!(after_delete.seq > newest.seq);
        assert!(after_delete.order_key() > newest.order_key());

        store.delete_all().await.unwrap();
        drop(store);

        let reopened = LocalStore::open(dir.path()).await.unwrap();
        let after_clear = reopened.insert(new_record(blob)).await.unwrap();
        assert!(after_clear.seq > after_delete.seq);
        assert!(after_clear.uploaded_at >= after_delete.uploaded_at);
    }
}
