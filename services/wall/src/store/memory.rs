//! In-process record and blob store.
//!
//! Keeps everything in memory and offers a native change subscription, so it
//! can stand in for the durable backend in tests and demo runs. Failure
//! injection hooks let tests drive the compensating paths.

use super::{
    BlobStore, ChangeKind, ChangeSource, RecordStore, SourceSignal, StoreChange, StoreError,
};
use crate::photo::{BlobRef, ContentType, NewPhotoRecord, PhotoId, PhotoRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

const NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
enum Notice {
    Signal(SourceSignal),
    Disconnect,
}

#[derive(Default)]
struct RecordTable {
    records: HashMap<PhotoId, PhotoRecord>,
    next_seq: i64,
    last_uploaded_at: Option<DateTime<Utc>>,
}

/// Which operations should fail next
#[derive(Debug, Default)]
struct Faults {
    blob_put: bool,
    blob_delete: bool,
    record_insert: u32,
    subscribe: u32,
}

pub struct MemoryStore {
    table: RwLock<RecordTable>,
    blobs: RwLock<HashMap<String, (Bytes, ContentType)>>,
    notices: broadcast::Sender<Notice>,
    paused: AtomicBool,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            table: RwLock::new(RecordTable::default()),
            blobs: RwLock::new(HashMap::new()),
            notices,
            paused: AtomicBool::new(false),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Number of blobs currently held
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn has_blob(&self, blob: &BlobRef) -> bool {
        self.blobs.read().contains_key(blob.as_str())
    }

    /// Number of open change subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.notices.receiver_count()
    }

    /// Make every blob put fail until turned off
    pub fn fail_blob_puts(&self, fail: bool) {
        self.faults.lock().blob_put = fail;
    }

    /// Make every blob delete fail until turned off
    pub fn fail_blob_deletes(&self, fail: bool) {
        self.faults.lock().blob_delete = fail;
    }

    /// Make the next `count` record inserts fail
    pub fn fail_record_inserts(&self, count: u32) {
        self.faults.lock().record_insert = count;
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_subscriptions(&self, count: u32) {
        self.faults.lock().subscribe = count;
    }

    /// Stop delivering change notifications; changes made meanwhile are lost
    /// to subscribers
    pub fn pause_notifications(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume notifications and tell subscribers they missed some
    pub fn resume_notifications(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.notices.send(Notice::Signal(SourceSignal::Gap));
    }

    /// Kill every open subscription, as a dropped connection would
    pub fn disconnect_subscribers(&self) {
        let _ = self.notices.send(Notice::Disconnect);
    }

    fn notify(&self, kind: ChangeKind, id: PhotoId) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .notices
            .send(Notice::Signal(SourceSignal::Change(StoreChange { kind, id })));
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        let mut records: Vec<PhotoRecord> = self.table.read().records.values().cloned().collect();
        crate::photo::sort_newest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.table.read().records.get(&id).cloned())
    }

    async fn insert(&self, record: NewPhotoRecord) -> Result<PhotoRecord, StoreError> {
        if Self::take_fault(&mut self.faults.lock().record_insert) {
            return Err(StoreError::Backend("injected record insert failure".to_string()));
        }

        let record = {
            let mut table = self.table.write();
            if table.records.contains_key(&record.id) {
                return Err(StoreError::Backend(format!("duplicate photo id {}", record.id)));
            }

            // Keep upload times monotonic even if the wall clock steps back
            let now = Utc::now();
            let uploaded_at = match table.last_uploaded_at {
                Some(last) if last > now => last,
                _ => now,
            };
            table.next_seq += 1;
            let record = record.into_record(uploaded_at, table.next_seq);
            table.last_uploaded_at = Some(uploaded_at);
            table.records.insert(record.id, record.clone());
            record
        };

        self.notify(ChangeKind::Inserted, record.id);
        Ok(record)
    }

    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError> {
        let existed = self.table.write().records.remove(&id).is_some();
        if existed {
            self.notify(ChangeKind::Deleted, id);
        }
        Ok(existed)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let removed: Vec<PhotoId> = self.table.write().records.drain().map(|(id, _)| id).collect();
        for id in &removed {
            self.notify(ChangeKind::Deleted, *id);
        }
        Ok(removed.len() as u64)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.table.read().records.len() as u64)
    }

    async fn oldest(&self) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self
            .table
            .read()
            .records
            .values()
            .min_by_key(|r| r.order_key())
            .cloned())
    }

    async fn subscribe(&self) -> Result<Option<Box<dyn ChangeSource>>, StoreError> {
        if Self::take_fault(&mut self.faults.lock().subscribe) {
            return Err(StoreError::Connection("injected subscribe failure".to_string()));
        }
        Ok(Some(Box::new(MemoryChangeSource {
            receiver: self.notices.subscribe(),
        })))
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: ContentType,
    ) -> Result<BlobRef, StoreError> {
        if self.faults.lock().blob_put {
            return Err(StoreError::Backend("injected blob put failure".to_string()));
        }
        self.blobs
            .write()
            .insert(path.to_string(), (data, content_type));
        Ok(BlobRef::new(path))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .blobs
            .read()
            .get(blob.as_str())
            .map(|(data, _)| data.clone()))
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), StoreError> {
        if self.faults.lock().blob_delete {
            return Err(StoreError::Backend("injected blob delete failure".to_string()));
        }
        self.blobs.write().remove(blob.as_str());
        Ok(())
    }

    async fn public_url(&self, blob: &BlobRef) -> Result<String, StoreError> {
        Ok(format!("memory://{}", blob.as_str()))
    }
}

struct MemoryChangeSource {
    receiver: broadcast::Receiver<Notice>,
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn next(&mut self) -> Result<SourceSignal, StoreError> {
        match self.receiver.recv().await {
            Ok(Notice::Signal(signal)) => Ok(signal),
            Ok(Notice::Disconnect) => Err(StoreError::Connection(
                "subscription disconnected".to_string(),
            )),
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(SourceSignal::Gap),
            Err(broadcast::error::RecvError::Closed) => {
                Err(StoreError::Connection("store closed".to_string()))
            }
        }
    }
}
