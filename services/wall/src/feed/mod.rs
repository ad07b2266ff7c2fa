//! Change feed.
//!
//! A single broadcast of [`ChangeEvent`]s for everything that happens to the
//! record set. Events come from three places: local mutations (ingest,
//! retention, moderation) publish directly; a native store subscription
//! ([`push`]) or a periodic list diff ([`poll`]) picks up the rest.
//!
//! All of them go through the feed's known-id set, so the same change seen
//! twice (once from the local publish and once from the store) reaches
//! subscribers once.

pub mod poll;
pub mod push;

use crate::config::{FeedConfig, FeedMode};
use crate::photo::{PhotoId, PhotoRecord};
use crate::store::{RecordStore, StoreError};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, MutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// A change to the record set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Inserted { record: PhotoRecord },
    Deleted { id: PhotoId },
    /// Every record was removed at once
    Cleared,
    /// Events may have been missed; reconcile with a full list
    Resync,
}

impl ChangeEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Deleted { .. } => "deleted",
            Self::Cleared => "cleared",
            Self::Resync => "resync",
        }
    }
}

/// Broadcasts change events to any number of subscribers
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    known: Mutex<HashSet<PhotoId>>,
    // Held by writers across "mutate store, publish event" so events leave
    // in the order the store applied them
    gate: tokio::sync::Mutex<()>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            known: Mutex::new(HashSet::new()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Take the ordering gate
    pub async fn order_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Publish an event. Returns `false` if it was a duplicate and dropped.
    pub fn publish(&self, event: ChangeEvent) -> bool {
        let fresh = {
            let mut known = self.known.lock();
            match &event {
                ChangeEvent::Inserted { record } => known.insert(record.id),
                ChangeEvent::Deleted { id } => known.remove(id),
                ChangeEvent::Cleared => {
                    known.clear();
                    true
                }
                ChangeEvent::Resync => true,
            }
        };

        if !fresh {
            debug!(kind = event.kind(), "Dropping duplicate change event");
            return false;
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
        true
    }

    /// Diff `records` (newest first) against the known set and publish the
    /// difference: deletions first, then insertions oldest first.
    ///
    /// Returns how many events were published. Callers hold the ordering
    /// gate across the `list()` that produced `records` and this call.
    pub fn reconcile(&self, records: &[PhotoRecord]) -> usize {
        let (deleted, inserted) = {
            let known = self.known.lock();
            let current: HashSet<PhotoId> = records.iter().map(|r| r.id).collect();
            let deleted: Vec<PhotoId> = known.difference(&current).copied().collect();
            let inserted: Vec<PhotoRecord> = records
                .iter()
                .rev()
                .filter(|r| !known.contains(&r.id))
                .cloned()
                .collect();
            (deleted, inserted)
        };

        let mut published = 0;
        for id in deleted {
            published += usize::from(self.publish(ChangeEvent::Deleted { id }));
        }
        for record in inserted {
            published += usize::from(self.publish(ChangeEvent::Inserted { record }));
        }

        if published > 0 {
            debug!(published, "Reconciled change feed with store");
        }
        published
    }

    /// List the store under the ordering gate and reconcile with it
    pub async fn sync_with(&self, records: &dyn RecordStore) -> Result<usize, StoreError> {
        let _gate = self.order_gate().await;
        let current = records.list().await?;
        Ok(self.reconcile(&current))
    }

    /// Whether the feed currently believes `id` is live
    pub fn is_known(&self, id: PhotoId) -> bool {
        self.known.lock().contains(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Raw receiver. A lagging receiver gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Events as a stream. A subscriber that falls behind gets
    /// [`ChangeEvent::Resync`] in place of what it missed.
    pub fn stream(&self) -> impl Stream<Item = ChangeEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.sender.subscribe()).map(|item| match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "Change subscriber lagged, asking it to resync");
                ChangeEvent::Resync
            }
        })
    }

    /// Call `callback` for every event until the handle is dropped
    pub fn on_change<F>(&self, mut callback: F) -> SubscriptionHandle
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut events = self.stream();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                callback(event);
            }
        });
        SubscriptionHandle { task }
    }
}

/// Keeps an `on_change` callback registered; dropping it unsubscribes
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the background driver that feeds store changes into `feed`
pub fn spawn_driver(
    feed: Arc<ChangeFeed>,
    records: Arc<dyn RecordStore>,
    config: FeedConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match config.mode {
            FeedMode::Poll => {
                info!(interval_ms = config.poll_interval_ms, "Change feed in poll mode");
                poll::run(feed, records, &config).await;
            }
            FeedMode::Auto | FeedMode::Push => {
                match push::run(feed.clone(), records.clone(), &config).await {
                    push::PushExit::Unsupported => {
                        info!("Store has no native subscription, polling instead");
                    }
                    push::PushExit::Degraded => {
                        warn!(
                            failures = config.max_push_failures,
                            "Push subscription keeps failing, degrading to poll mode"
                        );
                    }
                }
                metrics::counter!("wall.feed.degraded").increment(1);
                feed.publish(ChangeEvent::Resync);
                poll::run(feed, records, &config).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{BlobRef, ContentType, NewPhotoRecord};
    use chrono::{Duration, Utc};

    fn record(seq: i64) -> PhotoRecord {
        NewPhotoRecord {
            id: PhotoId::new(),
            blob_ref: BlobRef::new(format!("photos/{seq}.jpg")),
            original_filename: format!("{seq}.jpg"),
            size_bytes: 5000,
            content_type: ContentType::Jpeg,
            uploader_label: None,
        }
        .into_record(Utc::now() + Duration::milliseconds(seq), seq)
    }

    #[test]
    fn test_event_wire_format() {
        let id = PhotoId::new();
        let json = serde_json::to_value(ChangeEvent::Deleted { id }).unwrap();
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["id"], id.to_string());

        let json = serde_json::to_value(ChangeEvent::Cleared).unwrap();
        assert_eq!(json, serde_json::json!({"type": "cleared"}));

        let back: ChangeEvent = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(back, ChangeEvent::Resync);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let feed = ChangeFeed::new(16);
        let mut rx = feed.subscribe();
        let a = record(1);

        assert!(feed.publish(ChangeEvent::Inserted { record: a.clone() }));
        assert!(!feed.publish(ChangeEvent::Inserted { record: a.clone() }));
        assert!(feed.publish(ChangeEvent::Deleted { id: a.id }));
        assert!(!feed.publish(ChangeEvent::Deleted { id: a.id }));

        assert_eq!(rx.recv().await.unwrap().kind(), "inserted");
        assert_eq!(rx.recv().await.unwrap().kind(), "deleted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_emits_deletions_then_insertions_oldest_first() {
        let feed = ChangeFeed::new(16);
        let gone = record(1);
        let kept = record(2);
        feed.reconcile(&[kept.clone(), gone.clone()]);

        let mut rx = feed.subscribe();
        let new_a = record(3);
        let new_b = record(4);
        // Newest first, as list() returns them
        let published = feed.reconcile(&[new_b.clone(), new_a.clone(), kept.clone()]);
        assert_eq!(published, 3);

        assert_eq!(rx.recv().await.unwrap(), ChangeEvent::Deleted { id: gone.id });
        assert_eq!(rx.recv().await.unwrap(), ChangeEvent::Inserted { record: new_a });
        assert_eq!(rx.recv().await.unwrap(), ChangeEvent::Inserted { record: new_b });
        assert!(feed.is_known(kept.id));
        assert!(!feed.is_known(gone.id));
    }

    #[tokio::test]
    async fn test_cleared_resets_known_set() {
        let feed = ChangeFeed::new(16);
        let a = record(1);
        feed.publish(ChangeEvent::Inserted { record: a.clone() });
        feed.publish(ChangeEvent::Cleared);

        assert!(!feed.is_known(a.id));
        assert!(!feed.publish(ChangeEvent::Deleted { id: a.id }));
    }

    #[tokio::test]
    async fn test_lagging_stream_gets_resync() {
        let feed = ChangeFeed::new(2);
        let mut events = feed.stream();
        for seq in 0..5 {
            feed.publish(ChangeEvent::Inserted { record: record(seq) });
        }

        assert_eq!(events.next().await, Some(ChangeEvent::Resync));
    }

    #[tokio::test]
    async fn test_dropping_handle_unsubscribes() {
        let feed = ChangeFeed::new(16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = feed.on_change(move |event| {
            let _ = tx.send(event);
        });
        // Let the subscriber task start
        tokio::task::yield_now().await;

        feed.publish(ChangeEvent::Resync);
        assert_eq!(rx.recv().await, Some(ChangeEvent::Resync));

        drop(handle);
        // The aborted task drops its sender, closing the channel
        assert_eq!(rx.recv().await, None);
    }
}
