//! Client-side view of the wall.
//!
//! A [`PhotoView`] is the ordered set of photos a display is showing, each
//! with whatever per-photo UI state the display keeps (fade-in progress, a
//! "new" badge, ...). It is kept current by applying change events, and
//! periodically replaced wholesale from the authoritative list. Replacing it
//! keeps the UI state of photos that are still there.

use crate::feed::ChangeEvent;
use crate::photo::{OrderKey, PhotoId, PhotoRecord};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// One photo in a view, with its display state
#[derive(Debug, Clone)]
pub struct ViewEntry<S> {
    pub record: PhotoRecord,
    pub state: S,
}

/// What applying an event did to a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    Unchanged,
    Changed,
    /// The view cannot be trusted until it is rebuilt from a full list
    NeedsResync,
}

/// Ordered photos, newest first, keyed by id
#[derive(Debug, Clone)]
pub struct PhotoView<S = ()> {
    entries: HashMap<PhotoId, ViewEntry<S>>,
    order: BTreeMap<OrderKey, PhotoId>,
}

impl<S> Default for PhotoView<S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }
}

impl<S: Default> PhotoView<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: PhotoId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Apply one change event
    pub fn apply(&mut self, event: &ChangeEvent) -> ViewChange {
        let changed = match event {
            ChangeEvent::Inserted { record } => self.insert(record.clone()),
            ChangeEvent::Deleted { id } => self.remove(*id),
            ChangeEvent::Cleared => {
                let had_any = !self.entries.is_empty();
                self.entries.clear();
                self.order.clear();
                had_any
            }
            ChangeEvent::Resync => return ViewChange::NeedsResync,
        };

        if changed {
            ViewChange::Changed
        } else {
            ViewChange::Unchanged
        }
    }

    /// Insert a photo at its position. No-op if already present.
    pub fn insert(&mut self, record: PhotoRecord) -> bool {
        if self.entries.contains_key(&record.id) {
            return false;
        }
        self.order.insert(record.order_key(), record.id);
        self.entries.insert(
            record.id,
            ViewEntry {
                record,
                state: S::default(),
            },
        );
        true
    }

    pub fn remove(&mut self, id: PhotoId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.order.remove(&entry.record.order_key());
                true
            }
            None => false,
        }
    }

    /// Replace the view with `records`, keeping the state of surviving ids.
    /// Returns whether the visible set or order changed.
    pub fn resync(&mut self, records: Vec<PhotoRecord>) -> bool {
        let before = self.ids();
        let mut previous = std::mem::take(&mut self.entries);
        self.order.clear();

        for record in records {
            if self.entries.contains_key(&record.id) {
                continue;
            }
            let state = previous
                .remove(&record.id)
                .map(|entry| entry.state)
                .unwrap_or_default();
            self.order.insert(record.order_key(), record.id);
            self.entries.insert(record.id, ViewEntry { record, state });
        }

        self.ids() != before
    }

    /// Photos newest first
    pub fn photos(&self) -> impl Iterator<Item = &PhotoRecord> + '_ {
        self.entries().map(|entry| &entry.record)
    }

    /// Entries newest first
    pub fn entries(&self) -> impl Iterator<Item = &ViewEntry<S>> + '_ {
        self.order
            .values()
            .rev()
            .filter_map(move |id| self.entries.get(id))
    }

    /// Ids newest first
    pub fn ids(&self) -> Vec<PhotoId> {
        self.order.values().rev().copied().collect()
    }

    pub fn state(&self, id: PhotoId) -> Option<&S> {
        self.entries.get(&id).map(|entry| &entry.state)
    }

    pub fn state_mut(&mut self, id: PhotoId) -> Option<&mut S> {
        self.entries.get_mut(&id).map(|entry| &mut entry.state)
    }
}

/// Anything that can hand out the authoritative photo list
#[async_trait]
pub trait PhotoSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// All live photos, newest first
    async fn list(&self) -> Result<Vec<PhotoRecord>, Self::Error>;
}

#[async_trait]
impl<T: PhotoSource + ?Sized> PhotoSource for Arc<T> {
    type Error = T::Error;

    async fn list(&self) -> Result<Vec<PhotoRecord>, Self::Error> {
        (**self).list().await
    }
}

/// Keeps a shared [`PhotoView`] in step with a source and its event stream
pub struct ViewSynchronizer<P, S = ()> {
    source: P,
    view: Arc<RwLock<PhotoView<S>>>,
    version: watch::Sender<u64>,
    resync_interval: Duration,
}

impl<P, S> ViewSynchronizer<P, S>
where
    P: PhotoSource,
    S: Default + Send + Sync,
{
    pub fn new(source: P, resync_interval: Duration) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            source,
            view: Arc::new(RwLock::new(PhotoView::new())),
            version,
            resync_interval: resync_interval.max(Duration::from_millis(1)),
        }
    }

    /// The view being maintained
    pub fn view(&self) -> Arc<RwLock<PhotoView<S>>> {
        self.view.clone()
    }

    /// Ticks every time the view changes
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Rebuild the view from the source
    pub async fn resync(&self) -> Result<bool, P::Error> {
        let records = self.source.list().await?;
        let changed = self.view.write().resync(records);
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Apply one event, resyncing if the event asks for it
    pub async fn handle(&self, event: &ChangeEvent) -> ViewChange {
        let change = self.view.write().apply(event);
        match change {
            ViewChange::Changed => self.bump(),
            ViewChange::NeedsResync => {
                debug!("Resyncing view");
                if let Err(e) = self.resync().await {
                    warn!(error = %e, "View resync failed");
                }
            }
            ViewChange::Unchanged => {}
        }
        change
    }

    /// Initial sync, then follow `events` with a periodic full resync.
    /// Returns when the event stream ends.
    pub async fn run<E>(&self, events: E)
    where
        E: Stream<Item = ChangeEvent> + Unpin,
    {
        let mut events = events;
        if let Err(e) = self.resync().await {
            warn!(error = %e, "Initial view sync failed");
        }

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        self.handle(&event).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Periodic view resync failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{BlobRef, ContentType, NewPhotoRecord};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    fn record(seq: i64) -> PhotoRecord {
        NewPhotoRecord {
            id: PhotoId::new(),
            blob_ref: BlobRef::new(format!("photos/{seq}.png")),
            original_filename: format!("{seq}.png"),
            size_bytes: 1234,
            content_type: ContentType::Png,
            uploader_label: None,
        }
        .into_record(Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap(), seq)
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Badge {
        seen: bool,
    }

    struct FixedSource(Mutex<Vec<PhotoRecord>>);

    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct Never;

    #[async_trait]
    impl PhotoSource for FixedSource {
        type Error = Never;

        async fn list(&self) -> Result<Vec<PhotoRecord>, Never> {
            Ok(self.0.lock().clone())
        }
    }

    #[test]
    fn test_insert_orders_by_upload_time_then_seq() {
        let mut view: PhotoView = PhotoView::new();
        let (a, b, c) = (record(1), record(2), record(3));
        // Out of order on purpose
        view.apply(&ChangeEvent::Inserted { record: b.clone() });
        view.apply(&ChangeEvent::Inserted { record: c.clone() });
        view.apply(&ChangeEvent::Inserted { record: a.clone() });

        assert_eq!(view.ids(), vec![c.id, b.id, a.id]);
    }

    #[test]
    fn test_duplicate_insert_and_unknown_delete_are_no_ops() {
        let mut view: PhotoView = PhotoView::new();
        let a = record(1);
        assert_eq!(view.apply(&ChangeEvent::Inserted { record: a.clone() }), ViewChange::Changed);
        assert_eq!(view.apply(&ChangeEvent::Inserted { record: a.clone() }), ViewChange::Unchanged);
        assert_eq!(
            view.apply(&ChangeEvent::Deleted { id: PhotoId::new() }),
            ViewChange::Unchanged
        );
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_cleared_and_resync_events() {
        let mut view: PhotoView = PhotoView::new();
        view.insert(record(1));
        assert_eq!(view.apply(&ChangeEvent::Cleared), ViewChange::Changed);
        assert!(view.is_empty());
        assert_eq!(view.apply(&ChangeEvent::Resync), ViewChange::NeedsResync);
    }

    #[test]
    fn test_resync_preserves_state_of_survivors() {
        let mut view: PhotoView<Badge> = PhotoView::new();
        let (a, b, c) = (record(1), record(2), record(3));
        view.insert(a.clone());
        view.insert(b.clone());
        view.state_mut(a.id).unwrap().seen = true;
        view.state_mut(b.id).unwrap().seen = true;

        // b is gone, c arrived
        let changed = view.resync(vec![c.clone(), a.clone()]);
        assert!(changed);
        assert_eq!(view.ids(), vec![c.id, a.id]);
        assert_eq!(view.state(a.id), Some(&Badge { seen: true }));
        assert_eq!(view.state(c.id), Some(&Badge::default()));
        assert!(view.state(b.id).is_none());

        assert!(!view.resync(vec![c, a]));
    }

    #[tokio::test]
    async fn test_synchronizer_resyncs_on_request() {
        let a = record(1);
        let source = Arc::new(FixedSource(Mutex::new(vec![a.clone()])));
        let sync: ViewSynchronizer<_, Badge> =
            ViewSynchronizer::new(source.clone(), Duration::from_secs(3600));
        let mut changes = sync.changes();

        assert!(sync.resync().await.unwrap());
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        // A change the synchronizer only learns about via resync
        let b = record(2);
        source.0.lock().insert(0, b.clone());
        assert_eq!(sync.handle(&ChangeEvent::Resync).await, ViewChange::NeedsResync);
        assert_eq!(sync.view().read().ids(), vec![b.id, a.id]);
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_run_follows_events_until_stream_ends() {
        let a = record(1);
        let b = record(2);
        let source = FixedSource(Mutex::new(vec![a.clone()]));
        let sync: ViewSynchronizer<_, ()> = ViewSynchronizer::new(source, Duration::from_secs(3600));

        let events = futures::stream::iter(vec![
            ChangeEvent::Inserted { record: b.clone() },
            ChangeEvent::Deleted { id: a.id },
        ]);
        sync.run(events).await;

        assert_eq!(sync.view().read().ids(), vec![b.id]);
    }
}
