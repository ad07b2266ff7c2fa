use super::{ChangeEvent, ChangeFeed};
use crate::config::FeedConfig;
use crate::store::{ChangeKind, RecordStore, SourceSignal, StoreChange, StoreError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Why the push driver gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushExit {
    /// The store has no native subscription
    Unsupported,
    /// Subscribing failed `max_push_failures` times in a row
    Degraded,
}

/// Follow the store's native change subscription, reconnecting with
/// exponential backoff. Returns only when push mode cannot continue.
pub async fn run(
    feed: Arc<ChangeFeed>,
    records: Arc<dyn RecordStore>,
    config: &FeedConfig,
) -> PushExit {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.reconnect_base_delay(),
        max_interval: config.reconnect_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut failures = 0u32;
    let mut reconnecting = false;

    let mut resync = tokio::time::interval(config.resync_interval());
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut source = match records.subscribe().await {
            Ok(Some(source)) => source,
            Ok(None) => return PushExit::Unsupported,
            Err(e) => {
                failures += 1;
                metrics::counter!("wall.feed.subscribe_failures").increment(1);
                if failures >= config.max_push_failures {
                    return PushExit::Degraded;
                }
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| config.reconnect_max_delay());
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Change subscription failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        failures = 0;
        backoff.reset();

        // Anything that changed while we were not listening
        if let Err(e) = feed.sync_with(records.as_ref()).await {
            warn!(error = %e, "Reconcile after subscribe failed");
        }
        if reconnecting {
            info!("Change subscription re-established");
            feed.publish(ChangeEvent::Resync);
        }
        reconnecting = true;
        resync.reset();

        loop {
            tokio::select! {
                signal = source.next() => match signal {
                    Ok(SourceSignal::Change(change)) => {
                        if let Err(e) = apply_change(&feed, records.as_ref(), change).await {
                            warn!(error = %e, photo_id = %change.id, "Failed to resolve change");
                        }
                    }
                    Ok(SourceSignal::Gap) => {
                        debug!("Change subscription reported a gap");
                        if let Err(e) = feed.sync_with(records.as_ref()).await {
                            warn!(error = %e, "Reconcile after gap failed");
                        }
                        feed.publish(ChangeEvent::Resync);
                    }
                    Err(e) => {
                        warn!(error = %e, "Change subscription dropped");
                        break;
                    }
                },
                _ = resync.tick() => {
                    if let Err(e) = feed.sync_with(records.as_ref()).await {
                        warn!(error = %e, "Periodic reconcile failed");
                    }
                }
            }
        }

        drop(source);
        let delay = backoff
            .next_backoff()
            .unwrap_or_else(|| config.reconnect_max_delay());
        tokio::time::sleep(delay).await;
    }
}

/// Turn a store notification into a feed event
async fn apply_change(
    feed: &ChangeFeed,
    records: &dyn RecordStore,
    change: StoreChange,
) -> Result<(), StoreError> {
    let _gate = feed.order_gate().await;
    match change.kind {
        ChangeKind::Inserted => {
            if feed.is_known(change.id) {
                return Ok(());
            }
            // Gone again already: its deletion notice is still on the way
            if let Some(record) = records.get(change.id).await? {
                feed.publish(ChangeEvent::Inserted { record });
            }
        }
        ChangeKind::Deleted => {
            feed.publish(ChangeEvent::Deleted { id: change.id });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{BlobRef, ContentType, NewPhotoRecord, PhotoId};
    use crate::store::{LocalStore, MemoryStore};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn new_record() -> NewPhotoRecord {
        NewPhotoRecord {
            id: PhotoId::new(),
            blob_ref: BlobRef::new("photos/y.webp"),
            original_filename: "y.webp".to_string(),
            size_bytes: 8000,
            content_type: ContentType::Webp,
            uploader_label: Some("Bo".to_string()),
        }
    }

    fn fast_config() -> FeedConfig {
        FeedConfig {
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            max_push_failures: 3,
            ..FeedConfig::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("feed closed")
    }

    #[tokio::test]
    async fn test_store_without_subscription_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(LocalStore::open(dir.path()).await.unwrap());
        let feed = Arc::new(ChangeFeed::new(16));

        assert_eq!(run(feed, store, &fast_config()).await, PushExit::Unsupported);
    }

    #[tokio::test]
    async fn test_repeated_subscribe_failures_degrade() {
        let store = Arc::new(MemoryStore::new());
        store.fail_subscriptions(10);
        let feed = Arc::new(ChangeFeed::new(16));

        assert_eq!(run(feed, store, &fast_config()).await, PushExit::Degraded);
    }

    #[tokio::test]
    async fn test_native_changes_are_published() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ChangeFeed::new(16));
        let mut rx = feed.subscribe();

        let records: Arc<dyn RecordStore> = store.clone();
        let task = tokio::spawn({
            let feed = feed.clone();
            async move { run(feed, records, &fast_config()).await }
        });
        // Wait until the driver is subscribed
        while store.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        let record = store.insert(new_record()).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ChangeEvent::Inserted { record: record.clone() }
        );

        store.delete(record.id).await.unwrap();
        assert_eq!(next_event(&mut rx).await, ChangeEvent::Deleted { id: record.id });
        task.abort();
    }

    #[tokio::test]
    async fn test_reconnect_catches_up_and_resyncs() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ChangeFeed::new(16));
        let mut rx = feed.subscribe();

        let records: Arc<dyn RecordStore> = store.clone();
        let task = tokio::spawn({
            let feed = feed.clone();
            async move { run(feed, records, &fast_config()).await }
        });
        while store.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Changes made while the subscription is down are only seen by the
        // reconcile after reconnecting
        store.pause_notifications();
        store.disconnect_subscribers();
        let missed = store.insert(new_record()).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            ChangeEvent::Inserted { record: missed }
        );
        assert_eq!(next_event(&mut rx).await, ChangeEvent::Resync);
        task.abort();
    }
}
