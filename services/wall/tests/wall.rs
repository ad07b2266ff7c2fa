use event_wall::config::FeedConfig;
use event_wall::{
    Backend, ChangeEvent, DeleteOutcome, IngestError, LocalStore, MemoryStore, PhotoId,
    PhotoUpload, PhotoWall, ViewSynchronizer, WallOptions,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn options(max_photos: u64) -> WallOptions {
    WallOptions {
        max_photos,
        ..WallOptions::default()
    }
}

fn jpeg(name: &str) -> PhotoUpload {
    PhotoUpload::new(vec![0xD8; 2048], "image/jpeg", name)
}

fn fast_feed() -> FeedConfig {
    FeedConfig {
        poll_interval_ms: 20,
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 20,
        ..FeedConfig::default()
    }
}

async fn memory_wall(max_photos: u64) -> (PhotoWall, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let wall = PhotoWall::new(Backend::memory(store.clone()), options(max_photos))
        .await
        .unwrap();
    (wall, store)
}

#[tokio::test]
async fn upload_appears_at_the_front() {
    let (wall, _store) = memory_wall(10).await;
    let first = assert_ok!(wall.upload_photo(jpeg("one.jpg")).await);
    let second = assert_ok!(wall.upload_photo(jpeg("two.jpg")).await);

    let photos = wall.list_photos().await.unwrap();
    assert_eq!(photos.len(), 2);
    assert_eq!(photos[0].id, second.id);
    assert_eq!(photos[1].id, first.id);
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn rejected_uploads_leave_the_wall_unchanged() {
    let (wall, store) = memory_wall(10).await;
    wall.upload_photo(jpeg("keep.jpg")).await.unwrap();
    let before = wall.list_photos().await.unwrap();

    let too_small = PhotoUpload::new(vec![0; 999], "image/png", "tiny.png");
    let wrong_type = PhotoUpload::new(vec![0; 4096], "image/bmp", "old.bmp");
    let lying = jpeg("lie.jpg").with_declared_size(11 * 1024 * 1024);

    assert!(matches!(
        wall.upload_photo(too_small).await,
        Err(IngestError::TooSmall { .. })
    ));
    assert!(matches!(
        wall.upload_photo(wrong_type).await,
        Err(IngestError::UnsupportedType(_))
    ));
    assert!(matches!(
        wall.upload_photo(lying).await,
        Err(IngestError::TooLarge { .. })
    ));

    assert_eq!(wall.list_photos().await.unwrap(), before);
    assert_eq!(store.blob_count(), 1);
}

#[tokio::test]
async fn oldest_photo_is_evicted_at_capacity() {
    let (wall, store) = memory_wall(3).await;
    let mut uploaded = Vec::new();
    for i in 0..3 {
        uploaded.push(wall.upload_photo(jpeg(&format!("{i}.jpg"))).await.unwrap());
    }

    let newest = wall.upload_photo(jpeg("3.jpg")).await.unwrap();

    let photos = wall.list_photos().await.unwrap();
    let ids: Vec<PhotoId> = photos.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![newest.id, uploaded[2].id, uploaded[1].id]);
    assert!(!store.has_blob(&uploaded[0].blob_ref));
    assert_eq!(store.blob_count(), 3);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (wall, store) = memory_wall(10).await;
    let photo = wall.upload_photo(jpeg("bye.jpg")).await.unwrap();

    assert_eq!(wall.delete_photo(photo.id).await.unwrap(), DeleteOutcome::Deleted);
    assert_eq!(
        wall.delete_photo(photo.id).await.unwrap(),
        DeleteOutcome::AlreadyGone
    );
    assert_eq!(
        wall.delete_photo(PhotoId::new()).await.unwrap(),
        DeleteOutcome::AlreadyGone
    );
    assert!(wall.list_photos().await.unwrap().is_empty());
    assert!(!store.has_blob(&photo.blob_ref));
}

#[tokio::test]
async fn clear_empties_the_wall_and_uploads_still_work() {
    let (wall, store) = memory_wall(10).await;
    for i in 0..4 {
        wall.upload_photo(jpeg(&format!("{i}.jpg"))).await.unwrap();
    }

    assert_eq!(wall.clear_photos().await.unwrap(), 4);
    assert!(wall.list_photos().await.unwrap().is_empty());
    assert_eq!(store.blob_count(), 0);

    let after = wall.upload_photo(jpeg("again.jpg")).await.unwrap();
    assert_eq!(wall.list_photos().await.unwrap()[0].id, after.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_both_land() {
    let (wall, _store) = memory_wall(10).await;

    let (a, b) = tokio::join!(
        wall.upload_photo(jpeg("a.jpg")),
        wall.upload_photo(jpeg("b.jpg"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.id, b.id);
    let photos = wall.list_photos().await.unwrap();
    assert_eq!(photos.len(), 2);
    // Newest first by store order
    assert!(photos[0].order_key() > photos[1].order_key());
}

#[tokio::test]
async fn on_change_sees_local_mutations_in_order() {
    let (wall, _store) = memory_wall(1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = wall.on_change({
        let seen = seen.clone();
        move |event| seen.lock().push(event)
    });

    let first = wall.upload_photo(jpeg("1.jpg")).await.unwrap();
    let second = wall.upload_photo(jpeg("2.jpg")).await.unwrap();
    wall.clear_photos().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().len() < 4 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            ChangeEvent::Inserted { record: first.clone() },
            ChangeEvent::Deleted { id: first.id },
            ChangeEvent::Inserted { record: second },
            ChangeEvent::Cleared,
        ]
    );
    drop(handle);
}

#[tokio::test]
async fn display_converges_after_missing_push_events() {
    let store = Arc::new(MemoryStore::new());
    let display = PhotoWall::new(Backend::memory(store.clone()), options(10))
        .await
        .unwrap();
    // Another instance writing to the same backend
    let other = PhotoWall::new(Backend::memory(store.clone()), options(10))
        .await
        .unwrap();

    let driver = display.start_feed(&fast_feed());
    while store.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    let inserted: Arc<Mutex<HashMap<PhotoId, usize>>> = Arc::default();
    let _counter = display.on_change({
        let inserted = inserted.clone();
        move |event| {
            if let ChangeEvent::Inserted { record } = event {
                *inserted.lock().entry(record.id).or_default() += 1;
            }
        }
    });

    let sync = Arc::new(ViewSynchronizer::<_, ()>::new(
        display.clone(),
        Duration::from_secs(3600),
    ));
    let mut changes = sync.changes();
    let runner = tokio::spawn({
        let sync = sync.clone();
        let events = display.events();
        async move { sync.run(events).await }
    });

    store.pause_notifications();
    let a = other.upload_photo(jpeg("a.jpg")).await.unwrap();
    let b = other.upload_photo(jpeg("b.jpg")).await.unwrap();
    store.resume_notifications();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if sync.view().read().len() == 2 {
                break;
            }
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("display never converged");

    assert_eq!(sync.view().read().ids(), vec![b.id, a.id]);

    // Give any stray duplicates a chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;
    let inserted = inserted.lock();
    assert_eq!(inserted.get(&a.id), Some(&1));
    assert_eq!(inserted.get(&b.id), Some(&1));

    runner.abort();
    driver.abort();
}

#[tokio::test]
async fn poll_mode_follows_a_shared_local_document() {
    let dir = tempfile::tempdir().unwrap();
    let display = PhotoWall::new(
        Backend::local(Arc::new(LocalStore::open(dir.path()).await.unwrap())),
        options(10),
    )
    .await
    .unwrap();
    let writer = PhotoWall::new(
        Backend::local(Arc::new(LocalStore::open(dir.path()).await.unwrap())),
        options(10),
    )
    .await
    .unwrap();

    let mut events = display.feed().subscribe();
    let driver = display.start_feed(&fast_feed());

    let photo = writer.upload_photo(jpeg("shared.jpg")).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    // Local store has no push; the driver degrades and announces a resync first
    let event = if event == ChangeEvent::Resync {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    } else {
        event
    };
    assert_eq!(event, ChangeEvent::Inserted { record: photo });
    driver.abort();
}

#[tokio::test]
async fn local_backend_keeps_photos_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let uploaded = {
        let store = Arc::new(LocalStore::open(dir.path()).await.unwrap());
        let wall = PhotoWall::new(Backend::local(store), options(2)).await.unwrap();
        let mut uploaded = Vec::new();
        for i in 0..3 {
            uploaded.push(wall.upload_photo(jpeg(&format!("{i}.jpg"))).await.unwrap());
        }
        uploaded
    };

    let store = Arc::new(LocalStore::open(dir.path()).await.unwrap());
    let wall = PhotoWall::new(Backend::local(store), options(2)).await.unwrap();
    let photos = wall.list_photos().await.unwrap();
    let ids: Vec<PhotoId> = photos.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![uploaded[2].id, uploaded[1].id]);

    // Inline blobs resolve to data URIs and decode back to the upload
    let url = wall.resolve_url(&photos[0].blob_ref).await.unwrap();
    assert!(url.starts_with("data:image/jpeg;base64,"));
    let (_, bytes) = wall.photo_bytes(photos[0].id).await.unwrap().unwrap();
    assert_eq!(bytes.len(), 2048);
}
