use event_wall::api::{create_router, AppState};
use event_wall::config::ApiConfig;
use event_wall::{
    Backend, ChangeEvent, MemoryStore, PhotoUpload, PhotoWall, ViewSynchronizer, WallClient,
    WallOptions,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn jpeg(name: &str) -> PhotoUpload {
    PhotoUpload::new(vec![0xD8; 2048], "image/jpeg", name)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out waiting for {what}");
    }
}

async fn serve(wall: PhotoWall) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(AppState { wall }, &ApiConfig::default());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, handle)
}

/// TCP relay in front of the server. Sending on the returned channel drops
/// every connection open at that moment, as a network blip would.
async fn relay(upstream: SocketAddr) -> (SocketAddr, broadcast::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (cut, _) = broadcast::channel::<()>(4);

    let handle = tokio::spawn({
        let cut = cut.clone();
        async move {
            loop {
                let Ok((mut inbound, _)) = listener.accept().await else {
                    return;
                };
                let mut cut_rx = cut.subscribe();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = cut_rx.recv() => {}
                    }
                });
            }
        }
    });
    (addr, cut, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_view_resyncs_after_reconnect() {
    let store = Arc::new(MemoryStore::new());
    let wall = PhotoWall::new(Backend::memory(store), WallOptions::default())
        .await
        .unwrap();
    let (server_addr, server) = serve(wall.clone()).await;
    let (relay_addr, cut, relay) = relay(server_addr).await;

    let client = WallClient::new(format!("http://{relay_addr}"))
        .with_reconnect_delays(Duration::from_millis(10), Duration::from_millis(50));

    let seen: Arc<Mutex<Vec<ChangeEvent>>> = Arc::default();
    let events = client.events().inspect({
        let seen = seen.clone();
        move |event| seen.lock().push(event.clone())
    });

    let sync = Arc::new(ViewSynchronizer::<_, ()>::new(
        client.clone(),
        Duration::from_secs(3600),
    ));
    let runner = tokio::spawn({
        let sync = sync.clone();
        async move { sync.run(events).await }
    });

    wait_for("the change stream to connect", || {
        wall.feed().subscriber_count() > 0
    })
    .await;

    let first = wall.upload_photo(jpeg("first.jpg")).await.unwrap();
    wait_for("the first photo to reach the view", || {
        sync.view().read().contains(first.id)
    })
    .await;
    assert!(!seen.lock().contains(&ChangeEvent::Resync));

    // Drop the stream; the next upload may happen while nobody listens
    cut.send(()).unwrap();
    let second = wall.upload_photo(jpeg("second.jpg")).await.unwrap();

    wait_for("a resync after reconnecting", || {
        seen.lock().contains(&ChangeEvent::Resync)
    })
    .await;
    wait_for("the view to converge", || {
        sync.view().read().ids() == vec![second.id, first.id]
    })
    .await;

    // Events keep flowing over the new connection
    let third = wall.upload_photo(jpeg("third.jpg")).await.unwrap();
    wait_for("the third photo to reach the view", || {
        sync.view().read().ids() == vec![third.id, second.id, first.id]
    })
    .await;

    runner.abort();
    relay.abort();
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_operations_round_trip_through_the_server() {
    let store = Arc::new(MemoryStore::new());
    let wall = PhotoWall::new(Backend::memory(store), WallOptions::default())
        .await
        .unwrap();
    let (addr, server) = serve(wall.clone()).await;
    let client = WallClient::new(format!("http://{addr}/"));

    let uploaded = client
        .upload(vec![1u8; 4096], "image/webp", "dance.webp", Some("DJ"))
        .await
        .unwrap();
    assert_eq!(uploaded.record.uploader_label.as_deref(), Some("DJ"));

    let listed = client.list().await.unwrap();
    assert_eq!(listed, vec![uploaded.clone()]);
    assert_eq!(client.get(uploaded.record.id).await.unwrap(), Some(uploaded.clone()));

    let rejected = client.upload(vec![1u8; 10], "image/webp", "tiny.webp", None).await;
    assert!(matches!(
        rejected,
        Err(event_wall::ClientError::Http { status: 400, .. })
    ));

    assert!(client.delete(uploaded.record.id).await.unwrap());
    assert!(!client.delete(uploaded.record.id).await.unwrap());
    assert_eq!(client.get(uploaded.record.id).await.unwrap(), None);

    client
        .upload(vec![1u8; 4096], "image/gif", "a.gif", None)
        .await
        .unwrap();
    assert_eq!(client.clear().await.unwrap(), 1);
    assert!(wall.list_photos().await.unwrap().is_empty());

    server.abort();
}
