//! Integration tests for end-to-end codespace sync.
//!
//! These tests start a real server on a loopback port and connect real
//! WebSocket clients, so frames go through the whole pipeline:
//! socket → decode → relay → peer sockets, and relay → reconciler → store.

use codeshare_sync::client::{CodespaceClient, ConnectionState};
use codeshare_sync::config::ServerConfig;
use codeshare_sync::protocol::{ClientEvent, Selection, ServerEvent, Slug};
use codeshare_sync::server::SyncServer;
use codeshare_sync::storage::{DocumentStore, MemoryStore};
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio::time::{sleep, timeout, Duration, Instant};

const DEBOUNCE: Duration = Duration::from_millis(100);
const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    server: Arc<SyncServer>,
    store: Arc<MemoryStore>,
    url: String,
}

async fn start_test_server() -> TestServer {
    start_with(ServerConfig {
        persist_debounce: DEBOUNCE,
        ..ServerConfig::default()
    })
    .await
}

async fn start_with(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let store = Arc::new(MemoryStore::new());
    let server = Arc::new(SyncServer::with_store(config, store.clone()));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    TestServer { server, store, url }
}

fn slug(s: &str) -> Slug {
    Slug::parse(s).unwrap()
}

async fn connect(url: &str) -> CodespaceClient {
    CodespaceClient::connect_to(url).await.expect("client should connect")
}

/// Wait until the relay has processed joins/leaves for `slug`.
async fn wait_for_room_size(server: &SyncServer, slug: &Slug, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let size = server.relay().room_size(slug.clone()).await.unwrap();
        if size == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "room {slug} stuck at {size} members, wanted {expected}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn expect_event(client: &mut CodespaceClient) -> ServerEvent {
    timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("event within timeout")
        .expect("connection still open")
}

async fn expect_silence(client: &mut CodespaceClient) {
    if let Ok(event) = timeout(QUIET, client.next_event()).await {
        panic!("expected no event, got {event:?}");
    }
}

/// The departed client may see its stream end, but never another update.
async fn expect_no_update(client: &mut CodespaceClient) {
    if let Ok(Some(event)) = timeout(QUIET, client.next_event()).await {
        panic!("departed session still received {event:?}");
    }
}

async fn wait_for_active_connections(server: &SyncServer, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.stats().await.active_connections != expected {
        assert!(Instant::now() < deadline, "active connections never reached {expected}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_persisted(store: &MemoryStore, slug: &Slug, content: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(doc) = store.get(slug) {
            if doc.content == content {
                return;
            }
        }
        assert!(Instant::now() < deadline, "{slug} never persisted {content:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let ts = start_test_server().await;
    let result = tokio_tungstenite::connect_async(ts.url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects() {
    let ts = start_test_server().await;
    let client = connect(&ts.url).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_content_relayed_to_peer_not_sender() {
    let ts = start_test_server().await;
    let room = slug("abc123");

    let mut alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;

    alice.send_content(&room, "hello").await.unwrap();

    assert_eq!(
        expect_event(&mut bob).await,
        ServerEvent::ContentUpdate {
            content: "hello".into()
        }
    );
    expect_silence(&mut alice).await;

    wait_for_persisted(&ts.store, &room, "hello").await;
    let doc = ts.store.get(&room).unwrap();
    assert_eq!(doc.language, "javascript");
}

#[tokio::test]
async fn test_selection_relay_and_clear() {
    let ts = start_test_server().await;
    let room = slug("sel-room");

    let mut alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;

    alice
        .send_selection(&room, Selection::range(3, 9))
        .await
        .unwrap();
    assert_eq!(
        expect_event(&mut bob).await,
        ServerEvent::SelectionUpdate {
            selection: Selection::range(3, 9)
        }
    );

    alice.clear_selection(&room).await.unwrap();
    assert_eq!(expect_event(&mut bob).await, ServerEvent::SelectionClear);
    expect_silence(&mut alice).await;

    // Selections are never persisted
    sleep(QUIET).await;
    assert!(ts.store.get(&room).is_err());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let ts = start_test_server().await;
    let room_a = slug("room-a");
    let room_b = slug("room-b");

    let alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    let mut carol = connect(&ts.url).await;
    alice.join(&room_a).await.unwrap();
    bob.join(&room_a).await.unwrap();
    carol.join(&room_b).await.unwrap();
    wait_for_room_size(&ts.server, &room_a, 2).await;
    wait_for_room_size(&ts.server, &room_b, 1).await;

    alice.send_content(&room_a, "only for a").await.unwrap();

    assert_eq!(
        expect_event(&mut bob).await,
        ServerEvent::ContentUpdate {
            content: "only for a".into()
        }
    );
    expect_silence(&mut carol).await;
}

#[tokio::test]
async fn test_edits_arrive_in_send_order() {
    let ts = start_test_server().await;
    let room = slug("ordered");

    let alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;

    for i in 0..50 {
        alice.send_content(&room, format!("v{i}")).await.unwrap();
    }

    for i in 0..50 {
        assert_eq!(
            expect_event(&mut bob).await,
            ServerEvent::ContentUpdate {
                content: format!("v{i}")
            }
        );
    }

    // The burst coalesces into one write of the last version
    wait_for_persisted(&ts.store, &room, "v49").await;
    sleep(QUIET).await;
    assert_eq!(ts.store.upsert_count(), 1);
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let ts = start_test_server().await;
    let room = slug("leaving");

    let mut alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;

    bob.close().await;
    wait_for_room_size(&ts.server, &room, 1).await;

    // Remaining member keeps working
    let mut carol = connect(&ts.url).await;
    carol.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;
    carol.send_content(&room, "still here").await.unwrap();
    assert_eq!(
        expect_event(&mut alice).await,
        ServerEvent::ContentUpdate {
            content: "still here".into()
        }
    );
    expect_no_update(&mut bob).await;

    wait_for_active_connections(&ts.server, 2).await;
    assert_eq!(ts.server.stats().await.total_connections, 3);
}

#[tokio::test]
async fn test_dropped_socket_without_close_frame_is_disconnected() {
    let ts = start_test_server().await;
    let room = slug("cut-cable");

    let mut alice = connect(&ts.url).await;
    alice.join(&room).await.unwrap();

    let (mut raw, _) = tokio_tungstenite::connect_async(ts.url.as_str()).await.unwrap();
    let join = ClientEvent::JoinRoom { slug: room.clone() }.encode().unwrap();
    raw.send(Message::Text(join.into())).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;
    wait_for_active_connections(&ts.server, 2).await;

    // Tear down the TCP stream with no close handshake
    drop(raw);
    wait_for_room_size(&ts.server, &room, 1).await;
    wait_for_active_connections(&ts.server, 1).await;
    assert_eq!(ts.server.relay().stats().await.unwrap().active_sessions, 1);

    // The survivor keeps receiving from new peers
    let bob = connect(&ts.url).await;
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;
    bob.send_content(&room, "after the drop").await.unwrap();
    assert_eq!(
        expect_event(&mut alice).await,
        ServerEvent::ContentUpdate {
            content: "after the drop".into()
        }
    );

    // Only alice was a target; nothing queued for the vanished session
    let relay = ts.server.relay().stats().await.unwrap();
    assert_eq!(relay.frames_delivered, 1);
    assert_eq!(relay.frames_dropped, 0);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped_not_fatal() {
    let ts = start_test_server().await;
    let room = slug("sturdy");

    let alice = connect(&ts.url).await;
    let mut bob = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    bob.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 2).await;

    alice.send_raw("this is not json").await.unwrap();
    alice
        .send_raw(r#"{"event":"content-change","slug":"bad slug!","content":"x"}"#)
        .await
        .unwrap();
    alice.send_raw(r#"{"event":"launch-rockets"}"#).await.unwrap();
    alice.send_content(&room, "after garbage").await.unwrap();

    assert_eq!(
        expect_event(&mut bob).await,
        ServerEvent::ContentUpdate {
            content: "after garbage".into()
        }
    );
    assert_eq!(ts.server.stats().await.malformed_frames, 3);
}

#[tokio::test]
async fn test_load_document_creates_default() {
    let ts = start_test_server().await;
    let room = slug("fresh-doc");

    let mut alice = connect(&ts.url).await;
    alice.load_document(&room).await.unwrap();

    assert_eq!(
        expect_event(&mut alice).await,
        ServerEvent::Document {
            slug: room.clone(),
            content: String::new(),
            language: "javascript".into(),
        }
    );
    assert!(ts.store.get(&room).is_ok());
}

#[tokio::test]
async fn test_reconnect_recovers_persisted_state() {
    let ts = start_test_server().await;
    let room = slug("comeback");

    let mut alice = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    alice
        .send_content_with_language(&room, "fn main() {}", "rust")
        .await
        .unwrap();
    wait_for_persisted(&ts.store, &room, "fn main() {}").await;
    alice.close().await;

    // A new connection is a new session; state comes back from the store
    let mut again = connect(&ts.url).await;
    again.join(&room).await.unwrap();
    again.load_document(&room).await.unwrap();
    assert_eq!(
        expect_event(&mut again).await,
        ServerEvent::Document {
            slug: room.clone(),
            content: "fn main() {}".into(),
            language: "rust".into(),
        }
    );
}

#[tokio::test]
async fn test_switching_rooms_stops_old_room_traffic() {
    let ts = start_test_server().await;
    let first = slug("first");
    let second = slug("second");

    let mut alice = connect(&ts.url).await;
    let bob = connect(&ts.url).await;
    alice.join(&first).await.unwrap();
    bob.join(&first).await.unwrap();
    wait_for_room_size(&ts.server, &first, 2).await;

    alice.join(&second).await.unwrap();
    wait_for_room_size(&ts.server, &first, 1).await;

    bob.send_content(&first, "you left").await.unwrap();
    expect_silence(&mut alice).await;
}

#[tokio::test]
async fn test_echo_to_sender_when_enabled() {
    let ts = start_with(ServerConfig {
        persist_debounce: DEBOUNCE,
        echo_to_sender: true,
        ..ServerConfig::default()
    })
    .await;
    let room = slug("echo");

    let mut alice = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    wait_for_room_size(&ts.server, &room, 1).await;

    alice.send_content(&room, "mine").await.unwrap();
    assert_eq!(
        expect_event(&mut alice).await,
        ServerEvent::ContentUpdate {
            content: "mine".into()
        }
    );
}

#[tokio::test]
async fn test_shutdown_flushes_unsaved_edits() {
    let ts = start_with(ServerConfig {
        persist_debounce: Duration::from_secs(60),
        ..ServerConfig::default()
    })
    .await;
    let room = slug("unsaved");

    let alice = connect(&ts.url).await;
    alice.join(&room).await.unwrap();
    alice.send_content(&room, "draft").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !ts.server.reconciler().has_pending(&room) {
        assert!(Instant::now() < deadline, "edit never reached the reconciler");
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(ts.server.shutdown().await, 1);
    assert_eq!(ts.store.get(&room).unwrap().content, "draft");
}
