//! Integration tests for the WebSocket relay.
//!
//! These start a real relay on a free port and connect real clients
//! through `WsPubSub`, verifying broadcast fan-out, presence and session
//! sync over the network.

use std::sync::Arc;

use backline_collab::{
    BroadcastMessage, ChannelEvent, ChannelHandle, CollabConfig, DocumentSession, EventFilter,
    LocalHub, MemberInfo, MemoryStore, PubSub, RelayServer, ServerConfig, SessionEvent,
    SessionOptions, SessionServices, WsPubSub,
};
use backline_core::{DocumentType, FieldMap, PresenceUser};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Start a relay on a free port and return its URL and hub.
async fn start_relay() -> (String, LocalHub) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::default()
    });
    let hub = server.hub().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://{addr}"), hub)
}

async fn join(url: &str, channel: &str, name: &str) -> (ChannelHandle, MemberInfo) {
    let member = MemberInfo::new(Uuid::new_v4(), name);
    let handle = WsPubSub::new(url)
        .open_channel(channel, member.clone(), EventFilter::ALL)
        .await
        .unwrap();
    (handle, member)
}

async fn next_event(handle: &mut ChannelHandle) -> ChannelEvent {
    timeout(Duration::from_secs(2), handle.events.recv())
        .await
        .expect("timed out waiting for relay event")
        .expect("relay closed the channel")
}

async fn next_broadcast(handle: &mut ChannelHandle) -> (MemberInfo, BroadcastMessage) {
    loop {
        if let ChannelEvent::Broadcast { sender, message } = next_event(handle).await {
            return (sender, message);
        }
    }
}

#[tokio::test]
async fn test_broadcast_reaches_other_member_only() {
    let (url, _hub) = start_relay().await;
    let (mut alice, alice_info) = join(&url, "stage_plots:1", "Alice").await;
    let (mut bob, _) = join(&url, "stage_plots:1", "Bob").await;

    let message = BroadcastMessage::CursorMove {
        user_id: alice_info.user_id,
        field: "title".into(),
        cursor: 3,
    };
    alice.link.publish(&message).await.unwrap();

    let (sender, received) = next_broadcast(&mut bob).await;
    assert_eq!(sender, alice_info);
    assert_eq!(received, message);

    // Alice never hears her own message.
    let own = timeout(Duration::from_millis(200), async {
        loop {
            if let ChannelEvent::Broadcast { .. } = next_event(&mut alice).await {
                return;
            }
        }
    })
    .await;
    assert!(own.is_err());
}

#[tokio::test]
async fn test_channels_do_not_leak() {
    let (url, _hub) = start_relay().await;
    let (alice, alice_info) = join(&url, "stage_plots:1", "Alice").await;
    let (mut carol, _) = join(&url, "stage_plots:2", "Carol").await;

    alice
        .link
        .publish(&BroadcastMessage::SyncRequest {
            user_id: alice_info.user_id,
        })
        .await
        .unwrap();

    let leaked = timeout(Duration::from_millis(200), next_broadcast(&mut carol)).await;
    assert!(leaked.is_err());
}

#[tokio::test]
async fn test_presence_roster_over_relay() {
    let (url, hub) = start_relay().await;
    let (alice, alice_info) = join(&url, "run_of_shows:7", "Alice").await;
    let (mut bob, _) = join(&url, "run_of_shows:7", "Bob").await;

    alice
        .link
        .track(PresenceUser::new(alice_info.user_id, "Alice"))
        .await
        .unwrap();

    let roster = loop {
        if let ChannelEvent::Presence(roster) = next_event(&mut bob).await {
            if !roster.is_empty() {
                break roster;
            }
        }
    };
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].display_name, "Alice");
    assert_eq!(hub.member_count("run_of_shows:7").await, 2);
    assert_eq!(bob.link.presence_snapshot().await.unwrap(), roster);

    alice.link.close().await;
    let roster = loop {
        if let ChannelEvent::Presence(roster) = next_event(&mut bob).await {
            if roster.is_empty() {
                break roster;
            }
        }
    };
    assert!(roster.is_empty());
}

#[tokio::test]
async fn test_kick_closes_remote_subscription() {
    let (url, hub) = start_relay().await;
    let (mut alice, _) = join(&url, "pixel_maps:3", "Alice").await;

    assert_eq!(hub.kick_all("maintenance").await, 1);

    let reason = loop {
        match next_event(&mut alice).await {
            ChannelEvent::Error(reason) => break reason,
            _ => continue,
        }
    };
    assert_eq!(reason, "maintenance");
    let closed = timeout(Duration::from_secs(2), alice.events.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_sessions_sync_through_relay() {
    let (url, _hub) = start_relay().await;
    let doc = Uuid::new_v4();
    let store = MemoryStore::new();
    let mut initial = FieldMap::new();
    initial.insert("title".into(), json!("Main Stage"));
    store
        .seed(DocumentType::StagePlot, doc, 1, initial.clone())
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = CollabConfig::for_testing(dir.path().join("queue"));
    let services = SessionServices::new(Arc::new(store.clone()))
        .with_pubsub(Arc::new(WsPubSub::new(url.as_str())));

    let open = |name: &str| {
        let options = SessionOptions::new(
            doc,
            DocumentType::StagePlot,
            PresenceUser::new(Uuid::new_v4(), name),
            initial.clone(),
            1,
        )
        .with_config(config.clone());
        DocumentSession::spawn(options, services.clone())
    };
    let alice = open("Alice");
    let mut bob = open("Bob");
    let mut bob_events = bob.take_event_rx().unwrap();

    let mut roster = alice.watch_roster();
    timeout(Duration::from_secs(5), roster.wait_for(|r| r.len() == 2))
        .await
        .unwrap()
        .unwrap();

    alice.edit("title", json!("Side Stage")).await.unwrap();
    let saved = alice.force_save().await.unwrap().unwrap();
    assert_eq!(saved.version(), Some(2));

    let update = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SessionEvent::RemoteUpdate { fields, version }) = bob_events.recv().await {
                return (fields, version);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update.0["title"], json!("Side Stage"));
    assert_eq!(update.1, Some(2));
    assert_eq!(store.write_count(), 1);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}
