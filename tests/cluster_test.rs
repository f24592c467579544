//! 双节点集群测试 / Two-node cluster tests
//!
//! 两个枢纽共享同一个存储与发布订阅总线，模拟多进程部署。
//! Two hubs share one store and one pub/sub bus, standing in for a multi-process deployment.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

use v_connect_hub::cluster::memory::InMemoryFanOut;
use v_connect_hub::domain::message::{InboundMessage, Outbound, ServerFrame};
use v_connect_hub::domain::model::{DeliveryPolicy, Identity, MessageType, PresenceStatus, RoomSpec, Visibility};
use v_connect_hub::server::Connection;
use v_connect_hub::service::router::RouteOutcome;
use v_connect_hub::storage::memory::MemoryStore;
use v_connect_hub::storage::MessageStore;
use v_connect_hub::{DisconnectReason, HubConfig, ImHub};

struct Cluster {
    a: ImHub,
    b: ImHub,
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryFanOut>,
    _shutdown: watch::Sender<bool>,
}

fn node(node_id: &str, store: Arc<MemoryStore>, bus: Arc<InMemoryFanOut>) -> ImHub {
    let mut cfg = HubConfig::default();
    cfg.server.node_id = node_id.to_string();
    cfg.cluster_enabled = true;
    cfg.store.retry_backoff_ms = 1;
    ImHub::builder(cfg).with_memory_store(store).with_fanout(bus).build().unwrap()
}

fn cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryFanOut::new());
    let a = node("node-a", store.clone(), bus.clone());
    let b = node("node-b", store.clone(), bus.clone());
    let (tx, rx) = watch::channel(false);
    a.cluster.spawn_listeners(rx.clone());
    b.cluster.spawn_listeners(rx);
    Cluster { a, b, store, bus, _shutdown: tx }
}

async fn connect(hub: &ImHub, user: &str) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = hub.admit(Identity::new(user), "127.0.0.1:50000".parse().unwrap(), tx).await.unwrap();
    (conn, rx)
}

async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Outbound>, mut pred: F) -> ServerFrame
where
    F: FnMut(&ServerFrame) -> bool,
{
    let found = timeout(Duration::from_secs(2), async {
        while let Some(item) = rx.recv().await {
            if let Outbound::Frame(frame) = item {
                if pred(&frame) {
                    return Some(frame);
                }
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(frame)) => frame,
        _ => panic!("expected frame did not arrive"),
    }
}

fn private(to: &str, text: &str) -> InboundMessage {
    InboundMessage {
        kind: MessageType::Private,
        target_id: Some(to.to_string()),
        room_id: None,
        payload: serde_json::json!({ "text": text }),
    }
}

#[tokio::test]
async fn private_message_crosses_nodes() {
    let c = cluster();
    let (alice, _alice_rx) = connect(&c.a, "alice").await;
    let (_bob, mut bob_rx) = connect(&c.b, "bob").await;

    let routed = c.a.router.route(&alice, private("bob", "hi")).await.unwrap();
    assert_eq!(routed.outcome, RouteOutcome::DeliveredLive);

    match wait_for(&mut bob_rx, |f| matches!(f, ServerFrame::Message(_))).await {
        ServerFrame::Message(m) => assert_eq!(m.payload["text"], "hi"),
        _ => unreachable!(),
    }
    let stored = c.store.get_message(routed.message_id).await.unwrap().unwrap();
    assert!(stored.delivered);
}

#[tokio::test]
async fn presence_is_shared_and_announced_cluster_wide() {
    let c = cluster();
    let (_alice, mut alice_rx) = connect(&c.a, "alice").await;
    let (bob, _bob_rx) = connect(&c.b, "bob").await;

    wait_for(&mut alice_rx, |f| {
        matches!(f, ServerFrame::UserStatusChanged { user_id, status: PresenceStatus::Online } if user_id == "bob")
    })
    .await;
    let online: Vec<String> = c.a.presence.get_online_users(None).await.unwrap().into_iter().map(|r| r.user_id).collect();
    assert_eq!(online, vec!["alice".to_string(), "bob".to_string()]);

    c.b.disconnect(&bob.connection_id, DisconnectReason::ClientClosed).await;
    wait_for(&mut alice_rx, |f| {
        matches!(f, ServerFrame::UserStatusChanged { user_id, status: PresenceStatus::Offline } if user_id == "bob")
    })
    .await;
}

#[tokio::test]
async fn same_user_on_two_nodes_counts_both_connections() {
    let c = cluster();
    let (first, _rx1) = connect(&c.a, "carol").await;
    let (_second, _rx2) = connect(&c.b, "carol").await;
    assert_eq!(c.a.presence.connection_count("carol").await.unwrap(), 2);

    c.a.disconnect(&first.connection_id, DisconnectReason::ClientClosed).await;
    let rec = c.b.presence.get("carol").await.unwrap().unwrap();
    assert_eq!(rec.connection_count, 1);
    assert_eq!(rec.status, PresenceStatus::Online);
}

#[tokio::test]
async fn room_messages_reach_members_on_other_nodes() {
    let c = cluster();
    let (alice, mut alice_rx) = connect(&c.a, "alice").await;
    let (bob, mut bob_rx) = connect(&c.b, "bob").await;

    let room = c
        .a
        .rooms
        .create_room(RoomSpec {
            name: "ops".into(),
            visibility: Visibility::Public,
            owner_id: "alice".into(),
            max_members: None,
            delivery_policy: DeliveryPolicy::BestEffort,
        })
        .await
        .unwrap();
    c.a.registry.associate_room(&alice.connection_id, &room.room_id);
    c.b.rooms.join_room(&bob.connection_id, &room.room_id).await.unwrap();
    wait_for(&mut alice_rx, |f| matches!(f, ServerFrame::MemberJoined { user_id, .. } if user_id == "bob")).await;

    let inbound = InboundMessage {
        kind: MessageType::Room,
        target_id: None,
        room_id: Some(room.room_id.clone()),
        payload: serde_json::json!("deploy at noon"),
    };
    c.a.router.route(&alice, inbound).await.unwrap();
    match wait_for(&mut bob_rx, |f| matches!(f, ServerFrame::Message(_))).await {
        ServerFrame::Message(m) => assert_eq!(m.room_id.as_deref(), Some(room.room_id.as_str())),
        _ => unreachable!(),
    }

    c.a.rooms.delete_room(&room.room_id, &Identity::new("alice")).await.unwrap();
    wait_for(&mut bob_rx, |f| matches!(f, ServerFrame::RoomClosed { .. })).await;
    assert!(c.b.registry.get(&bob.connection_id).unwrap().joined_rooms.lock().is_empty());
}

#[tokio::test]
async fn unavailable_bus_falls_back_to_offline_queue() {
    let c = cluster();
    let (alice, _alice_rx) = connect(&c.a, "alice").await;
    let (_bob, mut bob_rx) = connect(&c.b, "bob").await;
    c.bus.set_available(false);

    let routed = c.a.router.route(&alice, private("bob", "lost in transit")).await.unwrap();
    assert_eq!(routed.outcome, RouteOutcome::QueuedOffline);
    assert_eq!(c.b.offline.pending("bob").await.unwrap(), 1);
    while let Ok(item) = bob_rx.try_recv() {
        assert!(!matches!(item, Outbound::Frame(ServerFrame::Message(_))));
    }

    c.bus.set_available(true);
    let (_bob_again, mut again_rx) = connect(&c.b, "bob").await;
    match wait_for(&mut again_rx, |f| matches!(f, ServerFrame::Message(_))).await {
        ServerFrame::Message(m) => assert!(m.offline),
        _ => unreachable!(),
    }
    assert_eq!(c.b.offline.pending("bob").await.unwrap(), 0);
}
