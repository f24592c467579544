//! 消息路由状态机 / Message router state machine
//!
//! `received → validated → (delivered_live | queued_offline | broadcast | rejected)`
//!
//! 校验是同步的，在任何异步 I/O 之前完成；被拒绝的消息不落库。
//! Validation is synchronous and happens before any asynchronous I/O; rejected messages are never
//! persisted.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::{ClusterBroadcaster, FanOutReport, RemoteDelivery};
use crate::config::StoreConfig;
use crate::domain::message::{DeliveryStatus, InboundMessage, MessageFrame, ServerFrame};
use crate::domain::model::{
    now_ms, DeliveryPolicy, Message, MessageId, MessageType, RoomId, UserId,
};
use crate::error::{HubError, HubResult};
use crate::presence::PresenceStore;
use crate::room::RoomManager;
use crate::server::registry::{Connection, ConnectionRegistry};
use crate::service::offline::OfflineQueue;
use crate::service::rate_limit::{RateDecision, RateLimiter};
use crate::storage::retry::with_retry;
use crate::storage::MessageStore;

/// 路由终态 / Terminal routing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    DeliveredLive,
    QueuedOffline,
    Broadcast,
}

impl RouteOutcome {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            RouteOutcome::DeliveredLive => DeliveryStatus::Delivered,
            RouteOutcome::QueuedOffline => DeliveryStatus::Queued,
            RouteOutcome::Broadcast => DeliveryStatus::Broadcast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routed {
    pub message_id: MessageId,
    pub outcome: RouteOutcome,
}

/// 校验后的投递目标 / Delivery target after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(UserId),
    Room(RoomId),
    Everyone,
}

/// 已校验消息 / Validated message
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub kind: MessageType,
    pub target: Target,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    presence: PresenceStore,
    rooms: RoomManager,
    offline: OfflineQueue,
    messages: Arc<dyn MessageStore>,
    cluster: ClusterBroadcaster,
    limiter: Arc<RateLimiter>,
    max_payload_bytes: usize,
    retry: StoreConfig,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ConnectionRegistry,
        presence: PresenceStore,
        rooms: RoomManager,
        offline: OfflineQueue,
        messages: Arc<dyn MessageStore>,
        cluster: ClusterBroadcaster,
        limiter: Arc<RateLimiter>,
        max_payload_bytes: usize,
        retry: StoreConfig,
    ) -> Self {
        Self { registry, presence, rooms, offline, messages, cluster, limiter, max_payload_bytes, retry }
    }

    /// 完整处理一条客户端消息并回执 / Route one client message and acknowledge the sender
    pub async fn route(&self, sender: &Connection, inbound: InboundMessage) -> HubResult<Routed> {
        let validated = self.validate(sender, inbound)?;
        let routed = self.dispatch(Some(sender), validated).await?;
        sender.send(ServerFrame::MessageSent { message_id: routed.message_id, status: routed.outcome.status() })?;
        Ok(routed)
    }

    /// 同步校验 + 限流 / Structural checks followed by the rate limiter
    pub fn validate(&self, sender: &Connection, inbound: InboundMessage) -> HubResult<ValidatedMessage> {
        let InboundMessage { kind, target_id, room_id, payload } = inbound;
        if is_empty_payload(&payload) {
            return Err(HubError::validation("payload", "payload must not be empty"));
        }
        let size = serde_json::to_vec(&payload)
            .map_err(|e| HubError::validation("payload", e.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(HubError::validation(
                "payload",
                format!("payload is {} bytes, limit is {}", size, self.max_payload_bytes),
            ));
        }
        let target_id = target_id.filter(|s| !s.is_empty());
        let room_id = room_id.filter(|s| !s.is_empty());
        let target = match kind {
            MessageType::Private => Target::User(target_id.ok_or_else(|| HubError::validation("targetId", "required"))?),
            MessageType::Room => Target::Room(room_id.ok_or_else(|| HubError::validation("roomId", "required"))?),
            MessageType::System => {
                if !sender.identity.privileged {
                    return Err(HubError::permission("system messages require a privileged identity"));
                }
                Target::Everyone
            }
            MessageType::File => {
                validate_file_reference(&payload)?;
                match (room_id, target_id) {
                    (Some(room), _) => Target::Room(room),
                    (None, Some(user)) => Target::User(user),
                    (None, None) => return Err(HubError::validation("targetId", "targetId or roomId required")),
                }
            }
        };
        if let RateDecision::Denied { retry_after_ms } = self.limiter.consume(&sender.connection_id, 1) {
            return Err(HubError::RateLimited { retry_after_ms });
        }
        Ok(ValidatedMessage { kind, target, payload })
    }

    /// 按目标类型投递 / Deliver according to the target
    pub async fn dispatch(&self, sender: Option<&Connection>, msg: ValidatedMessage) -> HubResult<Routed> {
        let message_id = with_retry(&self.retry, "allocate message id", || self.messages.next_message_id()).await?;
        let (target_id, room_id) = match &msg.target {
            Target::User(u) => (Some(u.clone()), None),
            Target::Room(r) => (Some(r.clone()), Some(r.clone())),
            Target::Everyone => (None, None),
        };
        let message = Message {
            message_id,
            kind: msg.kind,
            sender_id: sender.map(|c| c.user_id().to_string()),
            target_id,
            room_id,
            payload: msg.payload,
            created_at: now_ms(),
            delivered: false,
        };
        let outcome = match &msg.target {
            Target::User(user_id) => self.to_user(message, user_id).await?,
            Target::Room(room_id) => self.to_room(message, room_id, sender).await?,
            Target::Everyone => self.to_everyone(message).await?,
        };
        debug!("📨 message {} -> {:?}", message_id, outcome);
        Ok(Routed { message_id, outcome })
    }

    /// 服务端系统广播 / Server-side system broadcast for trusted callers
    pub async fn broadcast_system(&self, payload: serde_json::Value) -> HubResult<MessageId> {
        if is_empty_payload(&payload) {
            return Err(HubError::validation("payload", "payload must not be empty"));
        }
        let routed = self
            .dispatch(None, ValidatedMessage { kind: MessageType::System, target: Target::Everyone, payload })
            .await?;
        Ok(routed.message_id)
    }

    async fn to_user(&self, mut message: Message, user_id: &str) -> HubResult<RouteOutcome> {
        if self.is_live(user_id).await {
            message.delivered = true;
            self.persist(&message).await?;
            let frame = ServerFrame::Message(MessageFrame::from_message(&message, false));
            let report = self.cluster.to_users(vec![user_id.to_string()], None, frame).await;
            if report.local > 0 || report.remote == RemoteDelivery::Published {
                return Ok(RouteOutcome::DeliveredLive);
            }
            warn!("⚠️  no live path to {} for message {}, queueing", user_id, message.message_id);
        }
        message.delivered = false;
        self.persist(&message).await?;
        self.offline.enqueue(user_id, message.message_id).await?;
        Ok(RouteOutcome::QueuedOffline)
    }

    async fn to_room(&self, message: Message, room_id: &str, sender: Option<&Connection>) -> HubResult<RouteOutcome> {
        let room = self.rooms.get_room(room_id).await?;
        if let Some(conn) = sender {
            if !room.is_member(conn.user_id()) {
                return Err(HubError::permission(format!("not a member of room {}", room_id)));
            }
        }
        self.persist(&message).await?;
        let members: Vec<UserId> = room.member_ids.iter().cloned().collect();
        let frame = ServerFrame::Message(MessageFrame::from_message(&message, false));
        let exclude = sender.map(|c| c.connection_id.clone());
        let report = self.cluster.to_users(members.clone(), exclude, frame).await;
        self.mark_if_handed(&message, report).await?;

        if room.delivery_policy == DeliveryPolicy::Guaranteed {
            let sender_id = message.sender_id.as_deref();
            for member in members.iter().filter(|m| Some(m.as_str()) != sender_id) {
                if !self.is_live(member).await {
                    self.offline.enqueue(member, message.message_id).await?;
                }
            }
        }
        if let Err(e) = self.rooms.touch(room_id).await {
            debug!("room touch skipped: {}", e);
        }
        Ok(RouteOutcome::Broadcast)
    }

    async fn to_everyone(&self, message: Message) -> HubResult<RouteOutcome> {
        self.persist(&message).await?;
        let frame = ServerFrame::Message(MessageFrame::from_message(&message, false));
        let report = self.cluster.to_all(frame).await;
        self.mark_if_handed(&message, report).await?;
        Ok(RouteOutcome::Broadcast)
    }

    /// 在线判定：共享计数或本地注册表 / Live if the shared counter or the local registry says so
    async fn is_live(&self, user_id: &str) -> bool {
        if self.registry.has_user(user_id) {
            return true;
        }
        match self.presence.connection_count(user_id).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!("⚠️  presence lookup for {} failed: {}", user_id, e);
                false
            }
        }
    }

    async fn persist(&self, message: &Message) -> HubResult<()> {
        with_retry(&self.retry, "persist message", || self.messages.persist_message(message)).await
    }

    async fn mark_if_handed(&self, message: &Message, report: FanOutReport) -> HubResult<()> {
        if report.local > 0 || report.remote == RemoteDelivery::Published {
            with_retry(&self.retry, "mark delivered", || self.messages.mark_delivered(message.message_id)).await?;
        }
        Ok(())
    }
}

fn is_empty_payload(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// 文件消息只携带引用 / File messages carry a reference, never inline bytes
fn validate_file_reference(payload: &serde_json::Value) -> HubResult<()> {
    let location = payload.get("location").and_then(|v| v.as_str()).unwrap_or_default();
    if location.trim().is_empty() {
        return Err(HubError::validation("payload.location", "file location must be a non-empty string"));
    }
    if !payload.get("metadata").map(|m| m.is_object()).unwrap_or(false) {
        return Err(HubError::validation("payload.metadata", "file metadata must be an object"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{RoomSpec, Visibility};
    use crate::server::testing::{connect, frames, test_hub, TestHub};
    use crate::storage::RoomStore;
    use serde_json::json;

    fn inbound(kind: MessageType, target: Option<&str>, room: Option<&str>, payload: serde_json::Value) -> InboundMessage {
        InboundMessage { kind, target_id: target.map(String::from), room_id: room.map(String::from), payload }
    }

    fn message_frames(frames: &[ServerFrame]) -> Vec<MessageFrame> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn private_to_live_user_reaches_every_connection() {
        let TestHub { hub, store, .. } = test_hub(|_| {});
        let (a, mut a_rx) = connect(&hub, "a").await;
        let (_b1, mut b1_rx) = connect(&hub, "b").await;
        let (_b2, mut b2_rx) = connect(&hub, "b").await;
        frames(&mut b1_rx);
        frames(&mut b2_rx);

        let routed = hub.router.route(&a, inbound(MessageType::Private, Some("b"), None, json!({"text": "hi"}))).await.unwrap();
        assert_eq!(routed.outcome, RouteOutcome::DeliveredLive);
        assert_eq!(message_frames(&frames(&mut b1_rx)).len(), 1);
        assert_eq!(message_frames(&frames(&mut b2_rx)).len(), 1);
        assert_eq!(hub.offline.pending("b").await.unwrap(), 0);
        assert!(store.get_message(routed.message_id).await.unwrap().unwrap().delivered);
        assert!(frames(&mut a_rx).contains(&ServerFrame::MessageSent {
            message_id: routed.message_id,
            status: DeliveryStatus::Delivered
        }));
    }

    #[tokio::test]
    async fn private_to_offline_user_is_queued_once() {
        let TestHub { hub, store, .. } = test_hub(|_| {});
        let (a, _a_rx) = connect(&hub, "a").await;
        let routed = hub.router.route(&a, inbound(MessageType::Private, Some("ghost"), None, json!("hello"))).await.unwrap();
        assert_eq!(routed.outcome, RouteOutcome::QueuedOffline);
        assert_eq!(hub.offline.pending("ghost").await.unwrap(), 1);
        assert!(!store.get_message(routed.message_id).await.unwrap().unwrap().delivered);
    }

    #[tokio::test]
    async fn validation_rejects_before_persisting() {
        let TestHub { hub, store, .. } = test_hub(|cfg| cfg.max_payload_bytes = 16);
        let (a, _a_rx) = connect(&hub, "a").await;
        let cases = vec![
            inbound(MessageType::Private, Some("b"), None, json!(null)),
            inbound(MessageType::Private, None, None, json!("x")),
            inbound(MessageType::Room, None, None, json!("x")),
            inbound(MessageType::Private, Some("b"), None, json!("this payload is far too long")),
            inbound(MessageType::File, Some("b"), None, json!({"location": "", "metadata": {}})),
            inbound(MessageType::File, Some("b"), None, json!({"location": "s3://x"})),
        ];
        for case in cases {
            let err = hub.router.route(&a, case).await.unwrap_err();
            assert!(matches!(err, HubError::Validation { .. }), "unexpected {:?}", err);
        }
        let err = hub.router.route(&a, inbound(MessageType::System, None, None, json!("x"))).await.unwrap_err();
        assert!(matches!(err, HubError::PermissionDenied { .. }));
        assert_eq!(store.next_message_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn excess_messages_are_rate_limited() {
        let TestHub { hub, .. } = test_hub(|cfg| {
            cfg.rate_limit.points = 3;
            cfg.rate_limit.window_ms = 60_000;
        });
        let (a, _a_rx) = connect(&hub, "a").await;
        let mut limited = 0;
        for _ in 0..5 {
            match hub.router.route(&a, inbound(MessageType::Private, Some("b"), None, json!("x"))).await {
                Ok(_) => {}
                Err(HubError::RateLimited { retry_after_ms }) => {
                    assert!(retry_after_ms > 0);
                    limited += 1;
                }
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        assert_eq!(limited, 2);
    }

    #[tokio::test]
    async fn room_message_excludes_origin_and_keeps_order() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (a1, mut a1_rx) = connect(&hub, "a").await;
        let (_a2, mut a2_rx) = connect(&hub, "a").await;
        let (b, mut b_rx) = connect(&hub, "b").await;
        let (c, _) = connect(&hub, "c").await;
        let room = hub
            .rooms
            .create_room(RoomSpec {
                name: "lobby".into(),
                visibility: Visibility::Public,
                owner_id: "a".into(),
                max_members: None,
                delivery_policy: DeliveryPolicy::BestEffort,
            })
            .await
            .unwrap();
        hub.rooms.join_room(&b.connection_id, &room.room_id).await.unwrap();
        frames(&mut a1_rx);
        frames(&mut a2_rx);
        frames(&mut b_rx);

        for text in ["A", "B"] {
            hub.router.route(&a1, inbound(MessageType::Room, None, Some(&room.room_id), json!(text))).await.unwrap();
        }
        let got: Vec<_> = message_frames(&frames(&mut b_rx)).into_iter().map(|m| m.payload).collect();
        assert_eq!(got, vec![json!("A"), json!("B")]);
        assert_eq!(message_frames(&frames(&mut a2_rx)).len(), 2);
        assert!(message_frames(&frames(&mut a1_rx)).is_empty());

        let err = hub.router.route(&c, inbound(MessageType::Room, None, Some(&room.room_id), json!("x"))).await.unwrap_err();
        assert!(matches!(err, HubError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn guaranteed_rooms_queue_offline_members() {
        let TestHub { hub, store, .. } = test_hub(|_| {});
        let (a, _a_rx) = connect(&hub, "a").await;
        let room = hub
            .rooms
            .create_room(RoomSpec {
                name: "ops".into(),
                visibility: Visibility::Public,
                owner_id: "a".into(),
                max_members: None,
                delivery_policy: DeliveryPolicy::Guaranteed,
            })
            .await
            .unwrap();
        store.add_member(&room.room_id, "offline-user").await.unwrap();
        hub.router.route(&a, inbound(MessageType::Room, None, Some(&room.room_id), json!("x"))).await.unwrap();
        assert_eq!(hub.offline.pending("offline-user").await.unwrap(), 1);
        assert_eq!(hub.offline.pending("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn system_broadcast_is_never_queued() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (_b, mut b_rx) = connect(&hub, "b").await;
        frames(&mut b_rx);
        hub.router.broadcast_system(json!({"notice": "maintenance"})).await.unwrap();
        let got = message_frames(&frames(&mut b_rx));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::System);
        assert!(got[0].sender_id.is_none());
        assert_eq!(hub.offline.pending("ghost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let TestHub { hub, store, .. } = test_hub(|_| {});
        let (a, _a_rx) = connect(&hub, "a").await;
        store.fail_next(2);
        let routed = hub.router.route(&a, inbound(MessageType::Private, Some("ghost"), None, json!("x"))).await.unwrap();
        assert_eq!(routed.outcome, RouteOutcome::QueuedOffline);

        store.set_available(false);
        let err = hub.router.route(&a, inbound(MessageType::Private, Some("ghost"), None, json!("x"))).await.unwrap_err();
        assert!(matches!(err, HubError::DeliveryFailed { .. }));
        store.set_available(true);
    }
}
