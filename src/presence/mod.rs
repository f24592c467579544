//! 在线状态 / Presence store
//!
//! 连接计数原子增减并在零处截断；状态按 statusAt 最后写入者胜。
//! 后端不可用时只记录日志，连接生命周期照常进行。
//! Connection counts are additive and clamped at zero; status is last-writer-wins by `statusAt`.
//! Backend outages are logged and never block the connection lifecycle.
//! 客户端状态变更属于持久化操作，按 [`with_retry`] 有界重试。
//! Client status changes are persisted, retried a bounded number of times via [`with_retry`].

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterBroadcaster;
use crate::config::StoreConfig;
use crate::domain::message::ServerFrame;
use crate::domain::model::{now_ms, PresenceRecord, PresenceStatus, PresenceTransition};
use crate::error::{HubError, HubResult};
use crate::storage::retry::with_retry;
use crate::storage::{PresenceBackend, RoomStore};

#[derive(Clone)]
pub struct PresenceStore {
    backend: Arc<dyn PresenceBackend>,
    rooms: Arc<dyn RoomStore>,
    cluster: ClusterBroadcaster,
    retry: StoreConfig,
}

impl PresenceStore {
    pub fn new(
        backend: Arc<dyn PresenceBackend>,
        rooms: Arc<dyn RoomStore>,
        cluster: ClusterBroadcaster,
        retry: StoreConfig,
    ) -> Self {
        Self { backend, rooms, cluster, retry }
    }

    /// 新连接计数 +1 / One more live connection for the user
    pub async fn increment_connection(&self, user_id: &str) -> Option<PresenceRecord> {
        match self.backend.increment(user_id, now_ms()).await {
            Ok(t) => {
                debug!("👤 {} connections={}", user_id, t.record.connection_count);
                Some(self.announce(t).await)
            }
            Err(e) => {
                warn!("⚠️  presence increment for {} skipped: {}", user_id, e);
                None
            }
        }
    }

    /// 连接断开计数 -1 / One fewer live connection for the user
    pub async fn decrement_connection(&self, user_id: &str) -> Option<PresenceRecord> {
        match self.backend.decrement(user_id, now_ms()).await {
            Ok(t) => {
                if t.underflow {
                    error!("❌ invariant violation: connection count for {} would go negative", user_id);
                }
                Some(self.announce(t).await)
            }
            Err(e) => {
                warn!("⚠️  presence decrement for {} skipped: {}", user_id, e);
                None
            }
        }
    }

    /// 客户端自报状态，offline 不可自设 / Self-reported status; `offline` is server-owned
    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) -> HubResult<PresenceRecord> {
        if status == PresenceStatus::Offline {
            return Err(HubError::validation("status", "offline cannot be set by clients"));
        }
        let at = now_ms();
        let t = with_retry(&self.retry, "status change", || self.backend.set_status(user_id, status, at)).await?;
        Ok(self.announce(t).await)
    }

    pub async fn get(&self, user_id: &str) -> HubResult<Option<PresenceRecord>> {
        self.backend.get(user_id).await
    }

    /// 在线用户，可按房间过滤 / Online users, optionally restricted to a room's members
    pub async fn get_online_users(&self, room_id: Option<&str>) -> HubResult<Vec<PresenceRecord>> {
        let mut online = self.backend.list_online().await?;
        if let Some(room_id) = room_id {
            let room = self
                .rooms
                .get_room(room_id)
                .await?
                .ok_or_else(|| HubError::room_not_found(room_id))?;
            online.retain(|r| room.is_member(&r.user_id));
        }
        online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(online)
    }

    pub async fn connection_count(&self, user_id: &str) -> HubResult<u64> {
        Ok(self.backend.get(user_id).await?.map(|r| r.connection_count).unwrap_or(0))
    }

    async fn announce(&self, t: PresenceTransition) -> PresenceRecord {
        if t.status_changed() {
            info!("🔔 {} {} -> {}", t.record.user_id, t.previous, t.record.status);
            self.cluster
                .to_all(ServerFrame::UserStatusChanged {
                    user_id: t.record.user_id.clone(),
                    status: t.record.status,
                })
                .await;
        }
        t.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryFanOut;
    use crate::domain::message::Outbound;
    use crate::domain::model::Identity;
    use crate::server::registry::ConnectionRegistry;
    use crate::storage::memory::MemoryStore;
    use tokio::sync::mpsc;

    fn store() -> (PresenceStore, Arc<MemoryStore>, ConnectionRegistry) {
        let mem = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(8);
        let cluster = ClusterBroadcaster::new("n".into(), Arc::new(InMemoryFanOut::new()), registry.clone(), false);
        let retry = StoreConfig { retry_attempts: 3, retry_backoff_ms: 1 };
        (PresenceStore::new(mem.clone(), mem.clone(), cluster, retry), mem, registry)
    }

    #[tokio::test]
    async fn first_and_last_connection_drive_status() {
        let (presence, _, registry) = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(Identity::new("watcher"), "127.0.0.1:1".parse().unwrap(), tx).unwrap();

        let rec = presence.increment_connection("u1").await.unwrap();
        assert_eq!(rec.status, PresenceStatus::Online);
        presence.increment_connection("u1").await.unwrap();
        presence.set_status("u1", PresenceStatus::Away).await.unwrap();
        presence.decrement_connection("u1").await.unwrap();
        assert_eq!(presence.get("u1").await.unwrap().unwrap().status, PresenceStatus::Away);
        let rec = presence.decrement_connection("u1").await.unwrap();
        assert_eq!(rec.status, PresenceStatus::Offline);
        assert_eq!(rec.connection_count, 0);

        let mut seen = Vec::new();
        while let Ok(Outbound::Frame(ServerFrame::UserStatusChanged { status, .. })) = rx.try_recv() {
            seen.push(status);
        }
        assert_eq!(seen, vec![PresenceStatus::Online, PresenceStatus::Away, PresenceStatus::Offline]);
    }

    #[tokio::test]
    async fn clients_cannot_go_offline_by_hand() {
        let (presence, _, _) = store();
        presence.increment_connection("u1").await;
        let err = presence.set_status("u1", PresenceStatus::Offline).await.unwrap_err();
        assert!(matches!(err, HubError::Validation { .. }));
    }

    #[tokio::test]
    async fn backend_outage_is_best_effort() {
        let (presence, mem, _) = store();
        mem.set_available(false);
        assert!(presence.increment_connection("u1").await.is_none());
        mem.set_available(true);
        let rec = presence.decrement_connection("u1").await.unwrap();
        assert_eq!(rec.connection_count, 0);
    }

    #[tokio::test]
    async fn status_change_retries_then_surfaces_delivery_failed() {
        let (presence, mem, _) = store();
        presence.increment_connection("u1").await.unwrap();
        mem.fail_next(2);
        let rec = presence.set_status("u1", PresenceStatus::Busy).await.unwrap();
        assert_eq!(rec.status, PresenceStatus::Busy);

        mem.set_available(false);
        let err = presence.set_status("u1", PresenceStatus::Away).await.unwrap_err();
        assert!(matches!(err, HubError::DeliveryFailed { .. }));
    }
}
