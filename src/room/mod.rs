//! 房间管理 / Room manager
//!
//! 成员关系保存在共享的 [`RoomStore`] 中（身份级），套接字关联只存在于本进程的连接注册表。
//! Membership lives in the shared [`RoomStore`] (identity level); socket associations live only in
//! this process's connection registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterBroadcaster;
use crate::config::{RoomConfig, StoreConfig};
use crate::domain::message::ServerFrame;
use crate::domain::model::{now_ms, Identity, MembershipChange, Room, RoomSpec, UserId, Visibility};
use crate::error::{HubError, HubResult};
use crate::server::registry::{Connection, ConnectionRegistry};
use crate::storage::retry::with_retry;
use crate::storage::RoomStore;

const MAX_NAME_CHARS: usize = 64;

/// 加入结果 / Join outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Clone)]
pub struct RoomManager {
    store: Arc<dyn RoomStore>,
    registry: ConnectionRegistry,
    cluster: ClusterBroadcaster,
    cfg: RoomConfig,
    retry: StoreConfig,
}

impl RoomManager {
    pub fn new(
        store: Arc<dyn RoomStore>,
        registry: ConnectionRegistry,
        cluster: ClusterBroadcaster,
        cfg: RoomConfig,
        retry: StoreConfig,
    ) -> Self {
        Self { store, registry, cluster, cfg, retry }
    }

    /// 创建房间，房主为首个成员 / Create a room with the owner as first member
    pub async fn create_room(&self, spec: RoomSpec) -> HubResult<Room> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(HubError::invalid_spec("room name must not be empty"));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(HubError::invalid_spec(format!("room name longer than {} characters", MAX_NAME_CHARS)));
        }
        let max_members = spec.max_members.unwrap_or(self.cfg.max_members);
        if max_members == 0 || max_members > self.cfg.max_members {
            return Err(HubError::invalid_spec(format!(
                "maxMembers must be between 1 and {}",
                self.cfg.max_members
            )));
        }
        let now = now_ms();
        let room = Room {
            room_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            visibility: spec.visibility,
            owner_id: spec.owner_id.clone(),
            member_ids: BTreeSet::from([spec.owner_id]),
            max_members,
            delivery_policy: spec.delivery_policy,
            created_at: now,
            last_active_at: now,
        };
        with_retry(&self.retry, "room create", || self.store.create_room(&room)).await?;
        info!("🏠 room {} ({}) created by {}", room.name, room.room_id, room.owner_id);
        Ok(room)
    }

    /// 连接加入房间 / Join a room from a connection
    pub async fn join_room(&self, connection_id: &str, room_id: &str) -> HubResult<JoinOutcome> {
        let conn = self.connection(connection_id)?;
        let user_id = conn.user_id().to_string();
        let room = self.get_room(room_id).await?;
        if room.visibility == Visibility::Private && !room.is_member(&user_id) {
            return Err(HubError::permission(format!("room {} is private", room_id)));
        }
        let outcome = match with_retry(&self.retry, "room join", || self.store.add_member(room_id, &user_id)).await? {
            MembershipChange::Full => return Err(HubError::RoomFull { room_id: room_id.to_string() }),
            MembershipChange::AlreadyMember => JoinOutcome::AlreadyMember,
            MembershipChange::Added => JoinOutcome::Joined,
        };
        self.registry.associate_room(connection_id, room_id);
        // 活跃时间只影响不活跃清理，失败不回滚已生效的加入 / Activity stamps only feed inactivity sweeps
        if let Err(e) = self.store.touch_room(room_id, now_ms()).await {
            warn!("⚠️  touch of room {} after join skipped: {}", room_id, e);
        }
        if outcome == JoinOutcome::Joined {
            debug!("➕ {} joined {}", user_id, room_id);
            let members = self.store.list_members(room_id).await?;
            self.cluster
                .to_users(
                    members,
                    Some(connection_id.to_string()),
                    ServerFrame::MemberJoined { room_id: room_id.to_string(), user_id },
                )
                .await;
        }
        Ok(outcome)
    }

    /// 离开房间；房主只断开套接字关联 / Leave a room; the owner only detaches the socket
    pub async fn leave_room(&self, connection_id: &str, room_id: &str) -> HubResult<bool> {
        let conn = self.connection(connection_id)?;
        let user_id = conn.user_id().to_string();
        let room = self.get_room(room_id).await?;
        if room.owner_id == user_id {
            self.registry.dissociate_room(connection_id, room_id);
            return Ok(false);
        }
        let changed = with_retry(&self.retry, "room leave", || self.store.remove_member(room_id, &user_id)).await?;
        for id in self.registry.connection_ids_of(&user_id) {
            self.registry.dissociate_room(&id, room_id);
        }
        if changed {
            debug!("➖ {} left {}", user_id, room_id);
            let mut notify = self.store.list_members(room_id).await?;
            notify.push(user_id.clone());
            self.cluster
                .to_users(
                    notify,
                    Some(connection_id.to_string()),
                    ServerFrame::MemberLeft { room_id: room_id.to_string(), user_id },
                )
                .await;
        }
        Ok(changed)
    }

    pub async fn list_members(&self, room_id: &str) -> HubResult<Vec<UserId>> {
        self.store.list_members(room_id).await
    }

    pub async fn get_room(&self, room_id: &str) -> HubResult<Room> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or_else(|| HubError::room_not_found(room_id))
    }

    /// 删除房间（房主或特权用户）/ Delete a room (owner or privileged identity only)
    pub async fn delete_room(&self, room_id: &str, requester: &Identity) -> HubResult<Room> {
        let room = self.get_room(room_id).await?;
        if room.owner_id != requester.user_id && !requester.privileged {
            return Err(HubError::permission(format!("only the owner may delete room {}", room_id)));
        }
        self.close_room(room).await
    }

    pub async fn list_public_rooms(&self) -> HubResult<Vec<Room>> {
        let mut rooms: Vec<Room> = self
            .store
            .list_rooms()
            .await?
            .into_iter()
            .filter(|r| r.visibility == Visibility::Public)
            .collect();
        rooms.sort_by_key(|r| r.created_at);
        Ok(rooms)
    }

    pub async fn touch(&self, room_id: &str) -> HubResult<()> {
        self.store.touch_room(room_id, now_ms()).await
    }

    /// 关闭不活跃房间 / Close rooms idle for longer than `inactive_ttl_ms`
    pub async fn close_inactive(&self, now: i64) -> HubResult<usize> {
        if self.cfg.inactive_ttl_ms == 0 {
            return Ok(0);
        }
        let cutoff = now - self.cfg.inactive_ttl_ms as i64;
        let mut closed = 0;
        for room in self.store.list_rooms().await? {
            if room.last_active_at < cutoff {
                self.close_room(room).await?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn close_room(&self, room: Room) -> HubResult<Room> {
        let members: Vec<UserId> = room.member_ids.iter().cloned().collect();
        self.cluster
            .to_users(members, None, ServerFrame::RoomClosed { room_id: room.room_id.clone() })
            .await;
        with_retry(&self.retry, "room delete", || self.store.delete_room(&room.room_id)).await?;
        self.registry.dissociate_room_everywhere(&room.room_id);
        info!("🧹 room {} ({}) closed", room.name, room.room_id);
        Ok(room)
    }

    fn connection(&self, connection_id: &str) -> HubResult<Connection> {
        self.registry
            .get(connection_id)
            .ok_or_else(|| HubError::validation("connectionId", format!("unknown connection {}", connection_id)))
    }
}
