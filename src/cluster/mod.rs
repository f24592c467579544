//! 集群广播适配器 / Cluster fan-out adapter
//!
//! 发起节点先本地投递，再发布到共享频道；其他节点的监听任务跳过自身来源并去重后投递给本地连接。
//! The originating node delivers locally first and then publishes; listeners on other nodes skip
//! their own events, drop duplicates and push to their local connections.

pub mod dedup;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::message::ServerFrame;
use crate::domain::model::{ConnectionId, UserId};
use crate::error::{HubError, HubResult};
use crate::server::registry::ConnectionRegistry;
use dedup::RecentIds;

/// 定向用户频道 / Channel for events targeted at a set of users
pub const USERS_CHANNEL: &str = "hub.users";
/// 全量广播频道 / Channel for events addressed to every connection
pub const BROADCAST_CHANNEL: &str = "hub.broadcast";

const DEDUP_WINDOW: usize = 4096;

/// 发布订阅后端 / Pub/sub backend
#[async_trait]
pub trait FanOut: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> HubResult<()>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// 跨节点事件 / Event carried between nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClusterEvent {
    ToUsers {
        origin: String,
        dedup_key: String,
        user_ids: Vec<UserId>,
        #[serde(default)]
        exclude: Option<ConnectionId>,
        frame: ServerFrame,
    },
    ToAll {
        origin: String,
        dedup_key: String,
        frame: ServerFrame,
    },
}

impl ClusterEvent {
    pub fn origin(&self) -> &str {
        match self {
            ClusterEvent::ToUsers { origin, .. } | ClusterEvent::ToAll { origin, .. } => origin,
        }
    }

    pub fn dedup_key(&self) -> &str {
        match self {
            ClusterEvent::ToUsers { dedup_key, .. } | ClusterEvent::ToAll { dedup_key, .. } => dedup_key,
        }
    }

    fn channel(&self) -> &'static str {
        match self {
            ClusterEvent::ToUsers { .. } => USERS_CHANNEL,
            ClusterEvent::ToAll { .. } => BROADCAST_CHANNEL,
        }
    }
}

/// 跨节点发布结果 / Outcome of the cross-process leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDelivery {
    Disabled,
    Published,
    Unavailable,
}

/// 一次广播的结果 / Result of one fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub local: usize,
    pub remote: RemoteDelivery,
}

/// 集群广播器 / Cluster broadcaster
#[derive(Clone)]
pub struct ClusterBroadcaster {
    node_id: String,
    fanout: Arc<dyn FanOut>,
    registry: ConnectionRegistry,
    recent: Arc<RecentIds>,
    enabled: bool,
}

impl ClusterBroadcaster {
    pub fn new(node_id: String, fanout: Arc<dyn FanOut>, registry: ConnectionRegistry, enabled: bool) -> Self {
        Self { node_id, fanout, registry, recent: Arc::new(RecentIds::new(DEDUP_WINDOW)), enabled }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 推送给一组用户的所有连接 / Push to every connection of a set of users
    pub async fn to_users(
        &self,
        user_ids: Vec<UserId>,
        exclude: Option<ConnectionId>,
        frame: ServerFrame,
    ) -> FanOutReport {
        self.emit(ClusterEvent::ToUsers {
            origin: self.node_id.clone(),
            dedup_key: Uuid::new_v4().to_string(),
            user_ids,
            exclude,
            frame,
        })
        .await
    }

    /// 推送给集群内所有连接 / Push to every connection in the cluster
    pub async fn to_all(&self, frame: ServerFrame) -> FanOutReport {
        self.emit(ClusterEvent::ToAll {
            origin: self.node_id.clone(),
            dedup_key: Uuid::new_v4().to_string(),
            frame,
        })
        .await
    }

    pub async fn emit(&self, event: ClusterEvent) -> FanOutReport {
        self.recent.should_deliver(event.dedup_key());
        let local = self.deliver_local(&event);
        if !self.enabled {
            return FanOutReport { local, remote: RemoteDelivery::Disabled };
        }
        let remote = match self.publish(&event).await {
            Ok(()) => RemoteDelivery::Published,
            Err(e) => {
                warn!("📡 cross-process delivery lost: {}", e);
                RemoteDelivery::Unavailable
            }
        };
        FanOutReport { local, remote }
    }

    async fn publish(&self, event: &ClusterEvent) -> HubResult<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| HubError::fan_out(format!("encode cluster event: {}", e)))?;
        self.fanout.publish(event.channel(), payload).await
    }

    /// 投递给本进程连接 / Deliver to this process's connections
    pub fn deliver_local(&self, event: &ClusterEvent) -> usize {
        match event {
            ClusterEvent::ToUsers { user_ids, exclude, frame, .. } => {
                if let ServerFrame::RoomClosed { room_id } = frame {
                    self.registry.dissociate_room_everywhere(room_id);
                }
                user_ids
                    .iter()
                    .map(|uid| self.registry.send_to_user(uid, frame, exclude.as_deref()))
                    .sum()
            }
            ClusterEvent::ToAll { frame, .. } => self.registry.send_to_all(frame),
        }
    }

    /// 处理远端事件，返回本地投递数 / Handle a remote payload; returns local pushes
    pub fn handle_remote(&self, payload: &str) -> usize {
        let event: ClusterEvent = match serde_json::from_str(payload) {
            Ok(ev) => ev,
            Err(e) => {
                warn!("⚠️  dropping malformed cluster event: {}", e);
                return 0;
            }
        };
        if event.origin() == self.node_id {
            return 0;
        }
        if !self.recent.should_deliver(event.dedup_key()) {
            debug!("duplicate cluster event {}", event.dedup_key());
            return 0;
        }
        self.deliver_local(&event)
    }

    /// 启动频道监听任务 / Spawn one listener per channel
    pub fn spawn_listeners(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.enabled {
            return Vec::new();
        }
        [USERS_CHANNEL, BROADCAST_CHANNEL]
            .into_iter()
            .map(|channel| {
                let rx = self.fanout.subscribe(channel);
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.listen(channel, rx, shutdown).await })
            })
            .collect()
    }

    async fn listen(
        self,
        channel: &'static str,
        mut rx: broadcast::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("🛰️  node {} listening on {}", self.node_id, channel);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(payload) => {
                        self.handle_remote(&payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("⚠️  {} listener lagged, {} events lost", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
        info!("🛑 {} listener stopped", channel);
    }
}
