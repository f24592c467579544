//! 连接注册表（进程内）/ Connection registry (per process)
//!
//! 只保存本进程接受的连接；跨进程状态只存在于在线状态与房间存储中。
//! Holds only the connections this process accepted; cross-process state lives in the
//! presence and room stores.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::message::{Outbound, ServerFrame};
use crate::domain::model::{now_ms, ConnectionId, Identity, RoomId, UserId};
use crate::error::{HubError, HubResult};

/// 客户端连接信息 / Client connection information
#[derive(Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub addr: SocketAddr,
    pub established_at: i64,
    pub last_heartbeat: Arc<Mutex<Instant>>, // 最后心跳时间 / Last heartbeat time
    pub joined_rooms: Arc<Mutex<HashSet<RoomId>>>, // 套接字级房间关联 / Socket-level room associations
    pub sender: mpsc::UnboundedSender<Outbound>, // 消息发送器 / Outbound sender
    closed: Arc<watch::Sender<bool>>,              // 移出注册表时置位 / Raised once removed from the registry
}

impl Connection {
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn send(&self, frame: ServerFrame) -> HubResult<()> {
        self.sender.send(Outbound::Frame(frame)).map_err(|_| HubError::DeliveryFailed {
            message: format!("connection {} is closed", self.connection_id),
        })
    }

    /// 订阅关闭信号 / Subscribe to the signal raised when the registry drops this connection
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn heartbeat_elapsed(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(*self.last_heartbeat.lock())
    }
}

/// 连接注册表 / Connection registry
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Connection>>,
    user_index: Arc<DashMap<UserId, DashSet<ConnectionId>>>, // UID到连接集合 / UID -> connection ids
    live: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            user_index: Arc::new(DashMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// 登记新连接，超过进程上限时拒绝 / Register a connection, rejecting beyond the process cap
    pub fn register(
        &self,
        identity: Identity,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> HubResult<Connection> {
        let max = self.max_connections;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n < max { Some(n + 1) } else { None })
            .map_err(|_| HubError::CapacityExceeded { limit: max })?;
        let conn = Connection {
            connection_id: Uuid::new_v4().to_string(),
            identity,
            addr,
            established_at: now_ms(),
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            joined_rooms: Arc::new(Mutex::new(HashSet::new())),
            sender,
            closed: Arc::new(watch::channel(false).0),
        };
        self.connections.insert(conn.connection_id.clone(), conn.clone());
        self.user_index
            .entry(conn.identity.user_id.clone())
            .or_default()
            .insert(conn.connection_id.clone());
        debug!("📥 registered connection {} for {}", conn.connection_id, conn.user_id());
        Ok(conn)
    }

    /// 移除连接（幂等）/ Remove a connection; a second call returns None
    pub fn remove(&self, connection_id: &str) -> Option<Connection> {
        let (_, conn) = self.connections.remove(connection_id)?;
        self.live.fetch_sub(1, Ordering::SeqCst);
        let user_id = conn.user_id().to_string();
        if let Some(set) = self.user_index.get(&user_id) {
            set.remove(connection_id);
        }
        self.user_index.remove_if(&user_id, |_, set| set.is_empty());
        conn.joined_rooms.lock().clear();
        conn.closed.send_replace(true);
        Some(conn)
    }

    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// 刷新心跳 / Refresh last heartbeat
    pub fn touch(&self, connection_id: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => {
                *conn.last_heartbeat.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn connection_ids_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.user_index
            .get(user_id)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<Connection> {
        self.connection_ids_of(user_id)
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.user_index.get(user_id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn send_to_connection(&self, connection_id: &str, frame: ServerFrame) -> HubResult<()> {
        match self.connections.get(connection_id) {
            Some(conn) => conn.send(frame),
            None => {
                warn!("⚠️  Connection {} not found for message delivery", connection_id);
                Err(HubError::DeliveryFailed { message: format!("connection {} not found", connection_id) })
            }
        }
    }

    /// 推送给用户所有本地连接，返回成功数 / Push to every local connection of a user
    pub fn send_to_user(&self, user_id: &str, frame: &ServerFrame, exclude: Option<&str>) -> usize {
        let mut delivered = 0usize;
        for id in self.connection_ids_of(user_id) {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if self.send_to_connection(&id, frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// 推送给所有本地连接 / Push to every local connection
    pub fn send_to_all(&self, frame: &ServerFrame) -> usize {
        self.connections
            .iter()
            .filter(|c| c.send(frame.clone()).is_ok())
            .count()
    }

    /// 让写任务发送关闭帧 / Ask the writer task to close the socket
    pub fn close(&self, connection_id: &str, reason: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn.sender.send(Outbound::Close(reason.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn associate_room(&self, connection_id: &str, room_id: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn.joined_rooms.lock().insert(room_id.to_string()),
            None => false,
        }
    }

    pub fn dissociate_room(&self, connection_id: &str, room_id: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn.joined_rooms.lock().remove(room_id),
            None => false,
        }
    }

    /// 房间关闭时清理所有本地关联 / Drop a closed room from every local connection
    pub fn dissociate_room_everywhere(&self, room_id: &str) {
        for conn in self.connections.iter() {
            conn.joined_rooms.lock().remove(room_id);
        }
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn register_and_remove_maintain_user_index() {
        let reg = ConnectionRegistry::new(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let c1 = reg.register(Identity::new("u1"), addr(), tx.clone()).unwrap();
        let c2 = reg.register(Identity::new("u1"), addr(), tx).unwrap();
        assert_eq!(reg.connections_of("u1").len(), 2);
        assert!(reg.remove(&c1.connection_id).is_some());
        assert!(reg.remove(&c1.connection_id).is_none());
        assert!(reg.has_user("u1"));
        reg.remove(&c2.connection_id);
        assert!(!reg.has_user("u1"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn remove_raises_close_signal() {
        let reg = ConnectionRegistry::new(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let c1 = reg.register(Identity::new("u1"), addr(), tx).unwrap();
        let mut signal = c1.closed_signal();
        assert!(!c1.is_closed());
        reg.remove(&c1.connection_id);
        assert!(c1.is_closed());
        assert!(signal.wait_for(|closed| *closed).await.is_ok());
    }

    #[test]
    fn capacity_is_enforced() {
        let reg = ConnectionRegistry::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let c1 = reg.register(Identity::new("u1"), addr(), tx.clone()).unwrap();
        let err = reg.register(Identity::new("u2"), addr(), tx.clone()).err().unwrap();
        assert!(matches!(err, HubError::CapacityExceeded { limit: 1 }));
        reg.remove(&c1.connection_id);
        assert!(reg.register(Identity::new("u2"), addr(), tx).is_ok());
    }

    #[test]
    fn send_to_user_skips_excluded_connection() {
        let reg = ConnectionRegistry::new(10);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let c1 = reg.register(Identity::new("u1"), addr(), tx1).unwrap();
        reg.register(Identity::new("u1"), addr(), tx2).unwrap();
        let n = reg.send_to_user("u1", &ServerFrame::Ping { timestamp: 1 }, Some(&c1.connection_id));
        assert_eq!(n, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), Outbound::Frame(ServerFrame::Ping { timestamp: 1 }));
    }
}
