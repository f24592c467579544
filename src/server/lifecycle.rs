//! 连接生命周期 / Connection lifecycle
//!
//! 握手闸门 → 身份校验（失败即拒绝）→ 准入 → 离线排空；断开路径幂等。
//! Handshake gate → identity verification (fail closed) → admission → offline drain; the close
//! path is idempotent.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Connection, ImHub};
use crate::domain::message::{MessageFrame, Outbound, ServerFrame};
use crate::domain::model::Identity;
use crate::error::{HubError, HubResult};
use crate::service::offline::DrainReport;
use crate::service::rate_limit::RateDecision;
use crate::service::webhook::{spawn_notify, NotifyEvent};

/// 断开原因 / Why a connection is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::HeartbeatTimeout => "heartbeat timeout",
            DisconnectReason::Shutdown => "server shutdown",
        }
    }

    /// 服务端主动关闭 / Server-initiated teardown
    pub fn is_forced(&self) -> bool {
        matches!(self, DisconnectReason::HeartbeatTimeout | DisconnectReason::Shutdown)
    }
}

impl ImHub {
    /// 握手闸门：按 IP 限流并检查进程连接上限 / Handshake gate: per-IP limiter and process cap
    pub fn check_handshake(&self, peer: &SocketAddr) -> HubResult<()> {
        if let RateDecision::Denied { retry_after_ms } = self.handshake_limiter.consume(&peer.ip().to_string(), 1) {
            warn!("🚫 handshake from {} rate limited", peer);
            return Err(HubError::RateLimited { retry_after_ms });
        }
        let limit = self.config.server.max_connections;
        if self.registry.len() >= limit {
            warn!("🚫 rejecting {}: {} connections open", peer, limit);
            return Err(HubError::CapacityExceeded { limit });
        }
        Ok(())
    }

    /// 校验凭证，超时视为失败 / Verify a credential; a timeout counts as failure
    pub async fn authenticate(&self, credential: &str) -> HubResult<Identity> {
        let timeout = Duration::from_millis(self.config.auth.timeout_ms);
        match tokio::time::timeout(timeout, self.verifier.verify(credential)).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(HubError::Auth { message })) => Err(HubError::Auth { message }),
            Ok(Err(e)) => Err(HubError::auth(format!("identity verification failed: {}", e))),
            Err(_) => Err(HubError::auth("identity verification timed out")),
        }
    }

    /// 准入已认证连接 / Admit an authenticated connection
    ///
    /// 注册 → 初始化限流桶 → `connection_ack` → 在线计数 +1 → 上线通知 → 排空离线信箱。
    /// Register, init the rate limiter bucket, ack, bump presence, notify, then drain the mailbox.
    pub async fn admit(
        &self,
        identity: Identity,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> HubResult<Connection> {
        let conn = self.registry.register(identity, addr, sender)?;
        self.conn_limiter.init(&conn.connection_id);
        // ack 必须先于任何其他下行帧 / The ack precedes every other outbound frame
        conn.send(ServerFrame::ConnectionAck {
            user_id: conn.user_id().to_string(),
            connection_id: conn.connection_id.clone(),
        })?;
        self.presence.increment_connection(conn.user_id()).await;
        info!("✅ {} connected as {} from {}", conn.connection_id, conn.user_id(), addr);
        spawn_notify(
            self.notifier.clone(),
            conn.user_id().to_string(),
            NotifyEvent::online(&conn.connection_id, &conn.addr, conn.established_at),
        );
        self.drain_offline(&conn).await;
        Ok(conn)
    }

    /// 向新连接投递离线消息 / Deliver queued messages to a freshly admitted connection
    pub async fn drain_offline(&self, conn: &Connection) -> DrainReport {
        let result = self
            .offline
            .drain(conn.user_id(), |msg| conn.send(ServerFrame::Message(MessageFrame::from_message(msg, true))))
            .await;
        match result {
            Ok(report) => report,
            Err(e) => {
                warn!("⚠️  offline drain for {} aborted: {}", conn.user_id(), e);
                DrainReport::default()
            }
        }
    }

    /// 刷新心跳 / Refresh the heartbeat of a connection
    pub fn heartbeat(&self, connection_id: &str) -> bool {
        self.registry.touch(connection_id)
    }

    /// 断开连接（幂等）/ Tear down a connection; a second call is a no-op
    pub async fn disconnect(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        if reason.is_forced() {
            self.registry.close(connection_id, reason.as_str());
        }
        let conn = match self.registry.remove(connection_id) {
            Some(c) => c,
            None => {
                debug!("disconnect of {} ignored, already gone", connection_id);
                return false;
            }
        };
        self.conn_limiter.remove(connection_id);
        self.presence.decrement_connection(conn.user_id()).await;
        info!("👋 {} ({}) disconnected: {}", connection_id, conn.user_id(), reason.as_str());
        spawn_notify(
            self.notifier.clone(),
            conn.user_id().to_string(),
            NotifyEvent::offline(&conn.connection_id, &conn.addr, conn.established_at),
        );
        true
    }

    /// 关闭全部本地连接 / Close every local connection
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for conn in self.registry.snapshot() {
            if self.disconnect(&conn.connection_id, DisconnectReason::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }
}
