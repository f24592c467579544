pub mod lifecycle;
pub mod registry;

use std::sync::Arc;
use tracing::info;

use crate::cluster::memory::InMemoryFanOut;
use crate::cluster::{ClusterBroadcaster, FanOut};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::presence::PresenceStore;
use crate::room::RoomManager;
use crate::service::auth::{verifier_from_config, IdentityVerifier};
use crate::service::offline::OfflineQueue;
use crate::service::rate_limit::RateLimiter;
use crate::service::router::MessageRouter;
use crate::service::webhook::{NoopNotifier, Notifier, WebhookNotifier};
use crate::storage::memory::MemoryStore;
use crate::storage::{MessageStore, OfflineStore, PresenceBackend, RoomStore};
use registry::ConnectionRegistry;

pub use registry::Connection;

/// 共享存储协作方 / Shared storage collaborators
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub rooms: Arc<dyn RoomStore>,
    pub offline: Arc<dyn OfflineStore>,
    pub presence: Arc<dyn PresenceBackend>,
}

impl Stores {
    /// 四个接口由同一个内存存储提供 / All four contracts served by one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self { messages: store.clone(), rooms: store.clone(), offline: store.clone(), presence: store }
    }
}

/// 单个节点的枢纽状态 / Hub state for one process (node)
///
/// 所有字段都在 `Arc` 之后，克隆开销很小。
/// Every field sits behind an `Arc`, so cloning is cheap.
#[derive(Clone)]
pub struct ImHub {
    pub config: Arc<HubConfig>,
    pub registry: ConnectionRegistry,       // 本地连接 / Local connections
    pub presence: PresenceStore,            // 在线状态 / Presence
    pub rooms: RoomManager,                 // 房间 / Rooms
    pub router: MessageRouter,              // 消息路由 / Message routing
    pub offline: OfflineQueue,              // 离线队列 / Offline queue
    pub cluster: ClusterBroadcaster,        // 集群广播 / Cluster fan-out
    pub conn_limiter: Arc<RateLimiter>,     // 连接消息限流 / Per-connection limiter
    pub handshake_limiter: Arc<RateLimiter>, // 握手限流 / Per-IP handshake limiter
    pub verifier: Arc<dyn IdentityVerifier>, // 身份校验 / Identity verification
    pub notifier: Arc<dyn Notifier>,        // 上下线通知 / Online/offline hook
}

impl ImHub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder { config, stores: None, fanout: None, verifier: None, notifier: None }
    }

    pub fn node_id(&self) -> &str {
        &self.config.server.node_id
    }
}

/// 枢纽构建器 / Hub builder
pub struct HubBuilder {
    config: HubConfig,
    stores: Option<Stores>,
    fanout: Option<Arc<dyn FanOut>>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl HubBuilder {
    /// 配置共享存储 / Configure shared stores
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_memory_store(self, store: Arc<MemoryStore>) -> Self {
        self.with_stores(Stores::memory(store))
    }

    /// 配置发布订阅后端 / Configure pub/sub backend
    pub fn with_fanout(mut self, fanout: Arc<dyn FanOut>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// 配置身份校验 / Configure identity verification
    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 配置通知钩子 / Configure notification hook
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> HubResult<ImHub> {
        let cfg = self.config;
        let stores = self.stores.unwrap_or_else(|| Stores::memory(Arc::new(MemoryStore::new())));
        let fanout: Arc<dyn FanOut> = self.fanout.unwrap_or_else(|| Arc::new(InMemoryFanOut::new()));
        let verifier = match self.verifier {
            Some(v) => v,
            None => verifier_from_config(&cfg.auth)?,
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(n) => n,
            None if cfg.webhook.enabled => Arc::new(WebhookNotifier::new(&cfg.webhook)?),
            None => Arc::new(NoopNotifier),
        };

        let registry = ConnectionRegistry::new(cfg.server.max_connections);
        let cluster = ClusterBroadcaster::new(cfg.server.node_id.clone(), fanout, registry.clone(), cfg.cluster_enabled);
        let presence = PresenceStore::new(stores.presence.clone(), stores.rooms.clone(), cluster.clone(), cfg.store.clone());
        let rooms = RoomManager::new(
            stores.rooms.clone(),
            registry.clone(),
            cluster.clone(),
            cfg.room.clone(),
            cfg.store.clone(),
        );
        let offline = OfflineQueue::new(stores.offline.clone(), stores.messages.clone(), cfg.offline.clone(), cfg.store.clone());
        let conn_limiter = Arc::new(RateLimiter::new(cfg.rate_limit.points, cfg.rate_limit.window_ms));
        let handshake_limiter =
            Arc::new(RateLimiter::new(cfg.rate_limit.handshake_points, cfg.rate_limit.handshake_window_ms));
        let router = MessageRouter::new(
            registry.clone(),
            presence.clone(),
            rooms.clone(),
            offline.clone(),
            stores.messages.clone(),
            cluster.clone(),
            conn_limiter.clone(),
            cfg.max_payload_bytes,
            cfg.store.clone(),
        );
        info!(
            "🧩 hub {} ready (cluster={}, max_connections={})",
            cfg.server.node_id, cfg.cluster_enabled, cfg.server.max_connections
        );
        Ok(ImHub {
            config: Arc::new(cfg),
            registry,
            presence,
            rooms,
            router,
            offline,
            cluster,
            conn_limiter,
            handshake_limiter,
            verifier,
            notifier,
        })
    }
}
