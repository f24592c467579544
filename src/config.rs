//! 配置管理 / Configuration management
//!
//! 分层配置源（代码默认值 → TOML 文件 → `VHUB__` 环境变量），后添加者优先生效。
//! Layered sources (code defaults → TOML file → `VHUB__` environment variables); later sources win.

use ::config::{Config, Environment, File, FileFormat};
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 环境变量前缀 / Environment variable prefix
pub const ENV_PREFIX: &str = "VHUB";

/// 配置源 / Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File { path: String, required: bool },
    String { content: String, format: FileFormat },
    Env { prefix: String, separator: String },
}

impl ConfigSource {
    fn describe(&self) -> String {
        match self {
            ConfigSource::File { path, .. } => format!("file:{}", path),
            ConfigSource::String { .. } => "inline".to_string(),
            ConfigSource::Env { prefix, .. } => format!("env:{}", prefix),
        }
    }
}

/// 配置数据源信息 / Loaded source bookkeeping
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置管理器 / Configuration manager
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 使用指定的配置源创建 / Build from explicit sources, lowest priority first
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::new();
        for (idx, source) in sources.into_iter().enumerate() {
            let description = source.describe();
            let priority = (idx + 1) as u8;
            match source {
                ConfigSource::File { path, required } => {
                    let exists = std::path::Path::new(&path).exists();
                    if !exists && required {
                        return Err(anyhow!("必需的配置文件不存在 / required config file missing: {}", path));
                    }
                    if exists {
                        builder = builder.add_source(File::with_name(&path).required(required));
                    }
                    sources_info.push(ConfigSourceInfo { description, priority, loaded: exists });
                }
                ConfigSource::String { content, format } => {
                    builder = builder.add_source(File::from_str(&content, format));
                    sources_info.push(ConfigSourceInfo { description, priority, loaded: true });
                }
                ConfigSource::Env { prefix, separator } => {
                    builder = builder.add_source(
                        Environment::with_prefix(&prefix)
                            .separator(&separator)
                            .try_parsing(true),
                    );
                    sources_info.push(ConfigSourceInfo { description, priority, loaded: true });
                }
            }
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败 / failed to build config: {}", e))?;
        Ok(Self { config, sources_info })
    }

    /// 文件（可选）+ 环境变量 / Optional file plus environment
    pub fn from_file(path: Option<&str>) -> Result<Self> {
        let mut sources = Vec::new();
        if let Some(p) = path {
            sources.push(ConfigSource::File { path: p.to_string(), required: true });
        }
        sources.push(ConfigSource::Env { prefix: ENV_PREFIX.to_string(), separator: "__".to_string() });
        Self::with_sources(sources)
    }

    /// 从 TOML 字符串创建（测试常用）/ Build from an inline TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::with_sources(vec![ConfigSource::String {
            content: content.to_string(),
            format: FileFormat::Toml,
        }])
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get::<T>(key)
            .map_err(|e| anyhow!("配置项 '{}' 读取失败 / config key '{}' unreadable: {}", key, key, e))
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.config.get::<T>(key).unwrap_or(default)
    }

    pub fn print_sources_info(&self) {
        for s in &self.sources_info {
            info!(
                "🔧 config source #{} {} ({})",
                s.priority,
                s.description,
                if s.loaded { "loaded" } else { "skipped" }
            );
        }
    }
}

/// 初始化全局配置 / Install the process-wide config manager
pub fn init_global_config(manager: ConfigManager) -> Result<Arc<ConfigManager>> {
    let manager = Arc::new(manager);
    let mut guard = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置写锁失败 / config lock poisoned: {}", e))?;
    *guard = Some(manager.clone());
    Ok(manager)
}

/// 获取全局配置 / Fetch the process-wide config manager
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    let guard = GLOBAL_CONFIG_MANAGER
        .read()
        .map_err(|e| anyhow!("读取全局配置锁失败 / config lock poisoned: {}", e))?;
    guard
        .clone()
        .ok_or_else(|| anyhow!("全局配置未初始化 / global config not initialized"))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub node_id: String,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window_ms: u64,
    pub handshake_points: u32,
    pub handshake_window_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_members: usize,
    /// 0 表示不清理 / 0 disables inactivity cleanup
    pub inactive_ttl_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub ttl_ms: u64,
    pub max_per_user: usize,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

/// 鉴权模式 / Identity verification mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    Center,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub secret: String,
    pub center_url: String,
    pub timeout_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

/// 枢纽完整配置 / Full hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub rate_limit: RateLimitConfig,
    pub room: RoomConfig,
    pub offline: OfflineConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub max_payload_bytes: usize,
    pub cluster_enabled: bool,
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                ws_port: 5200,
                node_id: "node-local".to_string(),
                max_connections: 10_000,
            },
            heartbeat: HeartbeatConfig { interval_ms: 25_000, timeout_ms: 60_000 },
            rate_limit: RateLimitConfig {
                points: 20,
                window_ms: 1_000,
                handshake_points: 10,
                handshake_window_ms: 1_000,
            },
            room: RoomConfig { max_members: 500, inactive_ttl_ms: 0 },
            offline: OfflineConfig {
                ttl_ms: 7 * 24 * 60 * 60 * 1000,
                max_per_user: 500,
                sweep_interval_ms: 60_000,
            },
            store: StoreConfig { retry_attempts: 3, retry_backoff_ms: 50 },
            auth: AuthConfig {
                mode: AuthMode::Token,
                secret: "change-me".to_string(),
                center_url: "http://127.0.0.1:8090".to_string(),
                timeout_ms: 1_000,
                deadline_ms: 5_000,
            },
            webhook: WebhookConfig { enabled: false, url: None, secret: None, timeout_ms: 3_000 },
            max_payload_bytes: 64 * 1024,
            cluster_enabled: false,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// 从配置管理器读取，缺省项使用默认值 / Read from the manager, falling back to defaults
    pub fn from_manager(cm: &ConfigManager) -> Self {
        let d = HubConfig::default();
        let auth_mode = match cm.get_or("auth.mode", "token".to_string()).as_str() {
            "center" => AuthMode::Center,
            _ => AuthMode::Token,
        };
        Self {
            server: ServerConfig {
                host: cm.get_or("server.host", d.server.host),
                ws_port: cm.get_or("server.ws_port", d.server.ws_port as i64) as u16,
                node_id: cm.get_or("server.node_id", d.server.node_id),
                max_connections: cm.get_or("server.max_connections", d.server.max_connections as i64) as usize,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: cm.get_or("heartbeat.interval_ms", d.heartbeat.interval_ms as i64) as u64,
                timeout_ms: cm.get_or("heartbeat.timeout_ms", d.heartbeat.timeout_ms as i64) as u64,
            },
            rate_limit: RateLimitConfig {
                points: cm.get_or("rate_limit.points", d.rate_limit.points as i64) as u32,
                window_ms: cm.get_or("rate_limit.window_ms", d.rate_limit.window_ms as i64) as u64,
                handshake_points: cm.get_or("rate_limit.handshake_points", d.rate_limit.handshake_points as i64) as u32,
                handshake_window_ms: cm.get_or("rate_limit.handshake_window_ms", d.rate_limit.handshake_window_ms as i64) as u64,
            },
            room: RoomConfig {
                max_members: cm.get_or("room.max_members", d.room.max_members as i64) as usize,
                inactive_ttl_ms: cm.get_or("room.inactive_ttl_ms", d.room.inactive_ttl_ms as i64) as u64,
            },
            offline: OfflineConfig {
                ttl_ms: cm.get_or("offline.ttl_ms", d.offline.ttl_ms as i64) as u64,
                max_per_user: cm.get_or("offline.max_per_user", d.offline.max_per_user as i64) as usize,
                sweep_interval_ms: cm.get_or("offline.sweep_interval_ms", d.offline.sweep_interval_ms as i64) as u64,
            },
            store: StoreConfig {
                retry_attempts: cm.get_or("store.retry_attempts", d.store.retry_attempts as i64) as u32,
                retry_backoff_ms: cm.get_or("store.retry_backoff_ms", d.store.retry_backoff_ms as i64) as u64,
            },
            auth: AuthConfig {
                mode: auth_mode,
                secret: cm.get_or("auth.secret", d.auth.secret),
                center_url: cm.get_or("auth.center_url", d.auth.center_url),
                timeout_ms: cm.get_or("auth.timeout_ms", d.auth.timeout_ms as i64) as u64,
                deadline_ms: cm.get_or("auth.deadline_ms", d.auth.deadline_ms as i64) as u64,
            },
            webhook: WebhookConfig {
                enabled: cm.get_or("webhook.enabled", d.webhook.enabled),
                url: cm.get::<String>("webhook.url").ok(),
                secret: cm.get::<String>("webhook.secret").ok(),
                timeout_ms: cm.get_or("webhook.timeout_ms", d.webhook.timeout_ms as i64) as u64,
            },
            max_payload_bytes: cm.get_or("message.max_payload_bytes", d.max_payload_bytes as i64) as usize,
            cluster_enabled: cm.get_or("cluster.enabled", d.cluster_enabled),
            log_level: cm.get_or("logging.level", d.log_level),
        }
    }
}
