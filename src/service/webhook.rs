use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::domain::model::{now_ms, ConnectionId};

type HmacSha256 = Hmac<Sha256>;

/// 签名头 / Signature header
pub const SIGNATURE_HEADER: &str = "X-VConnectHub-Signature";

/// 通知事件类型 / Notification event type
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEventType {
    ClientOnline,
    ClientOffline,
}

/// 上下线通知 / Online/offline notification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEvent {
    pub event_type: NotifyEventType,
    pub event_id: String,
    pub timestamp: i64,
    pub connection_id: ConnectionId,
    pub addr: String,
    pub connected_at: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub disconnected_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub online_duration_ms: Option<u64>,
}

impl NotifyEvent {
    pub fn online(connection_id: &str, addr: &SocketAddr, connected_at: i64) -> Self {
        Self {
            event_type: NotifyEventType::ClientOnline,
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            connection_id: connection_id.to_string(),
            addr: addr.to_string(),
            connected_at,
            disconnected_at: None,
            online_duration_ms: None,
        }
    }

    pub fn offline(connection_id: &str, addr: &SocketAddr, connected_at: i64) -> Self {
        let now = now_ms();
        Self {
            event_type: NotifyEventType::ClientOffline,
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            connection_id: connection_id.to_string(),
            addr: addr.to_string(),
            connected_at,
            disconnected_at: Some(now),
            online_duration_ms: Some((now - connected_at).max(0) as u64),
        }
    }
}

/// 外部通知钩子（尽力而为）/ External notification hook, best effort
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, event: NotifyEvent) -> Result<()>;
}

/// 后台发送，失败只记录 / Fire the notification in the background, logging failures
pub fn spawn_notify(notifier: Arc<dyn Notifier>, user_id: String, event: NotifyEvent) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&user_id, event).await {
            warn!("⚠️  notification for {} failed: {}", user_id, e);
        }
    });
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _user_id: &str, _event: NotifyEvent) -> Result<()> {
        Ok(())
    }
}

/// HTTP Webhook 通知 / HTTP webhook notifier
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(cfg: &WebhookConfig) -> Result<Self> {
        let url = cfg
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("webhook.url is required when webhook.enabled = true"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, url, secret: cfg.secret.clone() })
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    uid: &'a str,
    #[serde(flatten)]
    event: &'a NotifyEvent,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_id: &str, event: NotifyEvent) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&WebhookBody { uid: user_id, event: &event });
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_event(&event, secret)?);
        }
        let response = request.send().await.map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))?;
        if response.status().is_success() {
            info!("✅ Webhook event {} delivered", event.event_id);
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("Webhook delivery failed with status {}: {}", status, body))
        }
    }
}

/// 生成签名 `sha256=<hex>` / Signature over id, type and timestamp
pub fn sign_event(event: &NotifyEvent, secret: &str) -> Result<String> {
    let payload = serde_json::json!({
        "event_id": event.event_id,
        "event_type": event.event_type,
        "timestamp": event.timestamp,
    })
    .to_string();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_and_secret_bound() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let ev = NotifyEvent::online("c1", &addr, 1);
        let a = sign_event(&ev, "s1").unwrap();
        assert!(a.starts_with("sha256="));
        assert_eq!(a, sign_event(&ev, "s1").unwrap());
        assert_ne!(a, sign_event(&ev, "s2").unwrap());
    }

    #[test]
    fn offline_event_reports_duration() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let ev = NotifyEvent::offline("c1", &addr, now_ms() - 1_000);
        assert_eq!(ev.event_type, NotifyEventType::ClientOffline);
        assert!(ev.online_duration_ms.unwrap() >= 1_000);
    }

    #[test]
    fn webhook_requires_url() {
        let cfg = WebhookConfig { enabled: true, url: None, secret: None, timeout_ms: 100 };
        assert!(WebhookNotifier::new(&cfg).is_err());
    }
}
