//! 身份校验 / Identity verification
//!
//! 两种实现：本地 HMAC-SHA256 签名令牌与远程鉴权中心。任何失败都拒绝连接。
//! Two implementations: a locally verified HMAC-SHA256 token and the remote auth center. Every
//! failure rejects the connection.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use crate::config::{AuthConfig, AuthMode};
use crate::domain::model::{now_ms, Identity};
use crate::error::{HubError, HubResult};

type HmacSha256 = Hmac<Sha256>;

/// 身份校验能力 / Identity verification capability
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> HubResult<Identity>;
}

/// 按配置构建校验器 / Build the verifier selected by `auth.mode`
pub fn verifier_from_config(cfg: &AuthConfig) -> HubResult<std::sync::Arc<dyn IdentityVerifier>> {
    Ok(match cfg.mode {
        AuthMode::Token => std::sync::Arc::new(HmacTokenVerifier::new(cfg.secret.clone())),
        AuthMode::Center => std::sync::Arc::new(AuthCenterVerifier::new(cfg)?),
    })
}

/// 签名令牌 `uid.exp.flag.sig` / Signed token `uid.exp.flag.sig`
///
/// `exp` 为毫秒时间戳，`flag` 为 1 表示特权身份，`sig = hex(hmac_sha256(secret, "uid.exp.flag"))`。
/// `exp` is a unix timestamp in milliseconds, `flag = 1` marks a privileged identity.
pub struct HmacTokenVerifier {
    secret: String,
}

impl HmacTokenVerifier {
    pub fn new<T: Into<String>>(secret: T) -> Self {
        Self { secret: secret.into() }
    }

    fn mac(&self) -> HubResult<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| HubError::Internal(anyhow::anyhow!("invalid auth secret: {}", e)))
    }

    /// 签发令牌（测试与运维工具使用）/ Issue a token
    pub fn issue(&self, user_id: &str, ttl_ms: i64, privileged: bool) -> HubResult<String> {
        let body = format!("{}.{}.{}", user_id, now_ms() + ttl_ms, if privileged { 1 } else { 0 });
        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        Ok(format!("{}.{}", body, hex::encode(mac.finalize().into_bytes())))
    }
}

#[async_trait]
impl IdentityVerifier for HmacTokenVerifier {
    async fn verify(&self, credential: &str) -> HubResult<Identity> {
        let mut parts = credential.rsplitn(4, '.');
        let (sig, flag, exp, uid) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(f), Some(e), Some(u)) if !u.is_empty() => (s, f, e, u),
            _ => return Err(HubError::auth("malformed token")),
        };
        let sig = hex::decode(sig).map_err(|_| HubError::auth("malformed signature"))?;
        let mut mac = self.mac()?;
        mac.update(format!("{}.{}.{}", uid, exp, flag).as_bytes());
        mac.verify_slice(&sig).map_err(|_| HubError::auth("bad signature"))?;

        let expires_at: i64 = exp.parse().map_err(|_| HubError::auth("malformed expiry"))?;
        if expires_at <= now_ms() {
            return Err(HubError::auth("token expired"));
        }
        debug!("🔑 token verified for {}", uid);
        Ok(Identity { user_id: uid.to_string(), privileged: flag == "1", expires_at: Some(expires_at) })
    }
}

#[derive(Deserialize)]
struct CenterIdentity {
    uid: String,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// 鉴权中心校验 / Auth center verification over HTTP
pub struct AuthCenterVerifier {
    client: reqwest::Client,
    center_url: String,
}

impl AuthCenterVerifier {
    pub fn new(cfg: &AuthConfig) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| HubError::Internal(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, center_url: cfg.center_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl IdentityVerifier for AuthCenterVerifier {
    async fn verify(&self, credential: &str) -> HubResult<Identity> {
        if credential.is_empty() {
            return Err(HubError::auth("empty credential"));
        }
        let resp = self
            .client
            .get(format!("{}/v1/sso/auth", self.center_url))
            .query(&[("token", credential)])
            .send()
            .await
            .map_err(|e| HubError::auth(format!("auth center unreachable: {}", e)))?;
        if !resp.status().is_success() {
            return Err(HubError::auth(format!("auth center rejected token ({})", resp.status())));
        }
        let body: CenterIdentity = resp
            .json()
            .await
            .map_err(|e| HubError::auth(format!("unexpected auth center reply: {}", e)))?;
        if body.uid.is_empty() {
            return Err(HubError::auth("auth center returned no uid"));
        }
        Ok(Identity { user_id: body.uid, privileged: body.privileged, expires_at: body.expires_at })
    }
}
