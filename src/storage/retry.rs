use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{HubError, HubResult};

/// 有界重试 / Bounded retry for persistable operations
///
/// 仅对 StoreUnavailable 重试，耗尽后返回 DeliveryFailed；其余错误原样返回。
/// Only StoreUnavailable is retried; exhaustion surfaces DeliveryFailed, other errors pass through.
pub async fn with_retry<T, F, Fut>(cfg: &StoreConfig, op_name: &str, mut op: F) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HubResult<T>>,
{
    let attempts = cfg.retry_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                warn!("⚠️  {} failed (attempt {}/{}): {}", op_name, attempt, attempts, e);
                last_err = Some(e);
                if attempt < attempts {
                    let backoff = cfg.retry_backoff_ms.saturating_mul(attempt as u64);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(HubError::DeliveryFailed {
        message: format!(
            "{} gave up after {} attempts: {}",
            op_name,
            attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}
