use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{OfflineConfig, StoreConfig};
use crate::domain::model::{now_ms, Message, MessageId, OfflineEntry};
use crate::error::HubResult;
use crate::storage::retry::with_retry;
use crate::storage::{MessageStore, OfflineStore};

/// 信箱排空结果 / Outcome of one mailbox drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub expired: usize,
    /// 投递失败后留存的条目数 / Entries left behind after a delivery failure
    pub remaining: usize,
}

/// 离线队列 / Offline queue
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn OfflineStore>,
    messages: Arc<dyn MessageStore>,
    cfg: OfflineConfig,
    retry: StoreConfig,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn OfflineStore>, messages: Arc<dyn MessageStore>, cfg: OfflineConfig, retry: StoreConfig) -> Self {
        Self { store, messages, cfg, retry }
    }

    /// 入队，超出配额时淘汰最旧条目 / Enqueue, evicting the oldest entries beyond the quota
    pub async fn enqueue(&self, user_id: &str, message_id: MessageId) -> HubResult<()> {
        let max = self.cfg.max_per_user.max(1);
        let count = self.store.count(user_id).await?;
        if count >= max {
            let evicted = self.store.evict_oldest(user_id, count + 1 - max).await?;
            warn!("📦 mailbox of {} full, evicted {} oldest entries", user_id, evicted);
        }
        let entry = OfflineEntry { user_id: user_id.to_string(), message_id, enqueued_at: now_ms() };
        with_retry(&self.retry, "offline enqueue", || self.store.enqueue(&entry)).await?;
        debug!("📥 queued message {} for {}", message_id, user_id);
        Ok(())
    }

    /// 按顺序投递信箱，遇到失败即停止 / Deliver the mailbox in order, stopping at the first failure
    pub async fn drain<F>(&self, user_id: &str, mut deliver: F) -> HubResult<DrainReport>
    where
        F: FnMut(&Message) -> HubResult<()>,
    {
        let entries = self.store.list_entries(user_id, usize::MAX).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }
        let cutoff = self.cutoff(now_ms());
        let mut report = DrainReport::default();
        for (idx, entry) in entries.iter().enumerate() {
            if entry.enqueued_at < cutoff {
                self.store.remove_entry(user_id, entry.message_id).await?;
                report.expired += 1;
                continue;
            }
            let msg = match self.messages.get_message(entry.message_id).await? {
                Some(m) => m,
                None => {
                    warn!("⚠️  mailbox entry {} for {} has no message, dropping", entry.message_id, user_id);
                    self.store.remove_entry(user_id, entry.message_id).await?;
                    continue;
                }
            };
            if let Err(e) = deliver(&msg) {
                warn!("⚠️  drain for {} stopped at message {}: {}", user_id, entry.message_id, e);
                report.remaining = entries.len() - idx;
                break;
            }
            self.store.remove_entry(user_id, entry.message_id).await?;
            with_retry(&self.retry, "mark delivered", || self.messages.mark_delivered(entry.message_id)).await?;
            report.delivered += 1;
        }
        if report.delivered > 0 || report.expired > 0 {
            info!(
                "📬 drained mailbox of {}: delivered={} expired={}",
                user_id, report.delivered, report.expired
            );
        }
        Ok(report)
    }

    pub async fn pending(&self, user_id: &str) -> HubResult<usize> {
        self.store.count(user_id).await
    }

    /// 清理过期条目 / Drop entries older than `offline.ttl_ms`
    pub async fn purge_expired(&self) -> HubResult<usize> {
        self.store.purge_expired(self.cutoff(now_ms())).await
    }

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.cfg.ttl_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::MessageType;
    use crate::error::HubError;
    use crate::storage::memory::MemoryStore;

    fn queue(max_per_user: usize, ttl_ms: u64) -> (OfflineQueue, Arc<MemoryStore>) {
        let mem = Arc::new(MemoryStore::new());
        let cfg = OfflineConfig { ttl_ms, max_per_user, sweep_interval_ms: 1_000 };
        let retry = StoreConfig { retry_attempts: 2, retry_backoff_ms: 1 };
        (OfflineQueue::new(mem.clone(), mem.clone(), cfg, retry), mem)
    }

    async fn persist(mem: &MemoryStore, to: &str) -> MessageId {
        let id = mem.next_message_id().await.unwrap();
        mem.persist_message(&Message {
            message_id: id,
            kind: MessageType::Private,
            sender_id: Some("s".into()),
            target_id: Some(to.into()),
            room_id: None,
            payload: serde_json::json!({"n": id}),
            created_at: now_ms(),
            delivered: false,
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn drain_delivers_in_order_and_marks_delivered() {
        let (q, mem) = queue(10, 60_000);
        let a = persist(&mem, "u").await;
        let b = persist(&mem, "u").await;
        q.enqueue("u", a).await.unwrap();
        q.enqueue("u", b).await.unwrap();

        let mut seen = Vec::new();
        let report = q
            .drain("u", |m| {
                seen.push(m.message_id);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![a, b]);
        assert_eq!(report.delivered, 2);
        assert_eq!(q.pending("u").await.unwrap(), 0);
        assert!(mem.get_message(a).await.unwrap().unwrap().delivered);

        let again = q.drain("u", |_| Ok(())).await.unwrap();
        assert_eq!(again, DrainReport::default());
    }

    #[tokio::test]
    async fn failure_leaves_remaining_entries() {
        let (q, mem) = queue(10, 60_000);
        for _ in 0..3 {
            let id = persist(&mem, "u").await;
            q.enqueue("u", id).await.unwrap();
        }
        let mut calls = 0;
        let report = q
            .drain("u", |_| {
                calls += 1;
                if calls == 2 {
                    Err(HubError::DeliveryFailed { message: "socket gone".into() })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(q.pending("u").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn quota_evicts_oldest() {
        let (q, mem) = queue(2, 60_000);
        let ids: Vec<_> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                let id = persist(&mem, "u").await;
                q.enqueue("u", id).await.unwrap();
                v.push(id);
            }
            v
        };
        let entries = mem.list_entries("u", 10).await.unwrap();
        let kept: Vec<_> = entries.iter().map(|e| e.message_id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn expired_entries_are_skipped() {
        let (q, mem) = queue(10, 1_000);
        let id = persist(&mem, "u").await;
        mem.enqueue(&OfflineEntry { user_id: "u".into(), message_id: id, enqueued_at: now_ms() - 5_000 })
            .await
            .unwrap();
        let report = q.drain("u", |_| panic!("expired entries must not be delivered")).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(q.pending("u").await.unwrap(), 0);
    }
}
