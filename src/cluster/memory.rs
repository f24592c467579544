use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use super::FanOut;
use crate::error::{HubError, HubResult};

const CHANNEL_CAPACITY: usize = 1024;

/// 进程内发布订阅（单机与多枢纽测试）/ In-process pub/sub for single node and multi-hub tests
pub struct InMemoryFanOut {
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
}

impl InMemoryFanOut {
    pub fn new() -> Self {
        Self { channels: DashMap::new(), available: AtomicBool::new(true) }
    }

    /// 模拟后端故障 / Simulate a backend outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryFanOut {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanOut for InMemoryFanOut {
    async fn publish(&self, channel: &str, payload: String) -> HubResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HubError::fan_out(format!("channel {} unreachable", channel)));
        }
        // 无订阅者时发送失败，视为无人需要 / No subscribers means nobody needs it
        if self.sender(channel).send(payload).is_err() {
            debug!("no subscribers on {}", channel);
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}
