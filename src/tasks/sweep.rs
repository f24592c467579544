use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::model::now_ms;
use crate::server::ImHub;

/// 清理结果 / Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSweep {
    pub expired_entries: usize,
    pub closed_rooms: usize,
    pub idle_buckets: usize,
}

/// 过期离线条目、不活跃房间与空闲握手桶 / Expired mailbox entries, idle rooms and handshake buckets
pub async fn run_sweep(hub: &ImHub) -> MaintenanceSweep {
    let mut result = MaintenanceSweep::default();
    match hub.offline.purge_expired().await {
        Ok(n) => result.expired_entries = n,
        Err(e) => warn!("⚠️  offline purge skipped: {}", e),
    }
    match hub.rooms.close_inactive(now_ms()).await {
        Ok(n) => result.closed_rooms = n,
        Err(e) => warn!("⚠️  inactive room sweep skipped: {}", e),
    }
    result.idle_buckets = hub.handshake_limiter.cleanup_idle();
    if result.expired_entries > 0 || result.closed_rooms > 0 {
        info!(
            "🧹 maintenance: {} expired entries, {} rooms closed",
            result.expired_entries, result.closed_rooms
        );
    }
    result
}

pub fn spawn_sweep_task(hub: ImHub, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = Duration::from_millis(hub.config.offline.sweep_interval_ms.max(100));
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_sweep(&hub).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        info!("🛑 maintenance sweep stopped");
    })
}
