use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::message::ServerFrame;
use crate::domain::model::now_ms;
use crate::server::lifecycle::DisconnectReason;
use crate::server::ImHub;

/// 一轮检查结果 / Outcome of one heartbeat pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSweep {
    pub pinged: usize,
    pub evicted: usize,
}

/// 检查所有连接：超时的强制断开，其余发送 ping / Evict timed-out connections and ping the rest
pub async fn sweep(hub: &ImHub, now: Instant) -> HeartbeatSweep {
    let timeout = hub.config.heartbeat.timeout();
    let mut result = HeartbeatSweep::default();
    for conn in hub.registry.snapshot() {
        let idle = conn.heartbeat_elapsed(now);
        if idle >= timeout {
            warn!(
                "💔 {} ({}) silent for {}ms, evicting",
                conn.connection_id,
                conn.user_id(),
                idle.as_millis()
            );
            if hub.disconnect(&conn.connection_id, DisconnectReason::HeartbeatTimeout).await {
                result.evicted += 1;
            }
        } else if conn.send(ServerFrame::Ping { timestamp: now_ms() }).is_ok() {
            result.pinged += 1;
        }
    }
    if result.evicted > 0 {
        info!("🧹 heartbeat pass evicted {} connections", result.evicted);
    }
    result
}

/// 心跳监控任务 / Heartbeat monitor loop
pub fn spawn_heartbeat_task(hub: ImHub, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = hub.config.heartbeat.interval().max(Duration::from_millis(10));
        info!(
            "⏰ Heartbeat interval {}ms, timeout {}ms",
            every.as_millis(),
            hub.config.heartbeat.timeout_ms
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pass = sweep(&hub, Instant::now()).await;
                    debug!("heartbeat pass: {:?}", pass);
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        info!("🛑 heartbeat monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Outbound;
    use crate::domain::model::PresenceStatus;
    use crate::server::testing::{connect, test_hub, TestHub};

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_evicted_within_timeout_plus_interval() {
        let TestHub { hub, .. } = test_hub(|cfg| {
            cfg.heartbeat.interval_ms = 1_000;
            cfg.heartbeat.timeout_ms = 3_000;
        });
        let (silent, mut silent_rx) = connect(&hub, "quiet").await;
        let (chatty, _chatty_rx) = connect(&hub, "chatty").await;
        let (tx, rx) = watch::channel(false);
        let task = spawn_heartbeat_task(hub.clone(), rx);

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            hub.heartbeat(&chatty.connection_id);
        }

        assert!(hub.registry.get(&silent.connection_id).is_none());
        assert!(hub.registry.get(&chatty.connection_id).is_some());
        let rec = hub.presence.get("quiet").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Offline);

        let mut pinged = false;
        let mut closed = false;
        while let Ok(item) = silent_rx.try_recv() {
            match item {
                Outbound::Frame(ServerFrame::Ping { .. }) => pinged = true,
                Outbound::Close(reason) => closed = reason == "heartbeat timeout",
                _ => {}
            }
        }
        assert!(pinged && closed);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_spares_fresh_connections() {
        let TestHub { hub, .. } = test_hub(|cfg| cfg.heartbeat.timeout_ms = 1_000);
        let _conn = connect(&hub, "a").await;
        let pass = sweep(&hub, Instant::now()).await;
        assert_eq!(pass, HeartbeatSweep { pinged: 1, evicted: 0 });
        let pass = sweep(&hub, Instant::now() + Duration::from_millis(1_500)).await;
        assert_eq!(pass, HeartbeatSweep { pinged: 0, evicted: 1 });
        assert!(hub.registry.is_empty());
    }
}
