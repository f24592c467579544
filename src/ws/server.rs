use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::server::ImHub;

/// 启动WS监听 / Start the WebSocket listener
impl ImHub {
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.ws_port);
        let listener = TcpListener::bind(&addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// 在已绑定的监听器上服务，直到收到关闭信号 / Serve on a bound listener until shutdown
    pub async fn run_with_listener(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("🚀 v-connect-hub WebSocket Server starting on {}", listener.local_addr()?);
        info!("📡 Waiting for connections...");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = crate::ws::connection::handle_connection(stream, peer_addr, hub).await {
                            error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
        let closed = self.shutdown().await;
        info!("🛑 listener stopped, {} connections closed", closed);
        Ok(())
    }
}
