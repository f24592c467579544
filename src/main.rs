use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use v_connect_hub::config::{init_global_config, ConfigManager};
use v_connect_hub::tasks::{heartbeat::spawn_heartbeat_task, sweep::spawn_sweep_task};
use v_connect_hub::{init_tracing, HubConfig, ImHub};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-connect-hub WebSocket presence & room hub", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config", default_value = "config/default.toml")]
    config: Option<String>,

    /// 覆盖节点ID / Override the node id
    #[arg(long = "node-id")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::from_file(args.config.as_deref())?;
    let cm = init_global_config(manager)?;
    let mut cfg = HubConfig::from_manager(&cm);
    if let Some(node_id) = args.node_id {
        cfg.server.node_id = node_id;
    }

    // 初始化日志 / Initialize logging
    init_tracing(&cfg.log_level);
    info!("🎯 Starting v-connect-hub node {}...", cfg.server.node_id);
    cm.print_sources_info();

    if cfg.webhook.enabled {
        info!("📡 Webhook: {}", cfg.webhook.url.as_deref().unwrap_or("<missing url>"));
    } else {
        info!("📡 Webhook: Disabled");
    }
    if cfg.cluster_enabled {
        info!("🛰️  Cluster fan-out enabled");
    }

    let hub = ImHub::builder(cfg).build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = hub.cluster.spawn_listeners(shutdown_rx.clone());
    background.push(spawn_heartbeat_task(hub.clone(), shutdown_rx.clone()));
    background.push(spawn_sweep_task(hub.clone(), shutdown_rx.clone()));

    let server = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.run(shutdown_rx).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("🛑 Ctrl+C received, shutting down..."),
        Err(e) => warn!("signal handler failed: {}", e),
    }
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Err(e)) => error!("server stopped with error: {}", e),
        Err(e) => error!("server task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    for task in background {
        let _ = task.await;
    }
    info!("👋 v-connect-hub stopped");
    Ok(())
}
