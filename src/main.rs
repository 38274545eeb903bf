use anyhow::Result;
use clap::Parser;
use tracing::info;

use v_chat_delivery::{config, logging, DeliveryServer};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-chat-delivery real-time delivery server", long_about = None)]
struct Args {
    /// 指定配置文件路径 / Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// 覆盖监听地址 / Override listen host
    #[arg(long)]
    host: Option<String>,

    /// 覆盖WS端口 / Override WS port
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        cfg.server.host = host;
    }
    if let Some(port) = args.port {
        cfg.server.ws_port = port;
    }

    logging::init_tracing(&cfg.logging.level)?;
    info!(
        "⚙️  storage={:?} mailbox_capacity={} max_pending_per_key={:?}",
        cfg.storage.backend, cfg.delivery.mailbox_capacity, cfg.delivery.max_pending_per_key
    );

    let server = DeliveryServer::from_config(cfg).await?;
    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("🛑 shutting down"),
    }
    Ok(())
}
