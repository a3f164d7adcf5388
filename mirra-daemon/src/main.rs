use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::info;

use mirra_daemon::{ServerConfig, StaticRoot, SyncServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting mirra daemon");

    let root = PathBuf::from(std::env::var("MIRRA_ROOT").unwrap_or_else(|_| ".".to_string()));
    let bind_addr: SocketAddr = std::env::var("MIRRA_BIND")
        .unwrap_or_else(|_| "0.0.0.0:9851".to_string())
        .parse()?;
    let display_name = whoami::devicename();

    tokio::fs::create_dir_all(&root).await?;
    info!("Serving root {:?} as {}", root, display_name);

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    let resolver = Arc::new(StaticRoot::new(root, display_name));
    let server = SyncServer::bind(config, resolver).await?;
    let handle = server.handle();

    let server_task = tokio::spawn(server.run());

    info!("Daemon running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;

    info!("Shutting down daemon...");
    handle.shutdown();
    server_task.await??;

    info!("Daemon shutdown complete");
    Ok(())
}
