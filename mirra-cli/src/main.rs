use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

use mirra_client::{ClientConfig, SyncClient, SyncEvent};
use mirra_daemon::{ServerConfig, StaticRoot, SyncServer};

#[derive(Parser)]
#[command(name = "mirra", about = "Two-node directory synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory to sync clients
    Serve {
        /// Directory to serve
        #[arg(long)]
        root: PathBuf,
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9851")]
        bind: SocketAddr,
    },
    /// Synchronize a local directory against a server
    Sync {
        /// Local directory to synchronize
        #[arg(long)]
        root: PathBuf,
        /// Server address
        #[arg(long)]
        server: SocketAddr,
        /// Client name presented to the server
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { root, bind } => serve(root, bind).await,
        Commands::Sync { root, server, name } => sync(root, server, name).await,
    }
}

async fn serve(root: PathBuf, bind: SocketAddr) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&root).await?;

    let config = ServerConfig {
        bind_addr: bind,
        ..ServerConfig::default()
    };
    let resolver = Arc::new(StaticRoot::new(root.clone(), whoami::devicename()));
    let server = SyncServer::bind(config, resolver).await?;
    let handle = server.handle();

    info!("Serving {:?} on {}", root, bind);
    let server_task = tokio::spawn(server.run());

    signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown();
    server_task.await??;
    Ok(())
}

async fn sync(root: PathBuf, server: SocketAddr, name: Option<String>) -> anyhow::Result<()> {
    let owner = name.unwrap_or_else(whoami::devicename);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SyncEvent::SessionOpened { session_id } => {
                    println!("session {}", session_id);
                }
                SyncEvent::Classified {
                    to_upload,
                    to_download,
                    to_remove,
                    conflicts,
                } => {
                    println!(
                        "plan: {} to upload, {} to download, {} to remove, {} conflicts",
                        to_upload, to_download, to_remove, conflicts
                    );
                }
                SyncEvent::Downloaded { path, bytes } => println!("  down {} ({} B)", path, bytes),
                SyncEvent::Uploaded { path, bytes } => println!("  up   {} ({} B)", path, bytes),
                SyncEvent::Removed { path } => println!("  rm   {}", path),
                SyncEvent::Conflict { record } => {
                    println!("  !!   {} (conflict, left untouched)", record.path)
                }
                SyncEvent::Finished {
                    downloaded,
                    uploaded,
                    removed,
                    conflicts,
                } => {
                    println!(
                        "done: {} down, {} up, {} removed, {} conflicts",
                        downloaded, uploaded, removed, conflicts
                    );
                }
            }
        }
    });

    let client = SyncClient::new(ClientConfig {
        server_addr: server,
        root,
        owner,
    })
    .with_events(event_tx);

    let outcome = client.run().await;
    drop(client); // closes the event channel so the printer drains out
    printer.await?;
    outcome?;
    Ok(())
}
