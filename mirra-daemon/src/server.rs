//! TCP listener loop and server lifecycle
//!
//! One listener task accepts connections; every accepted connection gets
//! its own handler task that owns the framed command loop exclusively.
//! Shutdown stops accepting first, then waits a bounded time for
//! in-flight handlers; stragglers are abandoned, never aborted mid-write
//! (staged data is safe, nothing reaches the live tree before commit).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mirra_index::{Blake3Provider, DigestProvider, IndexConfig};
use mirra_sync::{SessionConfig, SessionStore};

use crate::errors::Result;
use crate::handler::{handle_connection, ServerCtx};
use crate::resolver::RootResolver;

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub session: SessionConfig,
    /// Bounded wait for in-flight connections during shutdown.
    pub shutdown_timeout: Duration,
    /// Spacing of the expired-session sweep.
    pub reaper_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9851)),
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

/// Handle for requesting shutdown from outside the accept loop.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The sync server: listener, session store and background reaper.
pub struct SyncServer {
    listener: TcpListener,
    ctx: Arc<ServerCtx>,
    config: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncServer {
    /// Bind the listener. The digest provider defaults to BLAKE3.
    pub async fn bind(config: ServerConfig, resolver: Arc<dyn RootResolver>) -> Result<Self> {
        Self::bind_with_digest(config, resolver, Arc::new(Blake3Provider)).await
    }

    pub async fn bind_with_digest(
        config: ServerConfig,
        resolver: Arc<dyn RootResolver>,
        digest: Arc<dyn DigestProvider>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Sync server listening on {}", listener.local_addr()?);

        let ctx = Arc::new(ServerCtx {
            store: SessionStore::new(config.session.clone()),
            resolver,
            digest,
            index_config: IndexConfig::default(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            listener,
            ctx,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Actual bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let reaper = {
            let ctx = self.ctx.clone();
            let interval = self.config.reaper_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    ctx.store.evict_expired().await;
                }
            })
        };

        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let ctx = self.ctx.clone();
                            handlers.push(tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    warn!("Connection from {} failed: {}", peer, e);
                                }
                            }));
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    }
                    handlers.retain(|handle| !handle.is_finished());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Stop accepting before waiting on in-flight work.
        drop(self.listener);
        reaper.abort();

        let in_flight = handlers.iter().filter(|h| !h.is_finished()).count();
        if in_flight > 0 {
            info!("Waiting for {} in-flight connections", in_flight);
        }
        let wait_all = async {
            for handle in handlers.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, wait_all)
            .await
            .is_err()
        {
            // Abandoned, not aborted: a partial shadow write is safe.
            warn!("Shutdown timeout reached, abandoning remaining connections");
        }

        info!("Sync server stopped");
        Ok(())
    }
}
