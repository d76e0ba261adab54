//! TLS TCP server: accept loop and connection lifecycle

pub mod dispatch;
pub mod handlers;
pub mod session;
pub mod tls;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::manager::CollectionManager;

pub use dispatch::{handle_conn, ServerCtx};

pub struct Server {
    ctx: Arc<ServerCtx>,
    mgr: Arc<CollectionManager>,
}

impl Server {
    /// Open the storage stack and prepare the shared state
    pub async fn new(config: Config) -> Result<Self> {
        let mgr = CollectionManager::open(config).await?;
        let ctx = ServerCtx::new(mgr.clone());
        Ok(Self { ctx, mgr })
    }

    pub fn manager(&self) -> &Arc<CollectionManager> {
        &self.mgr
    }

    pub fn ctx(&self) -> &Arc<ServerCtx> {
        &self.ctx
    }

    /// Accept connections until `shutdown` resolves, then flush and stop
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let config = self.mgr.config().clone();
        let acceptor = tls::build_acceptor(&config.tls)?;
        let listener = TcpListener::bind(&config.server.listen_addr).await?;
        info!(addr = %config.server.listen_addr, "listening (TLS)");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(tls_stream) => handle_conn(tls_stream, peer, ctx).await,
                            Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        if let Err(e) = self.mgr.shutdown().await {
            error!(error = %e, "error during shutdown flush");
            return Err(e);
        }
        Ok(())
    }
}
