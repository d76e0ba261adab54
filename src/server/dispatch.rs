//! Per-connection dispatch loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::manager::CollectionManager;
use crate::protocol::codec::read_frame;
use crate::protocol::{CommandKind, Response, Status};
use crate::query::QueryEngine;
use crate::txn::TransactionManager;

use super::handlers;
use super::session::SessionPool;

/// Shared state for every connection
pub struct ServerCtx {
    pub mgr: Arc<CollectionManager>,
    pub txns: TransactionManager,
    pub engine: QueryEngine,
    pub pool: SessionPool,
    pub idle_timeout: Duration,
}

impl ServerCtx {
    pub fn new(mgr: Arc<CollectionManager>) -> Arc<Self> {
        let config = mgr.config();
        Arc::new(Self {
            txns: TransactionManager::new(mgr.clone()),
            engine: QueryEngine::new(mgr.clone()),
            pool: SessionPool::new(config.server.pool_size),
            idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
            mgr,
        })
    }
}

/// Run one connection to completion. Generic over the stream so tests can
/// drive it over an in-memory duplex.
pub async fn handle_conn<S>(stream: S, peer: SocketAddr, ctx: Arc<ServerCtx>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let Some(mut session) = ctx.pool.acquire() else {
        warn!(%peer, "connection refused: session pool exhausted");
        let _ = Response::error(Status::Error, "server at capacity")
            .write_to(&mut writer)
            .await;
        return;
    };

    debug!(%peer, "connection open");

    loop {
        let frame = match tokio::time::timeout(ctx.idle_timeout, read_frame(&mut reader)).await {
            Err(_) => {
                debug!(%peer, "idle timeout, closing connection");
                break;
            }
            Ok(Ok(None)) => break, // clean EOF
            Ok(Ok(Some(frame))) => frame,
            Ok(Err(e)) => {
                // The stream position is unreliable after a framing error
                let _ = Response::error(Status::BadCommand, e.to_string())
                    .write_to(&mut writer)
                    .await;
                warn!(%peer, error = %e, "framing error, closing connection");
                break;
            }
        };

        let (type_byte, payload) = frame;
        let Some(kind) = CommandKind::from_u8(type_byte) else {
            // The payload was length-prefixed and fully drained, so the
            // connection survives an unknown command type
            let respond = Response::error(
                Status::BadCommand,
                format!("unknown command type {}", type_byte),
            )
            .write_to(&mut writer)
            .await;
            if respond.is_err() {
                break;
            }
            continue;
        };

        let response = handlers::handle(&ctx, &mut session, peer, kind, payload).await;
        if response.write_to(&mut writer).await.is_err() {
            debug!(%peer, "write failed, closing connection");
            break;
        }
    }

    // Implicit rollback of an open transaction, then return to the pool
    if let Some(tx) = session.tx.take() {
        ctx.txns.rollback_if_open(tx);
    }
    ctx.pool.release(session);
    debug!(%peer, "connection closed");
}
