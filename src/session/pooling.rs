//! Main loop of a pooled session
//!
//! While detached the session only reads from its client. The first message
//! that needs a backend triggers attach, connect (for a new slot), deploy and
//! then the relay, which runs until the transaction or the session ends.

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::SessionContext;
use crate::backend::{ResetOutcome, connect, reset};
use crate::deploy::deploy;
use crate::error::{AttachError, FrameError, SessionError};
use crate::protocol::{StartupParams, frontend};
use crate::relay::{ClientSide, RelayOptions, RelayOutcome, relay};
use crate::route::RouteStats;
use crate::router::{Routed, ServerConn, attach};
use crate::stream::AsyncStream;
use crate::types::ClientId;

/// Relay client traffic through pooled servers until the client leaves
pub async fn run<C: AsyncStream>(
    ctx: &SessionContext,
    id: ClientId,
    client: &mut ClientSide<C>,
    routed: &Routed,
    login: &StartupParams,
    kill: &Notify,
) -> Result<(), SessionError> {
    let opts = RelayOptions {
        pool: routed.config.pool,
        pipeline_flush: ctx.pipeline_flush,
    };

    loop {
        let Some(first) = next_request(client, kill).await? else {
            return Ok(());
        };

        let mut conn = acquire(ctx, id, client, routed, login, kill).await?;
        let mut stats = RouteStats::default();
        let outcome = relay(client, &mut conn, Some(first), opts, kill, &mut stats).await;
        match outcome {
            Ok(RelayOutcome::Released) => {
                ctx.router.detach(id, conn, stats);
            }
            Ok(RelayOutcome::Terminated) => {
                release(ctx, id, conn, routed, stats).await;
                return Ok(());
            }
            Ok(RelayOutcome::Killed) => {
                release(ctx, id, conn, routed, stats).await;
                return Err(SessionError::Killed);
            }
            Err(e) if e.server_healthy() => {
                release(ctx, id, conn, routed, stats).await;
                return Err(e.into());
            }
            Err(e) => {
                discard(ctx, id, conn, stats);
                return Err(e.into());
            }
        }
    }
}

/// Wait for the next client message while no server is attached
///
/// `None` means the client is done: it sent Terminate or hung up.
async fn next_request<C: AsyncStream>(
    client: &mut ClientSide<C>,
    kill: &Notify,
) -> Result<Option<Bytes>, SessionError> {
    let frame = tokio::select! {
        frame = client.framer.read_frame(&mut client.io) => frame,
        _ = kill.notified() => return Err(SessionError::Killed),
    };
    match frame {
        Ok(frame) if frame[0] == frontend::TERMINATE => Ok(None),
        Ok(frame) => Ok(Some(frame)),
        Err(FrameError::Closed) => Ok(None),
        Err(e) => Err(SessionError::client_frame(e)),
    }
}

/// Attach, connect if the slot is new, then deploy the client's parameters
async fn acquire<C: AsyncStream>(
    ctx: &SessionContext,
    id: ClientId,
    client: &ClientSide<C>,
    routed: &Routed,
    login: &StartupParams,
    kill: &Notify,
) -> Result<ServerConn, SessionError> {
    let lease = match attach(&ctx.router, id, routed.config.pool_timeout, kill).await {
        Ok(lease) => lease,
        Err(AttachError::Killed) => return Err(SessionError::Killed),
        Err(e) => return Err(e.into()),
    };
    let server = lease.server;

    let mut conn = match lease.conn {
        Some(conn) => conn,
        None => {
            match connect(
                server,
                &lease.storage,
                &lease.config,
                login,
                ctx.connect_timeout,
                ctx.readahead,
            )
            .await
            {
                Ok(conn) => {
                    debug!(
                        "Server {} connected to {} for client {}",
                        server.short(),
                        conn.target(),
                        id.short()
                    );
                    ctx.router
                        .backend_ready(server, conn.key(), conn.params().clone());
                    conn
                }
                Err(e) => {
                    warn!("Server {} connect failed: {}", server.short(), e);
                    ctx.router.close(id, server, RouteStats::default());
                    return Err(e.into());
                }
            }
        }
    };

    if let Err(e) = deploy(&mut conn, id, &client.params, lease.config.pool_discard).await {
        warn!("Server {} deploy failed: {}", server.short(), e);
        discard(ctx, id, conn, RouteStats::default());
        return Err(e.into());
    }
    Ok(conn)
}

/// Reset a server the client is done with, then pool or close it
async fn release(
    ctx: &SessionContext,
    id: ClientId,
    mut conn: ServerConn,
    routed: &Routed,
    stats: RouteStats,
) {
    match reset(&mut conn, &routed.config, &routed.storage, ctx.connect_timeout).await {
        ResetOutcome::Ready => ctx.router.detach(id, conn, stats),
        ResetOutcome::Drop(reason) => {
            debug!("Server {} closed: {}", conn.id().short(), reason);
            discard(ctx, id, conn, stats);
        }
    }
}

/// Free the slot and close the connection
fn discard(ctx: &SessionContext, id: ClientId, conn: ServerConn, stats: RouteStats) {
    ctx.router.close(id, conn.id(), stats);
    tokio::spawn(conn.terminate());
}
