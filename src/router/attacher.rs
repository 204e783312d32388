//! Waiting for a server on behalf of one client
//!
//! The router answers an attach immediately: with a server, or with a
//! receiver on which a server will be handed over later. Waiting happens
//! here, in the client's own task, so the router never blocks.

use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use super::{Attached, RouterHandle, ServerLease};
use crate::error::AttachError;
use crate::route::RouteStats;
use crate::types::ClientId;

/// Obtain a server for `client`, waiting up to `pool_timeout` if queued
///
/// A zero `pool_timeout` waits indefinitely. A kill ends the wait early.
/// When the wait ends without a server the receiver is closed first and
/// then drained once, so a server handed over at the very last moment is
/// not lost: it is taken after a timeout and given back after a kill.
pub async fn attach(
    router: &RouterHandle,
    client: ClientId,
    pool_timeout: Duration,
    kill: &Notify,
) -> Result<ServerLease, AttachError> {
    let mut rx = match router.attach(client).await? {
        Attached::Ready(lease) => return Ok(lease),
        Attached::Queued(rx) => rx,
    };

    let gave_up = tokio::select! {
        biased;
        _ = kill.notified() => AttachError::Killed,
        handed = wait(&mut rx, pool_timeout) => match handed {
            Some(handed) => return handed.map_err(|_| AttachError::RouterGone),
            None => AttachError::Timeout(pool_timeout),
        },
    };

    rx.close();
    if let Ok(lease) = rx.try_recv() {
        if gave_up != AttachError::Killed {
            debug!("Client {} got a server as its wait expired", client.short());
            return Ok(lease);
        }
        match lease.conn {
            Some(conn) => router.detach(client, conn, RouteStats::default()),
            None => router.close(client, lease.server, RouteStats::default()),
        }
        return Err(gave_up);
    }
    router.queue_timeout(client);
    debug!("Client {} left the queue: {}", client.short(), gave_up);
    Err(gave_up)
}

/// `None` once `limit` passes (never, for a zero limit)
async fn wait(
    rx: &mut oneshot::Receiver<ServerLease>,
    limit: Duration,
) -> Option<Result<ServerLease, oneshot::error::RecvError>> {
    if limit.is_zero() {
        Some(rx.await)
    } else {
        tokio::time::timeout(limit, rx).await.ok()
    }
}
