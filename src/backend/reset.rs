//! Returning a backend to a reusable state after a client is done with it

use bytes::BytesMut;
use std::time::Duration;
use tracing::debug;

use super::BackendConnection;
use crate::cancel::send_cancel;
use crate::config::{RouteConfig, StorageConfig};
use crate::constants::timing::RESET_WAIT;
use crate::error::BackendError;
use crate::protocol::{backend, codec};
use crate::stream::AsyncStream;

/// Cancel requests sent before giving up on a stalled server
const CANCEL_LIMIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Synchronized, outside any transaction
    Ready,
    /// Must be closed; the reason is for logs
    Drop(&'static str),
}

impl ResetOutcome {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Bring a server back to an idle, synchronized state
///
/// Outstanding replies are drained with a one second wait each; a server
/// that stays silent gets one cancel request before it is given up on. An
/// open transaction is rolled back. Each step can be switched off per route,
/// in which case the server is dropped instead.
pub async fn reset<S: AsyncStream>(
    conn: &mut BackendConnection<S>,
    route: &RouteConfig,
    storage: &StorageConfig,
    connect_timeout: Duration,
) -> ResetOutcome {
    reset_with_wait(conn, route, storage, connect_timeout, RESET_WAIT).await
}

pub(crate) async fn reset_with_wait<S: AsyncStream>(
    conn: &mut BackendConnection<S>,
    route: &RouteConfig,
    storage: &StorageConfig,
    connect_timeout: Duration,
    wait: Duration,
) -> ResetOutcome {
    let id = conn.id().short();
    if conn.is_copy {
        debug!("Server {} reset: in copy, closing", id);
        return ResetOutcome::Drop("in copy");
    }
    if conn.is_transaction && !route.pool_rollback {
        debug!("Server {} reset: in active transaction, closing", id);
        return ResetOutcome::Drop("in transaction");
    }
    if !conn.is_synchronized() && !route.pool_cancel {
        debug!("Server {} reset: not synchronized, closing", id);
        return ResetOutcome::Drop("not synchronized");
    }

    let mut cancels = 0;
    while !conn.is_synchronized() {
        debug!(
            "Server {} reset: {} repl(ies) outstanding, waiting {:?}",
            id,
            conn.sync_request.saturating_sub(conn.sync_reply),
            wait
        );
        match tokio::time::timeout(wait, drain_one(conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Server {} reset: {}", id, e);
                return ResetOutcome::Drop("read failed");
            }
            Err(_) if cancels < CANCEL_LIMIT => {
                cancels += 1;
                debug!("Server {} reset: not responding, cancel #{}", id, cancels);
                if let Err(e) = send_cancel(storage, conn.key(), connect_timeout).await {
                    debug!("Server {} reset: cancel failed: {}", id, e);
                    return ResetOutcome::Drop("cancel failed");
                }
            }
            Err(_) => {
                debug!("Server {} reset: cancel limit reached, closing", id);
                return ResetOutcome::Drop("not responding");
            }
        }
    }

    if conn.is_transaction {
        match tokio::time::timeout(wait, rollback(conn)).await {
            Ok(Ok(())) if !conn.is_transaction => {}
            Ok(Ok(())) => return ResetOutcome::Drop("rollback left a transaction open"),
            Ok(Err(e)) => {
                debug!("Server {} reset: rollback failed: {}", id, e);
                return ResetOutcome::Drop("rollback failed");
            }
            Err(_) => return ResetOutcome::Drop("rollback timed out"),
        }
    }

    debug!("Server {} reset: synchronized", id);
    ResetOutcome::Ready
}

/// Read one message; ReadyForQuery settles one outstanding request
async fn drain_one<S: AsyncStream>(conn: &mut BackendConnection<S>) -> Result<(), BackendError> {
    let msg = conn.read_message().await?;
    if msg[0] == backend::READY_FOR_QUERY {
        let status = codec::parse_ready_status(codec::body(&msg))?;
        conn.on_ready(status);
    } else if msg[0] == backend::COPY_IN_RESPONSE || msg[0] == backend::COPY_BOTH_RESPONSE {
        conn.is_copy = true;
    }
    Ok(())
}

async fn rollback<S: AsyncStream>(conn: &mut BackendConnection<S>) -> Result<(), BackendError> {
    let mut buf = BytesMut::with_capacity(16);
    codec::query(&mut buf, "ROLLBACK");
    conn.send(&buf).await?;
    conn.sync_request += 1;
    loop {
        let msg = conn.read_message().await?;
        match msg[0] {
            backend::READY_FOR_QUERY => {
                let status = codec::parse_ready_status(codec::body(&msg))?;
                conn.on_ready(status);
                return Ok(());
            }
            backend::ERROR_RESPONSE => {
                let err = codec::parse_error_fields(codec::body(&msg))?;
                debug!("Server {} ROLLBACK error: {}", conn.id().short(), err.message);
            }
            _ => {}
        }
    }
}
