//! Client session management
//!
//! One [`ClientSession`] runs per accepted connection. It negotiates the
//! startup phase itself, routes the client, greets it as a server would and
//! then hands over either to the admin console or to the pooled main loop.
//! Whatever happens, the client's server is back in a valid pool state
//! before the client is unrouted.

pub mod pooling;
pub mod startup;

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cancel;
use crate::config::GeneralConfig;
use crate::console;
use crate::constants::timing::STARTUP_TIMEOUT;
use crate::error::SessionError;
use crate::protocol::{ParamSet, codec};
use crate::relay::{BufferPool, ClientSide, Framer};
use crate::router::{RouteRequest, RouterHandle};
use crate::stream::AsyncStream;
use crate::types::{CancelKey, ClientId};

use startup::Opening;

/// What every session needs from the process
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub router: RouterHandle,
    pub buffers: BufferPool,
    pub connect_timeout: Duration,
    pub readahead: usize,
    pub pipeline_flush: usize,
    pub client_fwd_error: bool,
}

impl SessionContext {
    pub fn new(router: RouterHandle, buffers: BufferPool, general: &GeneralConfig) -> Self {
        Self {
            router,
            buffers,
            connect_timeout: general.connect_timeout,
            readahead: general.readahead,
            pipeline_flush: general.pipeline_flush,
            client_fwd_error: general.client_fwd_error,
        }
    }
}

/// Represents an active client session
pub struct ClientSession {
    id: ClientId,
    peer: String,
    ctx: Arc<SessionContext>,
}

impl ClientSession {
    pub fn new(peer: impl Into<String>, ctx: Arc<SessionContext>) -> Self {
        Self {
            id: ClientId::new(),
            peer: peer.into(),
            ctx,
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Drive the connection to its end
    ///
    /// Failures the client can still hear about are reported to it as a
    /// FATAL ErrorResponse before the error is returned.
    pub async fn run<C: AsyncStream>(self, io: C) -> Result<(), SessionError> {
        let buffer = self.ctx.buffers.acquire();
        let framer = Framer::with_buffer(buffer, self.ctx.readahead);
        let mut client = ClientSide::new(io, framer, ParamSet::new());

        let result = self.serve(&mut client).await;
        if let Err(e) = &result {
            self.log_failure(e);
            if e.client_reachable() {
                let mut out = BytesMut::new();
                codec::error_response(&mut out, "FATAL", e.sqlstate(), &self.client_message(e));
                let _ = client.send(&out).await;
            }
        }

        let ClientSide { framer, .. } = client;
        self.ctx.buffers.release(framer.into_buffer());
        result
    }

    async fn serve<C: AsyncStream>(&self, client: &mut ClientSide<C>) -> Result<(), SessionError> {
        let opening = match tokio::time::timeout(STARTUP_TIMEOUT, startup::negotiate(&mut client.io)).await {
            Ok(Err(SessionError::Closed)) => return Ok(()),
            Ok(result) => result?,
            Err(_) => {
                debug!("Client {} ({}) startup timed out", self.id.short(), self.peer);
                return Ok(());
            }
        };

        let login = match opening {
            Opening::Cancel(key) => {
                cancel::cancel(&self.ctx.router, key, self.ctx.connect_timeout).await;
                return Ok(());
            }
            Opening::Login(login) => login,
        };

        let key = CancelKey::for_client(&self.id);
        let kill = Arc::new(Notify::new());
        let routed = self
            .ctx
            .router
            .route(
                RouteRequest {
                    client: self.id,
                    key,
                    database: login.database.clone(),
                    user: login.user.clone(),
                },
                kill.clone(),
            )
            .await?;
        info!(
            "Client {} ({}) routed to {}.{} ({} pooling)",
            self.id.short(),
            self.peer,
            login.database,
            login.user,
            routed.config.pool
        );

        let result: Result<(), SessionError> = async {
            startup::authenticate(client, &routed.config, &login.user).await?;
            client.params = startup::client_params(&routed.params, &login);
            client.send(&startup::greeting(&client.params, key)).await?;

            if routed.storage.is_local() {
                console::serve(client, &self.ctx.router, &kill).await
            } else {
                pooling::run(&self.ctx, self.id, client, &routed, &login, &kill).await
            }
        }
        .await;

        self.ctx.router.unroute(self.id);
        debug!("Client {} unrouted", self.id.short());
        result
    }

    /// Text of the ErrorResponse sent for `err`
    fn client_message(&self, err: &SessionError) -> String {
        match err {
            SessionError::Backend(_) | SessionError::Deploy(_) if !self.ctx.client_fwd_error => {
                "failed to connect to remote server".to_string()
            }
            SessionError::Relay(e) if !e.server_healthy() => "remote server read/write error".to_string(),
            _ => err.to_string(),
        }
    }

    fn log_failure(&self, err: &SessionError) {
        let id = self.id.short();
        match err {
            SessionError::Relay(e) => match e.log_level() {
                tracing::Level::ERROR => error!("Client {} relay failed: {}", id, e),
                tracing::Level::WARN => warn!("Client {} relay failed: {}", id, e),
                _ => debug!("Client {} disconnected: {}", id, e),
            },
            SessionError::Closed | SessionError::Io(_) => debug!("Client {} disconnected: {}", id, err),
            SessionError::Killed => info!("Client {} killed", id),
            SessionError::Backend(_) | SessionError::Deploy(_) => error!("Client {}: {}", id, err),
            _ => warn!("Client {}: {}", id, err),
        }
    }
}
