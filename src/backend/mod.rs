//! Backend (PostgreSQL server) connections
//!
//! A [`BackendConnection`] is the unit the server pools hold. Besides the
//! socket it tracks just enough protocol state to decide whether the
//! connection can be handed to another client: transaction status, copy
//! mode, and the balance of Sync-type requests against ReadyForQuery
//! replies.

pub mod connect;
pub mod reset;

pub use connect::{connect, md5_password};
pub use reset::{ResetOutcome, reset};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::FrameError;
use crate::protocol::{ParamSet, codec, status};
use crate::relay::Framer;
use crate::stream::{AsyncStream, ConnectionStream};
use crate::types::{CancelKey, ClientId, ServerId};

pub struct BackendConnection<S = ConnectionStream> {
    id: ServerId,
    io: S,
    framer: Framer,
    /// Key the backend handed out in BackendKeyData
    key: CancelKey,
    /// Parameters the backend has reported so far
    params: ParamSet,
    pub is_transaction: bool,
    pub is_copy: bool,
    /// ReadyForQuery replies still owed to an in-flight deploy
    pub deploy_sync: u32,
    /// Sync-type requests forwarded (Query, Sync, FunctionCall)
    pub sync_request: u64,
    /// ReadyForQuery replies relayed back
    pub sync_reply: u64,
    /// Client whose parameters are currently applied
    pub last_client: Option<ClientId>,
    target: String,
}

impl<S> std::fmt::Debug for BackendConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("key", &self.key)
            .field("is_transaction", &self.is_transaction)
            .field("is_copy", &self.is_copy)
            .field("sync_request", &self.sync_request)
            .field("sync_reply", &self.sync_reply)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncStream> BackendConnection<S> {
    pub fn new(
        id: ServerId,
        io: S,
        framer: Framer,
        key: CancelKey,
        params: ParamSet,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id,
            io,
            framer,
            key,
            params,
            is_transaction: false,
            is_copy: false,
            deploy_sync: 0,
            sync_request: 0,
            sync_reply: 0,
            last_client: None,
            target: target.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ServerId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> CancelKey {
        self.key
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Every request that expects a ReadyForQuery has received it
    #[inline]
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.sync_request == self.sync_reply
    }

    /// Socket and framer, borrowed together for the relay
    pub fn parts(&mut self) -> (&mut S, &mut Framer) {
        (&mut self.io, &mut self.framer)
    }

    /// Write raw protocol bytes and flush
    pub async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.io.write_all(data).await?;
        self.io.flush().await
    }

    /// Read one complete message
    pub async fn read_message(&mut self) -> Result<Bytes, FrameError> {
        self.framer.read_frame(&mut self.io).await
    }

    /// Account for a relayed ReadyForQuery
    pub fn on_ready(&mut self, status_byte: u8) {
        self.is_transaction = status_byte != status::IDLE;
        self.is_copy = false;
        self.sync_reply += 1;
    }

    /// Say goodbye and close the socket; errors are irrelevant by now
    pub async fn terminate(mut self) {
        let mut buf = BytesMut::with_capacity(codec::HEADER_LEN);
        codec::terminate(&mut buf);
        if let Err(e) = self.io.write_all(&buf).await {
            debug!("Terminate to server {} failed: {}", self.id.short(), e);
        }
        let _ = self.io.shutdown().await;
        debug!("Closed server {} ({})", self.id.short(), self.target);
    }
}
