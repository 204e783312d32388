//! Query cancellation
//!
//! Clients only ever see the keys the pooler generated for them. A cancel
//! request carrying such a key is translated to the key of the server the
//! client is attached to and sent to that server's storage over a fresh
//! connection, as the protocol requires.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::BackendError;
use crate::network::dial;
use crate::protocol::codec;
use crate::router::RouterHandle;
use crate::types::CancelKey;

/// Send a CancelRequest for `key` to a storage
pub async fn send_cancel(
    storage: &StorageConfig,
    key: CancelKey,
    timeout: Duration,
) -> Result<(), BackendError> {
    let mut io = dial(storage, timeout).await?;
    let mut buf = BytesMut::with_capacity(16);
    codec::cancel_request(&mut buf, key);
    io.write_all(&buf).await?;
    io.flush().await?;
    let _ = io.shutdown().await;
    Ok(())
}

/// Forward a client's cancel request to the server it is attached to
///
/// Returns false, without touching the network, when no Active server
/// belongs to a client holding `key`.
pub async fn cancel(router: &RouterHandle, key: CancelKey, timeout: Duration) -> bool {
    let Some(target) = router.cancel_target(key).await else {
        debug!("Cancel for unknown key {}", key);
        return false;
    };
    if target.storage.is_local() {
        return false;
    }
    info!(
        "Cancelling server {} ({}) for key {}",
        target.server.short(),
        target.storage.target(),
        key
    );
    match send_cancel(&target.storage, target.key, timeout).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Cancel to {} failed: {}", target.storage.target(), e);
            false
        }
    }
}
