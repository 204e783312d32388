//! Client side of the startup phase: negotiation, password check and the
//! greeting that makes the client believe it is talking to a server

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::RouteConfig;
use crate::constants::DEFAULT_SERVER_PARAMS;
use crate::error::{FrameError, ProtocolError, SessionError};
use crate::protocol::{ParamSet, StartupPacket, StartupParams, codec, frontend, read_startup, status};
use crate::relay::ClientSide;
use crate::stream::AsyncStream;
use crate::types::CancelKey;

/// What the client opened the connection for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opening {
    Login(StartupParams),
    Cancel(CancelKey),
}

/// Read startup packets until a login or a cancel request arrives
///
/// Encryption requests are refused with a single `N`; the client then
/// either continues in plain text or goes away.
pub async fn negotiate<C: AsyncStream>(io: &mut C) -> Result<Opening, SessionError> {
    loop {
        match read_startup(io).await.map_err(SessionError::client_frame)? {
            StartupPacket::SslRequest | StartupPacket::GssEncRequest => {
                debug!("Refusing encryption request");
                io.write_all(b"N").await?;
                io.flush().await?;
            }
            StartupPacket::Cancel(key) => return Ok(Opening::Cancel(key)),
            StartupPacket::Startup(params) => return Ok(Opening::Login(params)),
        }
    }
}

/// Ask for a cleartext password when the route requires one
pub async fn authenticate<C: AsyncStream>(
    client: &mut ClientSide<C>,
    route: &RouteConfig,
    user: &str,
) -> Result<(), SessionError> {
    let Some(expected) = route.password.as_deref() else {
        return Ok(());
    };

    let mut out = BytesMut::new();
    codec::auth_cleartext(&mut out);
    client.send(&out).await?;

    let msg = match client.framer.read_frame(&mut client.io).await {
        Ok(msg) => msg,
        Err(FrameError::Closed) => return Err(SessionError::Closed),
        Err(e) => return Err(SessionError::client_frame(e)),
    };
    if msg[0] != frontend::PASSWORD {
        return Err(ProtocolError::Unexpected {
            tag: msg[0] as char,
            phase: "authentication",
        }
        .into());
    }
    let password = codec::parse_password(codec::body(&msg))?;
    if password != expected {
        return Err(SessionError::AuthFailed(user.to_string()));
    }
    Ok(())
}

/// Parameters a new client is told about
///
/// The route's last known backend parameters (or a small default set when
/// no backend has been seen yet), overridden by the client's own startup
/// options.
#[must_use]
pub fn client_params(route_params: &ParamSet, startup: &StartupParams) -> ParamSet {
    let mut params = if route_params.is_empty() {
        DEFAULT_SERVER_PARAMS.iter().copied().collect()
    } else {
        route_params.clone()
    };
    params.merge(&startup.options);
    params
}

/// AuthenticationOk, ParameterStatus*, BackendKeyData, ReadyForQuery
pub fn greeting(params: &ParamSet, key: CancelKey) -> BytesMut {
    let mut out = BytesMut::with_capacity(512);
    codec::auth_ok(&mut out);
    for (name, value) in params.iter() {
        codec::parameter_status(&mut out, name, value);
    }
    codec::backend_key_data(&mut out, key);
    codec::ready_for_query(&mut out, status::IDLE);
    out
}
