//! Opening and authenticating backend connections

use bytes::BytesMut;
use std::time::Duration;
use tracing::{debug, warn};

use super::BackendConnection;
use crate::config::{RouteConfig, StorageConfig};
use crate::error::{BackendError, ProtocolError};
use crate::network::dial;
use crate::protocol::codec::{self, AuthRequest};
use crate::protocol::{ParamSet, StartupParams, backend};
use crate::relay::Framer;
use crate::stream::AsyncStream;
use crate::types::{CancelKey, ServerId};

/// Login used for a backend: route overrides first, then the client's own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login<'a> {
    pub user: &'a str,
    pub database: &'a str,
    pub password: Option<&'a str>,
}

impl<'a> Login<'a> {
    pub fn resolve(route: &'a RouteConfig, client: &'a StartupParams) -> Self {
        Self {
            user: route.storage_user.as_deref().unwrap_or(&client.user),
            database: route.storage_db.as_deref().unwrap_or(&client.database),
            password: route.storage_password.as_deref(),
        }
    }
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
#[must_use]
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Dial a storage and run the startup handshake
pub async fn connect(
    id: ServerId,
    storage: &StorageConfig,
    route: &RouteConfig,
    client: &StartupParams,
    connect_timeout: Duration,
    readahead: usize,
) -> Result<BackendConnection, BackendError> {
    let io = dial(storage, connect_timeout).await?;
    let login = Login::resolve(route, client);
    debug!(
        "Server {} connecting to {} as {}@{} over {}",
        id.short(),
        storage.target(),
        login.user,
        login.database,
        io.kind()
    );
    tokio::time::timeout(
        connect_timeout,
        handshake(id, io, &login, readahead, storage.target()),
    )
    .await
    .map_err(|_| BackendError::Timeout(connect_timeout))?
}

/// Startup and authentication over an already open stream
pub async fn handshake<S: AsyncStream>(
    id: ServerId,
    mut io: S,
    login: &Login<'_>,
    readahead: usize,
    target: String,
) -> Result<BackendConnection<S>, BackendError> {
    use tokio::io::AsyncWriteExt;

    let mut out = BytesMut::with_capacity(128);
    codec::startup_message(
        &mut out,
        &[("user", login.user), ("database", login.database)],
    );
    io.write_all(&out).await?;
    io.flush().await?;

    let mut framer = Framer::new(readahead);
    let mut params = ParamSet::new();
    let mut key = None;

    loop {
        let msg = framer.read_frame(&mut io).await?;
        let body = codec::body(&msg);
        match msg[0] {
            backend::AUTHENTICATION => {
                let reply = match codec::parse_auth_request(body)? {
                    AuthRequest::Ok => continue,
                    AuthRequest::Cleartext => {
                        login.password.ok_or(BackendError::PasswordRequired)?.to_owned()
                    }
                    AuthRequest::Md5 { salt } => {
                        let password = login.password.ok_or(BackendError::PasswordRequired)?;
                        md5_password(login.user, password, salt)
                    }
                    AuthRequest::Other(code) => return Err(BackendError::UnsupportedAuth(code)),
                };
                out.clear();
                codec::password(&mut out, &reply);
                io.write_all(&out).await?;
                io.flush().await?;
            }
            backend::BACKEND_KEY_DATA => key = Some(codec::parse_backend_key_data(body)?),
            backend::PARAMETER_STATUS => {
                let (name, value) = codec::parse_parameter_status(body)?;
                params.set(&name, &value);
            }
            backend::NOTICE_RESPONSE => {
                let notice = codec::parse_error_fields(body)?;
                debug!("Server {} notice during startup: {}", id.short(), notice.message);
            }
            backend::ERROR_RESPONSE => {
                let err = codec::parse_error_fields(body)?;
                warn!(
                    "Server {} rejected startup ({}): {}",
                    id.short(),
                    err.code,
                    err.message
                );
                return Err(BackendError::Rejected {
                    code: err.code,
                    message: err.message,
                });
            }
            backend::READY_FOR_QUERY => break,
            tag => {
                return Err(ProtocolError::Unexpected {
                    tag: tag as char,
                    phase: "backend startup",
                }
                .into());
            }
        }
    }

    // Some servers (and poolers in front of them) never send a key
    let key = key.unwrap_or(CancelKey::new(0, 0));
    debug!(
        "Server {} ready (pid {}, {} parameters)",
        id.short(),
        key.pid,
        params.len()
    );
    Ok(BackendConnection::new(id, io, framer, key, params, target))
}
