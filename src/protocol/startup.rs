//! Startup phase: the untagged packets a client sends before any message

use tokio::io::{AsyncRead, AsyncReadExt};

use super::codec::read_cstr;
use super::params::ParamSet;
use crate::constants::buffer::MAX_STARTUP;
use crate::constants::startup::{
    CANCEL_LEN, CANCEL_REQUEST, GSSENC_REQUEST, PROTOCOL_V3, SSL_REQUEST,
};
use crate::error::{FrameError, ProtocolError};
use crate::types::CancelKey;

/// What a client asked for in its first packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPacket {
    Startup(StartupParams),
    SslRequest,
    GssEncRequest,
    Cancel(CancelKey),
}

/// Login parameters from a StartupMessage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupParams {
    pub user: String,
    pub database: String,
    /// Everything except `user` and `database`
    pub options: ParamSet,
}

impl StartupParams {
    fn parse(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let mut user = None;
        let mut database = None;
        let mut options = ParamSet::new();
        loop {
            let name = read_cstr(&mut data, "StartupMessage")?;
            if name.is_empty() {
                break;
            }
            let value = read_cstr(&mut data, "StartupMessage")?;
            match name {
                "user" => user = Some(value.to_owned()),
                "database" => database = Some(value.to_owned()),
                _ => {
                    options.set(name, value);
                }
            }
        }
        let user = user.filter(|u| !u.is_empty()).ok_or(ProtocolError::MissingUser)?;
        let database = database
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| user.clone());
        Ok(Self {
            user,
            database,
            options,
        })
    }
}

/// Read one startup-phase packet
///
/// Called again after an SSL or GSSAPI request has been refused.
pub async fn read_startup<R>(io: &mut R) -> Result<StartupPacket, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match io.read_i32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len < 8 || len as usize > MAX_STARTUP {
        return Err(ProtocolError::BadStartupLength(len.into()).into());
    }

    let mut packet = vec![0u8; len as usize - 4];
    io.read_exact(&mut packet).await?;
    let code = i32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    let rest = &packet[4..];

    match code {
        SSL_REQUEST => Ok(StartupPacket::SslRequest),
        GSSENC_REQUEST => Ok(StartupPacket::GssEncRequest),
        CANCEL_REQUEST => {
            if len as usize != CANCEL_LEN {
                return Err(ProtocolError::BadStartupLength(len.into()).into());
            }
            let pid = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let secret = i32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
            Ok(StartupPacket::Cancel(CancelKey::new(pid, secret)))
        }
        PROTOCOL_V3 => Ok(StartupPacket::Startup(StartupParams::parse(rest)?)),
        other => Err(ProtocolError::UnsupportedVersion {
            major: (other >> 16) as u16,
            minor: (other & 0xffff) as u16,
        }
        .into()),
    }
}
