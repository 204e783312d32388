//! Socket setup for frontend and backend connections

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::BackendError;
use crate::stream::ConnectionStream;

/// Latency-oriented options for a TCP socket: no Nagle, keepalive on
pub fn configure_tcp(stream: &TcpStream) -> io::Result<()> {
    use socket2::SockRef;

    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_keepalive(true)?;
    Ok(())
}

/// Open a connection to a storage within `timeout`
///
/// Unix sockets win over TCP when both are configured.
pub async fn dial(storage: &StorageConfig, timeout: Duration) -> Result<ConnectionStream, BackendError> {
    let target = storage.target();
    let connect = async {
        #[cfg(unix)]
        if let Some(path) = storage.socket_path() {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            return Ok(ConnectionStream::from(stream));
        }
        let host = storage.host.as_deref().unwrap_or("localhost");
        let stream = TcpStream::connect((host, storage.port)).await?;
        if let Err(e) = configure_tcp(&stream) {
            debug!("Failed to set socket options for {}: {}", target, e);
        }
        Ok::<_, io::Error>(ConnectionStream::from(stream))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(BackendError::Connect { target, source }),
        Err(_) => Err(BackendError::Connect {
            target,
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}
