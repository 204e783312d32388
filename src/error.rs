//! Error types for each subsystem
//!
//! Every layer reports a small closed set of failures. The session layer
//! turns them into ErrorResponse messages (see [`crate::session`]) and
//! decides what happens to the backend connection.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::constants::sqlstate;

/// Violations of the wire protocol framing or message layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("invalid length {len} for message '{tag}'")]
    BadLength { tag: char, len: i64 },

    #[error("invalid startup packet length {0}")]
    BadStartupLength(i64),

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("unexpected message '{tag}' during {phase}")]
    Unexpected { tag: char, phase: &'static str },

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("startup packet does not name a user")]
    MissingUser,
}

/// Failure to read one complete message from a stream
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Which limit rejected a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Route,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::Route => "route",
        })
    }
}

/// Routing failures, reported straight to the connecting client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route for '{database}.{user}' is not matched")]
    NotFound { database: String, user: String },

    #[error("too many client connections ({scope} client_max {limit} reached)")]
    ClientLimit { scope: LimitScope, limit: usize },

    #[error("router is not running")]
    RouterGone,
}

impl RouteError {
    /// SQLSTATE reported to the client
    #[must_use]
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => sqlstate::UNDEFINED_DATABASE,
            Self::ClientLimit { .. } => sqlstate::TOO_MANY_CONNECTIONS,
            Self::RouterGone => sqlstate::SYSTEM_ERROR,
        }
    }
}

/// Failures of the attach protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("server pool wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("client is not routed")]
    NotRouted,

    #[error("router is not running")]
    RouterGone,

    #[error("client was killed while waiting for a server")]
    Killed,
}

/// Failures while establishing or using a backend connection outside the relay
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("backend did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("backend requested unsupported authentication method {0}")]
    UnsupportedAuth(i32),

    #[error("backend requested a password but none is configured")]
    PasswordRequired,

    #[error("backend error {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("backend closed the connection")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("backend i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for BackendError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => Self::Closed,
            FrameError::Protocol(e) => Self::Protocol(e),
            FrameError::Io(e) => Self::Io(e),
        }
    }
}

/// Failures while synchronizing session parameters on a reused backend
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deploy failed: {0}")]
    Backend(#[from] BackendError),

    #[error("backend rejected deploy ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl From<FrameError> for DeployError {
    fn from(err: FrameError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<ProtocolError> for DeployError {
    fn from(err: ProtocolError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<io::Error> for DeployError {
    fn from(err: io::Error) -> Self {
        Self::Backend(err.into())
    }
}

/// Relay failures, classified by the side that failed
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client read failed: {0}")]
    ClientRead(#[source] io::Error),

    #[error("client write failed: {0}")]
    ClientWrite(#[source] io::Error),

    #[error("server read failed: {0}")]
    ServerRead(#[source] io::Error),

    #[error("server write failed: {0}")]
    ServerWrite(#[source] io::Error),

    #[error("client protocol violation: {0}")]
    ClientProtocol(#[source] ProtocolError),

    #[error("server protocol violation: {0}")]
    ServerProtocol(#[source] ProtocolError),
}

impl RelayError {
    /// The backend side is still usable; only the client failed
    #[must_use]
    pub const fn server_healthy(&self) -> bool {
        matches!(
            self,
            Self::ClientRead(_) | Self::ClientWrite(_) | Self::ClientProtocol(_)
        )
    }

    /// Client went away without saying goodbye
    #[must_use]
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            Self::ClientRead(e) | Self::ClientWrite(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Get the appropriate log level for this error
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self {
            _ if self.is_client_disconnect() => tracing::Level::DEBUG,
            Self::ClientRead(_) | Self::ClientWrite(_) | Self::ClientProtocol(_) => {
                tracing::Level::WARN
            }
            Self::ServerRead(_) | Self::ServerWrite(_) | Self::ServerProtocol(_) => {
                tracing::Level::ERROR
            }
        }
    }

    pub(crate) fn client_read(err: FrameError) -> Self {
        match err {
            FrameError::Closed => Self::ClientRead(io::ErrorKind::UnexpectedEof.into()),
            FrameError::Protocol(e) => Self::ClientProtocol(e),
            FrameError::Io(e) => Self::ClientRead(e),
        }
    }

    pub(crate) fn server_read(err: FrameError) -> Self {
        match err {
            FrameError::Closed => Self::ServerRead(io::ErrorKind::UnexpectedEof.into()),
            FrameError::Protocol(e) => Self::ServerProtocol(e),
            FrameError::Io(e) => Self::ServerRead(e),
        }
    }
}

/// Everything that can end a client session
///
/// Each variant knows the SQLSTATE the client is told about, if it is still
/// there to be told.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("password authentication failed for user \"{0}\"")]
    AuthFailed(String),

    #[error("terminating connection due to administrator command")]
    Killed,

    #[error("client connection closed")]
    Closed,

    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Read failure on the client socket before the relay takes over
    pub(crate) fn client_frame(err: FrameError) -> Self {
        match err {
            FrameError::Closed => Self::Closed,
            FrameError::Protocol(e) => Self::Protocol(e),
            FrameError::Io(e) => Self::Io(e),
        }
    }

    #[must_use]
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            Self::Route(e) => e.sqlstate(),
            Self::Protocol(_) => sqlstate::PROTOCOL_VIOLATION,
            Self::Relay(RelayError::ClientProtocol(_)) => sqlstate::PROTOCOL_VIOLATION,
            Self::AuthFailed(_) => sqlstate::INVALID_PASSWORD,
            Self::Killed => sqlstate::ADMIN_SHUTDOWN,
            Self::Attach(_)
            | Self::Backend(_)
            | Self::Deploy(_)
            | Self::Relay(_)
            | Self::Closed
            | Self::Io(_) => sqlstate::CONNECTION_FAILURE,
        }
    }

    /// Whether an ErrorResponse is worth attempting
    #[must_use]
    pub fn client_reachable(&self) -> bool {
        match self {
            Self::Closed | Self::Io(_) => false,
            Self::Relay(e) => !e.is_client_disconnect() && !matches!(e, RelayError::ClientWrite(_)),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_messages() {
        let err = RouteError::NotFound {
            database: "app".into(),
            user: "bob".into(),
        };
        assert_eq!(err.to_string(), "route for 'app.bob' is not matched");
        assert_eq!(err.sqlstate(), "3D000");

        let err = RouteError::ClientLimit {
            scope: LimitScope::Route,
            limit: 10,
        };
        assert!(err.to_string().contains("route client_max 10"));
        assert_eq!(err.sqlstate(), "53300");
    }

    #[test]
    fn test_attach_timeout_message() {
        let err = AttachError::Timeout(Duration::from_millis(500));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_backend_error_from_frame() {
        assert!(matches!(
            BackendError::from(FrameError::Closed),
            BackendError::Closed
        ));
        let err = BackendError::from(FrameError::Protocol(ProtocolError::Malformed("x")));
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn test_connect_error_source() {
        use std::error::Error;
        let err = BackendError::Connect {
            target: "127.0.0.1:5432".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("127.0.0.1:5432"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_relay_error_classification() {
        let client = RelayError::ClientRead(io::ErrorKind::ConnectionReset.into());
        assert!(client.server_healthy());
        assert!(client.is_client_disconnect());
        assert_eq!(client.log_level(), tracing::Level::DEBUG);

        let server = RelayError::ServerWrite(io::ErrorKind::BrokenPipe.into());
        assert!(!server.server_healthy());
        assert!(!server.is_client_disconnect());
        assert_eq!(server.log_level(), tracing::Level::ERROR);

        let proto = RelayError::ClientProtocol(ProtocolError::Malformed("Query"));
        assert!(proto.server_healthy());
        assert_eq!(proto.log_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_relay_error_from_closed_frame() {
        let err = RelayError::server_read(FrameError::Closed);
        assert!(matches!(err, RelayError::ServerRead(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        let err = RelayError::client_read(FrameError::Closed);
        assert!(err.is_client_disconnect());
    }

    #[test]
    fn test_session_error_sqlstate() {
        let err = SessionError::from(RouteError::NotFound {
            database: "app".into(),
            user: "bob".into(),
        });
        assert_eq!(err.sqlstate(), "3D000");
        assert_eq!(SessionError::AuthFailed("bob".into()).sqlstate(), "28P01");
        assert_eq!(SessionError::Killed.sqlstate(), "57P01");
        assert_eq!(
            SessionError::from(AttachError::Timeout(Duration::from_secs(1))).sqlstate(),
            "08006"
        );
        let relay = RelayError::ClientProtocol(ProtocolError::Malformed("Query"));
        assert_eq!(SessionError::from(relay).sqlstate(), "08P01");
    }

    #[test]
    fn test_session_error_reachability() {
        assert!(!SessionError::Closed.client_reachable());
        let gone = RelayError::ClientRead(io::ErrorKind::UnexpectedEof.into());
        assert!(!SessionError::from(gone).client_reachable());
        let server = RelayError::ServerRead(io::ErrorKind::UnexpectedEof.into());
        assert!(SessionError::from(server).client_reachable());
        assert!(
            SessionError::AuthFailed("x".into())
                .to_string()
                .contains("\"x\"")
        );
    }
}
