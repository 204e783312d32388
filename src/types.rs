//! Core identifiers shared by the router, the pools and the sessions
//!
//! Clients and servers are referred to by opaque ids everywhere outside the
//! router; nothing but the router owns pool entries.

pub mod duration;

pub use duration::{duration_millis, duration_secs};

use uuid::Uuid;

/// Unique identifier for a frontend (client) connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a client id as printed by the console
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = match s.strip_prefix('c') {
            Some(rest) if rest.len() == 32 => rest,
            _ => s,
        };
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Short form used in log lines
    #[must_use]
    pub fn short(&self) -> String {
        format!("c{}", crate::formatting::short_id(&self.0))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0.simple())
    }
}

/// Unique identifier for a backend (server) connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(Uuid);

impl ServerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn short(&self) -> String {
        format!("s{}", crate::formatting::short_id(&self.0))
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0.simple())
    }
}

/// Cancellation key as carried by BackendKeyData and CancelRequest
///
/// For backends this is the key the server handed out. For clients it is
/// generated locally and only ever compared, never sent to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelKey {
    pub pid: i32,
    pub secret: i32,
}

impl CancelKey {
    #[must_use]
    pub const fn new(pid: i32, secret: i32) -> Self {
        Self { pid, secret }
    }

    /// Generate the key a client sees in its BackendKeyData
    #[must_use]
    pub fn for_client(id: &ClientId) -> Self {
        let bytes = id.as_uuid().as_bytes();
        let pid = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & i32::MAX;
        Self {
            pid,
            secret: 1 + (rand::random::<u32>() >> 1) as i32,
        }
    }
}

impl std::fmt::Display for CancelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pid, self.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_client_id_unique() {
        let ids: HashSet<_> = (0..100).map(|_| ClientId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_client_id_display_and_parse() {
        let id = ClientId::new();
        let shown = id.to_string();
        assert!(shown.starts_with('c'));
        assert_eq!(shown.len(), 33);
        assert_eq!(ClientId::parse(&shown), Some(id));
        assert_eq!(ClientId::parse(&id.as_uuid().to_string()), Some(id));
        assert_eq!(ClientId::parse("nonsense"), None);
    }

    #[test]
    fn test_short_ids() {
        let id = ClientId::new();
        assert_eq!(id.short().len(), 9);
        assert!(ServerId::new().short().starts_with('s'));
    }

    #[test]
    fn test_client_cancel_key() {
        let id = ClientId::new();
        let a = CancelKey::for_client(&id);
        let b = CancelKey::for_client(&id);
        assert_eq!(a.pid, b.pid);
        assert!(a.pid >= 0);
        assert!(a.secret >= 1);
    }

    #[test]
    fn test_cancel_key_display() {
        assert_eq!(CancelKey::new(42, 7).to_string(), "42:7");
    }
}
