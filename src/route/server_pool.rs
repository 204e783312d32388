//! Per-route backend connection bookkeeping
//!
//! An Idle server parks its connection here. An Active server's connection
//! is on loan to the client task serving it and comes back on release.

use std::collections::{HashMap, VecDeque};

use crate::types::{CancelKey, ClientId, ServerId};

/// Lifecycle state of a backend connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Undef,
    Idle,
    Active,
    /// Marked for closing by the maintenance tick
    Expiring,
}

impl ServerState {
    const fn index(self) -> usize {
        match self {
            Self::Undef => 0,
            Self::Idle => 1,
            Self::Active => 2,
            Self::Expiring => 3,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Expiring => "expiring",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PooledServer<C> {
    pub id: ServerId,
    pub state: ServerState,
    pub client: Option<ClientId>,
    /// Present while Idle or Expiring
    pub conn: Option<C>,
    /// Key the backend handed out
    pub key: Option<CancelKey>,
    /// Key of the client currently attached
    pub key_client: Option<CancelKey>,
    /// Ticks spent Idle since the last release
    pub idle_time: u64,
}

#[derive(Debug)]
pub struct ServerPool<C> {
    servers: HashMap<ServerId, PooledServer<C>>,
    /// Idle servers, most recently released at the back
    idle: VecDeque<ServerId>,
    counts: [usize; 4],
}

impl<C> Default for ServerPool<C> {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            idle: VecDeque::new(),
            counts: [0; 4],
        }
    }
}

impl<C> ServerPool<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server slot created for `client`; it skips Idle
    pub fn add_active(&mut self, id: ServerId, client: ClientId, key_client: CancelKey) {
        self.servers.insert(
            id,
            PooledServer {
                id,
                state: ServerState::Active,
                client: Some(client),
                conn: None,
                key: None,
                key_client: Some(key_client),
                idle_time: 0,
            },
        );
        self.counts[ServerState::Active.index()] += 1;
    }

    /// Most recently released idle server
    ///
    /// Reusing the warmest connection lets the others age out under TTL.
    #[must_use]
    pub fn next_idle(&self) -> Option<ServerId> {
        self.idle.back().copied()
    }

    /// Idle -> Active for `client`; hands out the parked connection
    pub fn attach(&mut self, id: ServerId, client: ClientId, key_client: CancelKey) -> Option<C> {
        let server = self.servers.get_mut(&id)?;
        if server.state != ServerState::Idle {
            return None;
        }
        server.state = ServerState::Active;
        server.client = Some(client);
        server.key_client = Some(key_client);
        server.idle_time = 0;
        let conn = server.conn.take();
        self.counts[ServerState::Idle.index()] -= 1;
        self.counts[ServerState::Active.index()] += 1;
        self.idle.retain(|s| *s != id);
        conn
    }

    /// Active -> Idle, parking the returned connection
    pub fn release(&mut self, id: ServerId, conn: C) -> bool {
        let Some(server) = self.servers.get_mut(&id) else {
            return false;
        };
        if server.state != ServerState::Active {
            return false;
        }
        server.state = ServerState::Idle;
        server.client = None;
        server.key_client = None;
        server.idle_time = 0;
        server.conn = Some(conn);
        self.counts[ServerState::Active.index()] -= 1;
        self.counts[ServerState::Idle.index()] += 1;
        self.idle.push_back(id);
        true
    }

    pub fn remove(&mut self, id: ServerId) -> Option<PooledServer<C>> {
        let server = self.servers.remove(&id)?;
        self.counts[server.state.index()] -= 1;
        if server.state == ServerState::Idle {
            self.idle.retain(|s| *s != id);
        }
        Some(server)
    }

    pub fn get(&self, id: ServerId) -> Option<&PooledServer<C>> {
        self.servers.get(&id)
    }

    /// Record the backend's own cancellation key
    pub fn set_key(&mut self, id: ServerId, key: CancelKey) -> bool {
        match self.servers.get_mut(&id) {
            Some(server) => {
                server.key = Some(key);
                true
            }
            None => false,
        }
    }

    /// Mark phase of TTL expiry; never suspends
    ///
    /// Idle servers past `ttl_ticks` (or all of them when `expire_all`) move
    /// to Expiring, the rest age by one tick. `ttl_ticks == 0` disables TTL.
    pub fn mark_expired(&mut self, ttl_ticks: u64, expire_all: bool) -> usize {
        let mut marked = 0;
        let idle: Vec<ServerId> = self.idle.iter().copied().collect();
        for id in idle {
            let Some(server) = self.servers.get_mut(&id) else {
                continue;
            };
            if expire_all || (ttl_ticks > 0 && server.idle_time >= ttl_ticks) {
                server.state = ServerState::Expiring;
                self.counts[ServerState::Idle.index()] -= 1;
                self.counts[ServerState::Expiring.index()] += 1;
                self.idle.retain(|s| *s != id);
                marked += 1;
            } else {
                server.idle_time += 1;
            }
        }
        marked
    }

    /// Sweep phase: drop Expiring slots and return their connections
    pub fn sweep(&mut self) -> Vec<C> {
        let expiring: Vec<ServerId> = self
            .servers
            .values()
            .filter(|s| s.state == ServerState::Expiring)
            .map(|s| s.id)
            .collect();
        expiring
            .into_iter()
            .filter_map(|id| self.remove(id).and_then(|s| s.conn))
            .collect()
    }

    /// Remove every Idle server and return the connections
    pub fn drain_idle(&mut self) -> Vec<C> {
        let idle: Vec<ServerId> = self.idle.iter().copied().collect();
        idle.into_iter()
            .filter_map(|id| self.remove(id).and_then(|s| s.conn))
            .collect()
    }

    #[must_use]
    pub fn count(&self, state: ServerState) -> usize {
        self.counts[state.index()]
    }

    /// Servers counted against `pool_size`
    #[must_use]
    pub fn alive(&self) -> usize {
        self.count(ServerState::Idle) + self.count(ServerState::Active)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PooledServer<C>> {
        self.servers.values()
    }
}
