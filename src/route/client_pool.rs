//! Per-route client bookkeeping
//!
//! Pure list membership and counters; only the router mutates it.

use std::collections::{HashMap, VecDeque};

use crate::types::{CancelKey, ClientId, ServerId};

/// Lifecycle state of a routed client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Undef,
    /// Routed, not attached to a server
    Pending,
    /// Attached to exactly one server
    Active,
    /// Waiting for a server under the pool-size limit
    Queued,
}

impl ClientState {
    const fn index(self) -> usize {
        match self {
            Self::Undef => 0,
            Self::Pending => 1,
            Self::Active => 2,
            Self::Queued => 3,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Queued => "queued",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledClient {
    pub id: ClientId,
    pub state: ClientState,
    pub server: Option<ServerId>,
    pub key: CancelKey,
}

#[derive(Debug, Default)]
pub struct ClientPool {
    clients: HashMap<ClientId, PooledClient>,
    /// Queued clients in arrival order
    queue: VecDeque<ClientId>,
    counts: [usize; 4],
}

impl ClientPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly routed client in the Pending state
    pub fn add(&mut self, id: ClientId, key: CancelKey) {
        let client = PooledClient {
            id,
            state: ClientState::Pending,
            server: None,
            key,
        };
        if let Some(old) = self.clients.insert(id, client) {
            self.counts[old.state.index()] -= 1;
            self.queue.retain(|c| *c != id);
        }
        self.counts[ClientState::Pending.index()] += 1;
    }

    pub fn remove(&mut self, id: ClientId) -> Option<PooledClient> {
        let client = self.clients.remove(&id)?;
        self.counts[client.state.index()] -= 1;
        if client.state == ClientState::Queued {
            self.queue.retain(|c| *c != id);
        }
        Some(client)
    }

    pub fn get(&self, id: ClientId) -> Option<&PooledClient> {
        self.clients.get(&id)
    }

    /// Move a client to `state`, keeping the queue in arrival order
    pub fn set_state(&mut self, id: ClientId, state: ClientState) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        let old = client.state;
        if old == state {
            return true;
        }
        client.state = state;
        self.counts[old.index()] -= 1;
        self.counts[state.index()] += 1;
        if old == ClientState::Queued {
            self.queue.retain(|c| *c != id);
        }
        if state == ClientState::Queued {
            self.queue.push_back(id);
        }
        true
    }

    pub fn set_server(&mut self, id: ClientId, server: Option<ServerId>) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.server = server;
        }
    }

    /// Take the longest-waiting queued client and make it Pending
    pub fn pop_queued(&mut self) -> Option<ClientId> {
        let id = *self.queue.front()?;
        self.set_state(id, ClientState::Pending);
        Some(id)
    }

    /// Queued client ids, first in line first
    pub fn queued(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.queue.iter().copied()
    }

    #[must_use]
    pub fn count(&self, state: ClientState) -> usize {
        self.counts[state.index()]
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PooledClient> {
        self.clients.values()
    }
}
