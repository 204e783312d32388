//! Routes: the pooling unit keyed by (database, user)
//!
//! A route owns one [`ClientPool`] and one [`ServerPool`], shares an
//! immutable snapshot of its configuration and keeps running totals.
//! Clients and servers refer back to their route only by [`RouteId`].

pub mod client_pool;
pub mod server_pool;
pub mod table;

pub use client_pool::{ClientPool, ClientState, PooledClient};
pub use server_pool::{PooledServer, ServerPool, ServerState};
pub use table::RouteTable;

use std::sync::Arc;

use crate::config::{RouteConfig, StorageConfig};
use crate::protocol::ParamSet;

/// Opaque route handle, stable for the life of the route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

impl RouteId {
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Running totals for a route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub clients_routed: u64,
    pub servers_created: u64,
    pub queries: u64,
    pub transactions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl RouteStats {
    pub fn add(&mut self, other: &RouteStats) {
        self.queries += other.queries;
        self.transactions += other.transactions;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

#[derive(Debug)]
pub struct Route<C> {
    pub id: RouteId,
    pub database: String,
    pub user: String,
    /// The template matched on a wildcard database
    pub db_is_default: bool,
    /// The template matched on a wildcard user
    pub user_is_default: bool,
    pub config: Arc<RouteConfig>,
    pub storage: Arc<StorageConfig>,
    /// Created from a wildcard template; collected once empty
    pub dynamic: bool,
    /// Superseded by a reload; takes no new clients
    pub obsolete: bool,
    pub clients: ClientPool,
    pub servers: ServerPool<C>,
    pub stats: RouteStats,
    /// Parameters last reported by a backend of this route
    pub params: ParamSet,
}

impl<C> Route<C> {
    pub fn new(
        id: RouteId,
        database: impl Into<String>,
        user: impl Into<String>,
        config: Arc<RouteConfig>,
        storage: Arc<StorageConfig>,
    ) -> Self {
        let db_is_default = config.is_default_db();
        let user_is_default = config.is_default_user();
        Self {
            id,
            database: database.into(),
            user: user.into(),
            db_is_default,
            user_is_default,
            dynamic: db_is_default || user_is_default,
            obsolete: false,
            config,
            storage,
            clients: ClientPool::new(),
            servers: ServerPool::new(),
            stats: RouteStats::default(),
            params: ParamSet::new(),
        }
    }

    /// `database.user` for log lines
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.database, self.user)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.servers.is_empty()
    }

    /// Eligible for garbage collection
    #[must_use]
    pub fn is_collectable(&self) -> bool {
        (self.dynamic || self.obsolete) && self.is_empty()
    }

    /// A new server may be created without exceeding `pool_size`
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.config.pool_size == 0 || self.servers.alive() < self.config.pool_size
    }
}
