//! Read-only copies of pool state for the console and statistics

use crate::config::PoolMode;
use crate::route::{ClientState, RouteId, RouteStats, ServerState};
use crate::types::{ClientId, ServerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub id: RouteId,
    pub database: String,
    pub user: String,
    pub pool: PoolMode,
    pub pool_size: usize,
    pub dynamic: bool,
    pub obsolete: bool,
    pub clients_pending: usize,
    pub clients_active: usize,
    pub clients_queued: usize,
    pub servers_idle: usize,
    pub servers_active: usize,
    pub stats: RouteStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub route: RouteId,
    pub database: String,
    pub user: String,
    pub state: ClientState,
    pub server: Option<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub id: ServerId,
    pub route: RouteId,
    pub database: String,
    pub user: String,
    pub state: ServerState,
    pub client: Option<ClientId>,
    pub idle_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub routes: Vec<RouteSnapshot>,
    pub clients: Vec<ClientSnapshot>,
    pub servers: Vec<ServerSnapshot>,
}

impl PoolSnapshot {
    pub fn route(&self, database: &str, user: &str) -> Option<&RouteSnapshot> {
        self.routes
            .iter()
            .find(|r| r.database == database && r.user == user && !r.obsolete)
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientSnapshot> {
        self.clients.iter().find(|c| c.id == id)
    }
}
