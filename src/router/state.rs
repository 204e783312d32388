//! Pool state owned by the router task
//!
//! Every transition of the client and server state machines happens here,
//! synchronously, one request at a time. Nothing in this module suspends,
//! which is what keeps the pool lists consistent while they are scanned.
//!
//! Operations return [`Effects`]: servers handed to clients that were
//! waiting, and connections that must be closed. Delivering those is the
//! job of the router task, so this type stays free of channels and sockets
//! and can be driven directly in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::snapshot::{ClientSnapshot, PoolSnapshot, RouteSnapshot, ServerSnapshot};
use crate::config::{Config, RouteConfig, StorageConfig};
use crate::error::{AttachError, LimitScope, RouteError};
use crate::formatting::format_bytes;
use crate::protocol::ParamSet;
use crate::route::{ClientState, Route, RouteId, RouteStats, RouteTable, ServerState};
use crate::types::{CancelKey, ClientId, ServerId};

/// A client asking to be routed
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub client: ClientId,
    pub key: CancelKey,
    pub database: String,
    pub user: String,
}

/// Result of a successful route
#[derive(Debug, Clone)]
pub struct Routed {
    pub route: RouteId,
    pub config: Arc<RouteConfig>,
    pub storage: Arc<StorageConfig>,
    /// Parameters a backend of this route last reported
    pub params: ParamSet,
}

/// A server bound to a client
///
/// `conn` is `None` when the slot is new and the client must dial the
/// backend itself.
#[derive(Debug)]
pub struct Lease<C> {
    pub route: RouteId,
    pub server: ServerId,
    pub conn: Option<C>,
    pub config: Arc<RouteConfig>,
    pub storage: Arc<StorageConfig>,
}

impl<C> Lease<C> {
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.conn.is_none()
    }
}

#[derive(Debug)]
pub enum AttachStep<C> {
    Ready(Lease<C>),
    /// Pool is saturated; the client waits in line
    Queued,
}

/// A server granted to a client that was queued
#[derive(Debug)]
pub struct Handoff<C> {
    pub client: ClientId,
    pub lease: Lease<C>,
}

/// Side effects the router task must carry out
#[derive(Debug)]
pub struct Effects<C> {
    pub handoffs: Vec<Handoff<C>>,
    pub close: Vec<C>,
}

impl<C> Default for Effects<C> {
    fn default() -> Self {
        Self {
            handoffs: Vec::new(),
            close: Vec::new(),
        }
    }
}

impl<C> Effects<C> {
    fn handoff(handoff: Option<Handoff<C>>) -> Self {
        Self {
            handoffs: handoff.into_iter().collect(),
            close: Vec::new(),
        }
    }

    pub fn extend(&mut self, other: Effects<C>) {
        self.handoffs.extend(other.handoffs);
        self.close.extend(other.close);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handoffs.is_empty() && self.close.is_empty()
    }
}

/// Where to send a cancel request for a client key
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub server: ServerId,
    pub key: CancelKey,
    pub storage: Arc<StorageConfig>,
}

#[derive(Debug)]
pub struct RouterState<C> {
    table: RouteTable<C>,
    clients: HashMap<ClientId, RouteId>,
    client_max: usize,
    tick_interval: Duration,
    log_stats: u64,
    ticks: u64,
}

impl<C> RouterState<C> {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            table: RouteTable::new(config),
            clients: HashMap::new(),
            client_max: config.listen.client_max,
            tick_interval: config.general.tick_interval,
            log_stats: config.general.log_stats,
            ticks: 0,
        }
    }

    pub fn table(&self) -> &RouteTable<C> {
        &self.table
    }

    /// Number of routed clients across all routes
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn route_of(&self, client: ClientId) -> Option<&Route<C>> {
        let id = self.clients.get(&client)?;
        self.table.get(*id)
    }

    pub fn client_state(&self, client: ClientId) -> ClientState {
        self.route_of(client)
            .and_then(|r| r.clients.get(client))
            .map_or(ClientState::Undef, |c| c.state)
    }

    /// Server currently attached to `client`
    pub fn server_of(&self, client: ClientId) -> Option<ServerId> {
        self.route_of(client)
            .and_then(|r| r.clients.get(client))
            .and_then(|c| c.server)
    }

    pub fn server_state(&self, server: ServerId) -> ServerState {
        self.table
            .iter()
            .find_map(|r| r.servers.get(server))
            .map_or(ServerState::Undef, |s| s.state)
    }

    // -------------------------------------------------------------------------
    // route / unroute
    // -------------------------------------------------------------------------

    /// Assign a client to a route and enqueue it Pending
    pub fn route(&mut self, req: RouteRequest) -> Result<Routed, RouteError> {
        if self.client_max > 0 && self.clients.len() >= self.client_max {
            return Err(RouteError::ClientLimit {
                scope: LimitScope::Global,
                limit: self.client_max,
            });
        }
        let id = self
            .table
            .get_or_create(&req.database, &req.user)
            .ok_or_else(|| RouteError::NotFound {
                database: req.database.clone(),
                user: req.user.clone(),
            })?;
        let route = self.table.get_mut(id).ok_or(RouteError::RouterGone)?;
        let limit = route.config.client_max;
        if limit > 0 && route.clients.total() >= limit {
            return Err(RouteError::ClientLimit {
                scope: LimitScope::Route,
                limit,
            });
        }
        route.clients.add(req.client, req.key);
        route.stats.clients_routed += 1;
        self.clients.insert(req.client, id);
        debug!("Routed client {} to {} ({})", req.client.short(), id, route.name());
        Ok(Routed {
            route: id,
            config: route.config.clone(),
            storage: route.storage.clone(),
            params: route.params.clone(),
        })
    }

    /// Remove a client from its route entirely
    ///
    /// A client still holding a server leaves an orphaned slot behind; it is
    /// dropped so the capacity goes to the next client in line.
    pub fn unroute(&mut self, client: ClientId) -> Effects<C> {
        let Some(route_id) = self.clients.remove(&client) else {
            return Effects::default();
        };
        let Some(route) = self.table.get_mut(route_id) else {
            return Effects::default();
        };
        let Some(pooled) = route.clients.remove(client) else {
            return Effects::default();
        };
        debug!("Unrouted client {} from {}", client.short(), route.name());
        if let Some(server) = pooled.server {
            if let Some(orphan) = route.servers.remove(server) {
                debug!("Dropped server {} orphaned by {}", server.short(), client.short());
                let mut effects = Effects::handoff(Self::wake_next(route));
                effects.close.extend(orphan.conn);
                return effects;
            }
        }
        Effects::default()
    }

    // -------------------------------------------------------------------------
    // attach / detach
    // -------------------------------------------------------------------------

    /// Bind a Pending client to an idle or new server, or queue it
    pub fn attach(&mut self, client: ClientId) -> Result<AttachStep<C>, AttachError> {
        let route_id = *self.clients.get(&client).ok_or(AttachError::NotRouted)?;
        let route = self.table.get_mut(route_id).ok_or(AttachError::NotRouted)?;
        match route.clients.get(client).map(|c| c.state) {
            Some(ClientState::Pending) => {}
            _ => return Err(AttachError::NotRouted),
        }
        // waiters go first
        if route.clients.count(ClientState::Queued) == 0
            && let Some(lease) = Self::bind(route, client)
        {
            return Ok(AttachStep::Ready(lease));
        }
        route.clients.set_state(client, ClientState::Queued);
        debug!(
            "Client {} queued on {} ({} waiting)",
            client.short(),
            route.name(),
            route.clients.count(ClientState::Queued)
        );
        Ok(AttachStep::Queued)
    }

    fn bind(route: &mut Route<C>, client: ClientId) -> Option<Lease<C>> {
        let key = route.clients.get(client)?.key;
        let (server, conn) = if let Some(server) = route.servers.next_idle() {
            let conn = route.servers.attach(server, client, key);
            (server, conn)
        } else if route.has_capacity() {
            let server = ServerId::new();
            route.servers.add_active(server, client, key);
            route.stats.servers_created += 1;
            (server, None)
        } else {
            return None;
        };
        route.clients.set_state(client, ClientState::Active);
        route.clients.set_server(client, Some(server));
        debug!(
            "Attached client {} to {} server {}",
            client.short(),
            if conn.is_some() { "idle" } else { "new" },
            server.short()
        );
        Some(Lease {
            route: route.id,
            server,
            conn,
            config: route.config.clone(),
            storage: route.storage.clone(),
        })
    }

    /// Signal exactly one queued client, first in line, if a server is free
    fn wake_next(route: &mut Route<C>) -> Option<Handoff<C>> {
        if route.servers.next_idle().is_none() && !route.has_capacity() {
            return None;
        }
        let next = route.clients.pop_queued()?;
        let lease = Self::bind(route, next)?;
        Some(Handoff { client: next, lease })
    }

    /// Client gave up waiting; Queued -> Pending
    pub fn queue_timeout(&mut self, client: ClientId) -> bool {
        let Some(route) = self
            .clients
            .get(&client)
            .and_then(|id| self.table.get_mut(*id))
        else {
            return false;
        };
        if route.clients.get(client).map(|c| c.state) != Some(ClientState::Queued) {
            return false;
        }
        route.clients.set_state(client, ClientState::Pending);
        debug!("Client {} timed out waiting on {}", client.short(), route.name());
        true
    }

    /// Return a client's server to Idle and wake the next waiter
    ///
    /// A connection whose client is no longer known comes back in
    /// `close`.
    pub fn detach(&mut self, client: ClientId, conn: C, stats: &RouteStats) -> Effects<C> {
        let Some(route) = self
            .clients
            .get(&client)
            .and_then(|id| self.table.get_mut(*id))
        else {
            return Effects {
                handoffs: Vec::new(),
                close: vec![conn],
            };
        };
        route.stats.add(stats);
        let server = route
            .clients
            .get(client)
            .filter(|c| c.state == ClientState::Active)
            .and_then(|c| c.server);
        let Some(server) = server else {
            return Effects {
                handoffs: Vec::new(),
                close: vec![conn],
            };
        };
        route.clients.set_state(client, ClientState::Pending);
        route.clients.set_server(client, None);
        if route.servers.get(server).map(|s| s.state) != Some(ServerState::Active) {
            return Effects {
                handoffs: Vec::new(),
                close: vec![conn],
            };
        }
        route.servers.release(server, conn);
        debug!("Detached client {} from server {}", client.short(), server.short());
        Effects::handoff(Self::wake_next(route))
    }

    /// Drop a server slot (connection failed or was closed)
    pub fn close(&mut self, client: ClientId, server: ServerId, stats: &RouteStats) -> Effects<C> {
        let route_id = self.clients.get(&client).copied().or_else(|| {
            self.table
                .iter()
                .find(|r| r.servers.get(server).is_some())
                .map(|r| r.id)
        });
        let Some(route) = route_id.and_then(|id| self.table.get_mut(id)) else {
            return Effects::default();
        };
        route.stats.add(stats);
        let mut effects = Effects::default();
        if let Some(slot) = route.servers.remove(server) {
            effects.close.extend(slot.conn);
            debug!("Closed server {} of {}", server.short(), route.name());
        }
        if route.clients.get(client).and_then(|c| c.server) == Some(server) {
            route.clients.set_state(client, ClientState::Pending);
            route.clients.set_server(client, None);
        }
        effects.handoffs.extend(Self::wake_next(route));
        effects
    }

    /// Undo a handoff whose client stopped waiting before it arrived
    pub fn revoke(&mut self, handoff: Handoff<C>) -> Effects<C> {
        let Handoff { client, lease } = handoff;
        match lease.conn {
            Some(conn) => self.detach(client, conn, &RouteStats::default()),
            None => self.close(client, lease.server, &RouteStats::default()),
        }
    }

    // -------------------------------------------------------------------------
    // backend keys and cancellation
    // -------------------------------------------------------------------------

    /// A new backend finished its handshake
    pub fn backend_ready(&mut self, server: ServerId, key: CancelKey, params: &ParamSet) -> bool {
        for route in self.table.iter_mut() {
            if route.servers.set_key(server, key) {
                route.params.merge(params);
                return true;
            }
        }
        false
    }

    /// Find the Active server serving the client that owns `key`
    pub fn find_cancel_target(&self, key: CancelKey) -> Option<CancelTarget> {
        self.table.iter().find_map(|route| {
            route
                .servers
                .iter()
                .find(|s| s.state == ServerState::Active && s.key_client == Some(key))
                .and_then(|s| {
                    Some(CancelTarget {
                        server: s.id,
                        key: s.key?,
                        storage: route.storage.clone(),
                    })
                })
        })
    }

    // -------------------------------------------------------------------------
    // maintenance
    // -------------------------------------------------------------------------

    fn ttl_ticks(&self, ttl: Duration) -> u64 {
        if ttl.is_zero() {
            return 0;
        }
        let tick = self.tick_interval.as_millis().max(1);
        ttl.as_millis().div_ceil(tick).max(1) as u64
    }

    /// One maintenance tick: mark, sweep, collect
    pub fn tick(&mut self) -> Effects<C> {
        self.ticks += 1;

        let ttls: Vec<(RouteId, u64, bool)> = self
            .table
            .iter()
            .map(|r| (r.id, self.ttl_ticks(r.config.pool_ttl), r.obsolete))
            .collect();
        for (id, ttl_ticks, obsolete) in ttls {
            if let Some(route) = self.table.get_mut(id) {
                let marked = route.servers.mark_expired(ttl_ticks, obsolete);
                if marked > 0 {
                    debug!("Expiring {} idle server(s) of {}", marked, route.name());
                }
            }
        }

        let mut effects = Effects::default();
        for route in self.table.iter_mut() {
            effects.close.extend(route.servers.sweep());
        }

        self.table.gc();

        if self.log_stats > 0 && self.ticks.is_multiple_of(self.log_stats) {
            self.log_statistics();
        }
        effects
    }

    fn log_statistics(&self) {
        for route in self.table.iter() {
            info!(
                "[{}] clients {} active / {} pending / {} queued, servers {} active / {} idle, \
                 {} queries, {} transactions, in {}, out {}",
                route.name(),
                route.clients.count(ClientState::Active),
                route.clients.count(ClientState::Pending),
                route.clients.count(ClientState::Queued),
                route.servers.count(ServerState::Active),
                route.servers.count(ServerState::Idle),
                route.stats.queries,
                route.stats.transactions,
                format_bytes(route.stats.bytes_in),
                format_bytes(route.stats.bytes_out),
            );
        }
    }

    /// Install a reloaded configuration
    pub fn reload(&mut self, config: &Config) {
        let obsoleted = self.table.reload(config);
        self.client_max = config.listen.client_max;
        self.tick_interval = config.general.tick_interval;
        self.log_stats = config.general.log_stats;
        info!(
            "Configuration reloaded: {} route(s) live, {} obsolete",
            self.table.len(),
            obsoleted
        );
    }

    /// Close every idle server
    pub fn shutdown(&mut self) -> Effects<C> {
        let mut effects = Effects::default();
        for route in self.table.iter_mut() {
            effects.close.extend(route.servers.drain_idle());
        }
        effects
    }

    // -------------------------------------------------------------------------
    // inspection
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = PoolSnapshot::default();
        for route in self.table.iter() {
            snapshot.routes.push(RouteSnapshot {
                id: route.id,
                database: route.database.clone(),
                user: route.user.clone(),
                pool: route.config.pool,
                pool_size: route.config.pool_size,
                dynamic: route.dynamic,
                obsolete: route.obsolete,
                clients_pending: route.clients.count(ClientState::Pending),
                clients_active: route.clients.count(ClientState::Active),
                clients_queued: route.clients.count(ClientState::Queued),
                servers_idle: route.servers.count(ServerState::Idle),
                servers_active: route.servers.count(ServerState::Active),
                stats: route.stats,
            });
            for client in route.clients.iter() {
                snapshot.clients.push(ClientSnapshot {
                    id: client.id,
                    route: route.id,
                    database: route.database.clone(),
                    user: route.user.clone(),
                    state: client.state,
                    server: client.server,
                });
            }
            for server in route.servers.iter() {
                snapshot.servers.push(ServerSnapshot {
                    id: server.id,
                    route: route.id,
                    database: route.database.clone(),
                    user: route.user.clone(),
                    state: server.state,
                    client: server.client,
                    idle_time: server.idle_time,
                });
            }
        }
        snapshot.routes.sort_by_key(|r| r.id);
        snapshot
    }

    /// Check the pool invariants, describing the first violation
    ///
    /// - an Active server has exactly one client, which is Active on it
    /// - an Active client has exactly one server, which is Active for it
    /// - `pool_size` bounds Idle + Active servers
    /// - nobody waits while a server sits idle
    pub fn verify(&self) -> Result<(), String> {
        for route in self.table.iter() {
            for server in route.servers.iter() {
                match (server.state, server.client) {
                    (ServerState::Active, Some(c)) => {
                        let client = route
                            .clients
                            .get(c)
                            .ok_or_else(|| format!("server {} points at unknown client", server.id))?;
                        if client.state != ClientState::Active || client.server != Some(server.id) {
                            return Err(format!("server {} and client {} disagree", server.id, c));
                        }
                    }
                    (ServerState::Active, None) => {
                        return Err(format!("active server {} has no client", server.id));
                    }
                    (_, Some(c)) => {
                        return Err(format!("{} server {} holds client {}", server.state, server.id, c));
                    }
                    (_, None) => {}
                }
            }
            for client in route.clients.iter() {
                match (client.state, client.server) {
                    (ClientState::Active, Some(s)) => {
                        let server = route
                            .servers
                            .get(s)
                            .ok_or_else(|| format!("client {} points at unknown server", client.id))?;
                        if server.state != ServerState::Active || server.client != Some(client.id) {
                            return Err(format!("client {} and server {} disagree", client.id, s));
                        }
                    }
                    (ClientState::Active, None) => {
                        return Err(format!("active client {} has no server", client.id));
                    }
                    (_, Some(s)) => {
                        return Err(format!("{} client {} holds server {}", client.state, client.id, s));
                    }
                    (_, None) => {}
                }
            }
            let size = route.config.pool_size;
            if size > 0 && route.servers.alive() > size {
                return Err(format!(
                    "{} has {} servers, pool_size {}",
                    route.name(),
                    route.servers.alive(),
                    size
                ));
            }
            if route.clients.count(ClientState::Queued) > 0 && route.servers.count(ServerState::Idle) > 0 {
                return Err(format!("{} has waiters and idle servers", route.name()));
            }
        }
        Ok(())
    }
}
