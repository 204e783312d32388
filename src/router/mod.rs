//! The router: single owner of every route, pool and connection slot
//!
//! All pool mutations are serialized through one task. Client sessions talk
//! to it over an unbounded channel using [`RouterHandle`]; each request
//! carries a oneshot for the reply. The task applies the request to
//! [`RouterState`] and then carries out the resulting effects: servers are
//! handed directly to the queued client they were granted to, and
//! connections dropped from the pools are terminated in the background.

pub mod attacher;
pub mod snapshot;
pub mod state;

pub use attacher::attach;
pub use snapshot::{ClientSnapshot, PoolSnapshot, RouteSnapshot, ServerSnapshot};
pub use state::{
    AttachStep, CancelTarget, Effects, Handoff, Lease, RouteRequest, Routed, RouterState,
};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendConnection;
use crate::config::Config;
use crate::error::{AttachError, RouteError};
use crate::protocol::ParamSet;
use crate::route::RouteStats;
use crate::types::{CancelKey, ClientId, ServerId};

/// Connection type the pools hold
pub type ServerConn = BackendConnection;

pub type ServerLease = Lease<ServerConn>;

/// Reply to an attach request
#[derive(Debug)]
pub enum Attached {
    Ready(ServerLease),
    /// Queued; the lease arrives on this receiver when a server frees up
    Queued(oneshot::Receiver<ServerLease>),
}

#[derive(Debug)]
enum Request {
    Route {
        req: RouteRequest,
        kill: Arc<Notify>,
        reply: oneshot::Sender<Result<Routed, RouteError>>,
    },
    Unroute {
        client: ClientId,
    },
    Attach {
        client: ClientId,
        reply: oneshot::Sender<Result<Attached, AttachError>>,
    },
    QueueTimeout {
        client: ClientId,
    },
    Detach {
        client: ClientId,
        conn: Box<ServerConn>,
        stats: RouteStats,
    },
    Close {
        client: ClientId,
        server: ServerId,
        stats: RouteStats,
    },
    BackendReady {
        server: ServerId,
        key: CancelKey,
        params: ParamSet,
    },
    Cancel {
        key: CancelKey,
        reply: oneshot::Sender<Option<CancelTarget>>,
    },
    Kill {
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
    Reload {
        config: Box<Config>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for talking to the router task
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl RouterHandle {
    fn send(&self, req: Request) -> bool {
        self.tx.send(req).is_ok()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if !self.send(make(reply)) {
            return None;
        }
        rx.await.ok()
    }

    /// Route a client; `kill` is notified if the console kills it
    pub async fn route(&self, req: RouteRequest, kill: Arc<Notify>) -> Result<Routed, RouteError> {
        self.call(|reply| Request::Route { req, kill, reply })
            .await
            .unwrap_or(Err(RouteError::RouterGone))
    }

    pub fn unroute(&self, client: ClientId) {
        self.send(Request::Unroute { client });
    }

    pub async fn attach(&self, client: ClientId) -> Result<Attached, AttachError> {
        self.call(|reply| Request::Attach { client, reply })
            .await
            .unwrap_or(Err(AttachError::RouterGone))
    }

    pub fn queue_timeout(&self, client: ClientId) {
        self.send(Request::QueueTimeout { client });
    }

    /// Hand a healthy server back to the pool
    pub fn detach(&self, client: ClientId, conn: ServerConn, stats: RouteStats) {
        let req = Request::Detach {
            client,
            conn: Box::new(conn),
            stats,
        };
        if let Err(mpsc::error::SendError(Request::Detach { conn, .. })) = self.tx.send(req) {
            tokio::spawn((*conn).terminate());
        }
    }

    /// Give up a server slot whose connection is gone or being closed
    pub fn close(&self, client: ClientId, server: ServerId, stats: RouteStats) {
        self.send(Request::Close {
            client,
            server,
            stats,
        });
    }

    pub fn backend_ready(&self, server: ServerId, key: CancelKey, params: ParamSet) {
        self.send(Request::BackendReady {
            server,
            key,
            params,
        });
    }

    pub async fn cancel_target(&self, key: CancelKey) -> Option<CancelTarget> {
        self.call(|reply| Request::Cancel { key, reply })
            .await
            .flatten()
    }

    pub async fn kill(&self, client: ClientId) -> bool {
        self.call(|reply| Request::Kill { client, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.call(|reply| Request::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn tick(&self) {
        self.call(|reply| Request::Tick { reply }).await;
    }

    pub async fn reload(&self, config: Config) {
        let config = Box::new(config);
        self.call(|reply| Request::Reload { config, reply }).await;
    }

    pub async fn shutdown(&self) {
        self.call(|reply| Request::Shutdown { reply }).await;
    }
}

pub struct Router {
    state: RouterState<ServerConn>,
    /// Queued clients waiting for a handoff
    waiters: HashMap<ClientId, oneshot::Sender<ServerLease>>,
    kills: HashMap<ClientId, Arc<Notify>>,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl Router {
    /// Start the router task
    pub fn spawn(config: &Config) -> (RouterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            state: RouterState::new(config),
            waiters: HashMap::new(),
            kills: HashMap::new(),
            rx,
        };
        let task = tokio::spawn(router.run());
        (RouterHandle { tx }, task)
    }

    async fn run(mut self) {
        debug!("Router started");
        while let Some(req) = self.rx.recv().await {
            self.handle(req);
        }
        let effects = self.state.shutdown();
        self.apply(effects);
        debug!("Router stopped");
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Route { req, kill, reply } => {
                let client = req.client;
                let result = self.state.route(req);
                if result.is_ok() {
                    self.kills.insert(client, kill);
                }
                if let Err(Ok(_)) = reply.send(result) {
                    self.kills.remove(&client);
                    let effects = self.state.unroute(client);
                    self.apply(effects);
                }
            }
            Request::Unroute { client } => {
                self.waiters.remove(&client);
                self.kills.remove(&client);
                let effects = self.state.unroute(client);
                self.apply(effects);
            }
            Request::Attach { client, reply } => {
                let result = match self.state.attach(client) {
                    Ok(AttachStep::Ready(lease)) => Ok(Attached::Ready(lease)),
                    Ok(AttachStep::Queued) => {
                        let (tx, rx) = oneshot::channel();
                        self.waiters.insert(client, tx);
                        Ok(Attached::Queued(rx))
                    }
                    Err(e) => Err(e),
                };
                if let Err(Ok(Attached::Ready(lease))) = reply.send(result) {
                    // requester vanished before the reply reached it
                    let effects = self.state.revoke(Handoff { client, lease });
                    self.apply(effects);
                }
            }
            Request::QueueTimeout { client } => {
                self.waiters.remove(&client);
                self.state.queue_timeout(client);
            }
            Request::Detach {
                client,
                conn,
                stats,
            } => {
                let effects = self.state.detach(client, *conn, &stats);
                self.apply(effects);
            }
            Request::Close {
                client,
                server,
                stats,
            } => {
                let effects = self.state.close(client, server, &stats);
                self.apply(effects);
            }
            Request::BackendReady {
                server,
                key,
                params,
            } => {
                self.state.backend_ready(server, key, &params);
            }
            Request::Cancel { key, reply } => {
                let _ = reply.send(self.state.find_cancel_target(key));
            }
            Request::Kill { client, reply } => {
                let found = match self.kills.get(&client) {
                    Some(kill) => {
                        kill.notify_one();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            Request::Tick { reply } => {
                let effects = self.state.tick();
                self.apply(effects);
                let _ = reply.send(());
            }
            Request::Reload { config, reply } => {
                self.state.reload(&config);
                let _ = reply.send(());
            }
            Request::Shutdown { reply } => {
                let effects = self.state.shutdown();
                info!("Router closing {} idle server(s)", effects.close.len());
                self.apply(effects);
                let _ = reply.send(());
            }
        }
    }

    /// Deliver handoffs and close dropped connections
    ///
    /// A handoff whose waiter is gone is revoked, which may produce a new
    /// handoff for the next client in line.
    fn apply(&mut self, effects: Effects<ServerConn>) {
        let mut pending = effects;
        loop {
            for conn in pending.close.drain(..) {
                tokio::spawn(conn.terminate());
            }
            let mut next = Effects::default();
            for handoff in pending.handoffs.drain(..) {
                let Some(waiter) = self.waiters.remove(&handoff.client) else {
                    warn!("No waiter for handoff to client {}", handoff.client.short());
                    next.extend(self.state.revoke(handoff));
                    continue;
                };
                let client = handoff.client;
                if let Err(lease) = waiter.send(handoff.lease) {
                    debug!("Client {} stopped waiting, revoking", client.short());
                    next.extend(self.state.revoke(Handoff { client, lease }));
                }
            }
            if next.is_empty() {
                break;
            }
            pending = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolMode, RouteConfig, StorageConfig};
    use std::time::Duration;

    fn config(pool_size: usize) -> Config {
        Config {
            storages: vec![StorageConfig::tcp("main", "127.0.0.1", 5432)],
            routes: vec![
                RouteConfig::builder("*", "*", "main")
                    .pool(PoolMode::Transaction)
                    .pool_size(pool_size)
                    .build()
                    .unwrap(),
            ],
            ..Default::default()
        }
    }

    async fn route(handle: &RouterHandle) -> (ClientId, Arc<Notify>) {
        let client = ClientId::new();
        let kill = Arc::new(Notify::new());
        handle
            .route(
                RouteRequest {
                    client,
                    key: CancelKey::for_client(&client),
                    database: "app".into(),
                    user: "bob".into(),
                },
                kill.clone(),
            )
            .await
            .unwrap();
        (client, kill)
    }

    #[tokio::test]
    async fn test_route_and_snapshot() {
        let (handle, _task) = Router::spawn(&config(1));
        let (client, _) = route(&handle).await;
        let snap = handle.snapshot().await;
        assert_eq!(snap.routes.len(), 1);
        assert_eq!(snap.client(client).unwrap().database, "app");

        handle.unroute(client);
        assert!(handle.snapshot().await.clients.is_empty());
    }

    #[tokio::test]
    async fn test_close_hands_capacity_to_waiter() {
        let (handle, _task) = Router::spawn(&config(1));
        let (a, _) = route(&handle).await;
        let (b, _) = route(&handle).await;

        let lease = match handle.attach(a).await.unwrap() {
            Attached::Ready(lease) => lease,
            Attached::Queued(_) => panic!("first attach must not queue"),
        };
        assert!(lease.is_new());
        let rx = match handle.attach(b).await.unwrap() {
            Attached::Queued(rx) => rx,
            Attached::Ready(_) => panic!("pool of one is taken"),
        };

        handle.close(a, lease.server, RouteStats::default());
        let handed = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(handed.is_new());
        assert_ne!(handed.server, lease.server);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_revoked() {
        let (handle, _task) = Router::spawn(&config(1));
        let (a, _) = route(&handle).await;
        let (b, _) = route(&handle).await;
        let (c, _) = route(&handle).await;

        let Attached::Ready(lease) = handle.attach(a).await.unwrap() else {
            panic!("expected a server");
        };
        let Attached::Queued(rx_b) = handle.attach(b).await.unwrap() else {
            panic!("expected to queue");
        };
        let Attached::Queued(rx_c) = handle.attach(c).await.unwrap() else {
            panic!("expected to queue");
        };
        drop(rx_b);

        handle.close(a, lease.server, RouteStats::default());
        let handed = tokio::time::timeout(Duration::from_secs(1), rx_c)
            .await
            .unwrap()
            .unwrap();
        assert!(handed.is_new());
        let snap = handle.snapshot().await;
        assert_eq!(snap.client(c).unwrap().server, Some(handed.server));
        assert_eq!(snap.client(b).unwrap().server, None);
    }

    #[tokio::test]
    async fn test_kill_notifies_client() {
        let (handle, _task) = Router::spawn(&config(1));
        let (client, kill) = route(&handle).await;
        assert!(handle.kill(client).await);
        tokio::time::timeout(Duration::from_secs(1), kill.notified())
            .await
            .unwrap();
        assert!(!handle.kill(ClientId::new()).await);
    }

    #[tokio::test]
    async fn test_unknown_route_is_reported() {
        let mut cfg = config(1);
        cfg.routes[0].database = "only".into();
        cfg.routes[0].user = "bob".into();
        let (handle, _task) = Router::spawn(&cfg);
        let err = handle
            .route(
                RouteRequest {
                    client: ClientId::new(),
                    key: CancelKey::new(1, 1),
                    database: "app".into(),
                    user: "bob".into(),
                },
                Arc::new(Notify::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_router() {
        let (handle, task) = Router::spawn(&config(1));
        task.abort();
        let _ = task.await;
        assert!(matches!(
            handle.attach(ClientId::new()).await,
            Err(AttachError::RouterGone)
        ));
        assert!(handle.snapshot().await.routes.is_empty());
    }
}
