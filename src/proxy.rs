//! The pooler process: listener, accept loop, maintenance ticker, reload
//!
//! [`Pooler`] owns the router task and the shared session context. Every
//! accepted connection runs as its own [`ClientSession`] task; the router is
//! the only thing they share.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, load_config};
use crate::constants::buffer::POOL_COUNT;
use crate::network::configure_tcp;
use crate::relay::BufferPool;
use crate::router::{Router, RouterHandle};
use crate::session::{ClientSession, SessionContext};

pub struct Pooler {
    config: Config,
    config_path: Option<PathBuf>,
    router: RouterHandle,
    router_task: JoinHandle<()>,
    ctx: Arc<SessionContext>,
}

impl Pooler {
    /// Start the router for `config`; must be called inside a runtime
    pub fn new(config: Config) -> Self {
        let (router, router_task) = Router::spawn(&config);
        let buffers = BufferPool::new(config.general.readahead, POOL_COUNT);
        let ctx = Arc::new(SessionContext::new(router.clone(), buffers, &config.general));
        Self {
            config,
            config_path: None,
            router,
            router_task,
            ctx,
        }
    }

    /// File re-read on SIGHUP
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured listen address with the configured backlog
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        let addr: SocketAddr = tokio::net::lookup_host(addr.as_str())
            .await
            .with_context(|| format!("cannot resolve listen address {addr}"))?
            .next()
            .with_context(|| format!("listen address {addr} resolves to nothing"))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("cannot bind {addr}"))?;
        socket.listen(self.config.listen.backlog as i32)?;
        let listener = TcpListener::from_std(socket.into())?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept clients until `shutdown` resolves, then close the pools
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let ticker = self.spawn_ticker();
        let reloader = self.spawn_reloader();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        info!("Shutting down, closing idle servers");
        ticker.abort();
        if let Some(reloader) = reloader {
            reloader.abort();
        }
        self.router.shutdown().await;
        // sessions still running lose their router and end on their own
        self.router_task.abort();
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_tcp(&stream) {
            debug!("Failed to set socket options for {}: {}", addr, e);
        }
        let session = ClientSession::new(addr.to_string(), self.ctx.clone());
        debug!("Client {} accepted from {}", session.id().short(), addr);
        tokio::spawn(async move {
            // failures were already logged and reported to the client
            let _ = session.run(stream).await;
        });
    }

    /// Send the router a tick every `tick_interval`
    fn spawn_ticker(&self) -> JoinHandle<()> {
        let router = self.router.clone();
        let period = self.config.general.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                router.tick().await;
            }
        })
    }

    /// Reload routes from the config file on SIGHUP
    #[cfg(unix)]
    fn spawn_reloader(&self) -> Option<JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        let path = self.config_path.clone()?;
        let router = self.router.clone();
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Failed to install SIGHUP handler, reload disabled: {}", e);
                return None;
            }
        };
        Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                reload(&router, &path).await;
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_reloader(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Re-read the configuration file and hand the routes to the router
///
/// A file that fails to load or validate leaves the running routes alone.
pub async fn reload(router: &RouterHandle, path: &std::path::Path) {
    info!("Reloading configuration from {}", path.display());
    match load_config(path) {
        Ok(config) => {
            router.reload(config).await;
            info!("Configuration reloaded");
        }
        Err(e) => error!("Reload failed, keeping current routes: {:#}", e),
    }
}
