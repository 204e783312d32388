//! Configuration type definitions
//!
//! This module contains the configuration structures read from the TOML
//! file. Routes are handed to the router as immutable `Arc` snapshots.

use crate::types::{duration_millis, duration_secs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Wildcard used for the default database or user of a route
pub const DEFAULT_MATCH: &str = "*";

/// When a backend connection goes back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Backend held for the client's whole connection
    #[default]
    Session,
    /// Backend released after every transaction
    Transaction,
}

impl PoolMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Transaction => "transaction",
        }
    }

    #[must_use]
    pub const fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction)
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A real backend reached over TCP or a Unix socket
    #[default]
    Remote,
    /// The in-process admin console
    Local,
}

/// Main pooler configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default, rename = "storage")]
    pub storages: Vec<StorageConfig>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    /// Look up a storage by name
    pub fn storage(&self, name: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.name == name)
    }

    /// Listen address as `host:port`
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    /// Global cap on connected clients (0 = unlimited)
    pub client_max: usize,
    /// Runtime worker threads (0 = one per CPU)
    pub workers: usize,
}

impl ListenConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: Self::DEFAULT_HOST.to_string(),
            port: super::defaults::listen_port(),
            backlog: super::defaults::backlog(),
            client_max: 0,
            workers: 0,
        }
    }
}

/// Process-wide tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(
        rename = "tick_interval_ms",
        with = "duration_millis",
        default = "super::defaults::tick_interval"
    )]
    pub tick_interval: Duration,
    /// Log per-route statistics every N ticks (0 = never)
    #[serde(default)]
    pub log_stats: u64,
    #[serde(
        rename = "connect_timeout_ms",
        with = "duration_millis",
        default = "super::defaults::connect_timeout"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "super::defaults::readahead")]
    pub readahead: usize,
    #[serde(default = "super::defaults::pipeline_flush")]
    pub pipeline_flush: usize,
    /// Forward backend connection errors to the client verbatim
    #[serde(default = "super::defaults::client_fwd_error")]
    pub client_fwd_error: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tick_interval: super::defaults::tick_interval(),
            log_stats: 0,
            connect_timeout: super::defaults::connect_timeout(),
            readahead: super::defaults::readahead(),
            pipeline_flush: super::defaults::pipeline_flush(),
            client_fwd_error: super::defaults::client_fwd_error(),
        }
    }
}

/// A backend (or the local console) that routes point at
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "super::defaults::backend_port")]
    pub port: u16,
    /// Socket directory or full socket path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
}

impl StorageConfig {
    /// Remote storage reached over TCP
    #[must_use]
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind: StorageKind::Remote,
            host: Some(host.into()),
            port,
            unix_socket: None,
        }
    }

    /// The in-process console
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StorageKind::Local,
            host: None,
            port: super::defaults::backend_port(),
            unix_socket: None,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.kind == StorageKind::Local
    }

    /// Full path of the Unix socket, if the storage uses one
    ///
    /// A directory gets the usual `.s.PGSQL.<port>` file name appended.
    pub fn socket_path(&self) -> Option<PathBuf> {
        let path = self.unix_socket.as_ref()?;
        let is_socket_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".s.PGSQL."));
        if is_socket_file {
            Some(path.clone())
        } else {
            Some(path.join(format!(".s.PGSQL.{}", self.port)))
        }
    }

    /// Human-readable dial target
    #[must_use]
    pub fn target(&self) -> String {
        if let Some(path) = self.socket_path() {
            return path.display().to_string();
        }
        format!("{}:{}", self.host.as_deref().unwrap_or("localhost"), self.port)
    }
}

/// One `[[route]]` entry: a pooling template for a (database, user) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub database: String,
    pub user: String,
    pub storage: String,
    #[serde(default)]
    pub pool: PoolMode,
    /// Servers allowed in Idle or Active at once (0 = unbounded)
    #[serde(default)]
    pub pool_size: usize,
    /// How long an attach may wait for a server (0 = forever)
    #[serde(
        rename = "pool_timeout_ms",
        with = "duration_millis",
        default = "super::defaults::pool_timeout"
    )]
    pub pool_timeout: Duration,
    /// Idle time after which a server is closed (0 = never)
    #[serde(
        rename = "pool_ttl_secs",
        with = "duration_secs",
        default = "super::defaults::pool_ttl"
    )]
    pub pool_ttl: Duration,
    /// Cap on clients routed here (0 = unlimited)
    #[serde(default)]
    pub client_max: usize,
    #[serde(default = "super::defaults::pool_discard")]
    pub pool_discard: bool,
    #[serde(default = "super::defaults::pool_rollback")]
    pub pool_rollback: bool,
    #[serde(default = "super::defaults::pool_cancel")]
    pub pool_cancel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_password: Option<String>,
    /// Cleartext password clients must present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl RouteConfig {
    /// Start building a route for tests and generated configs
    #[must_use]
    pub fn builder(
        database: impl Into<String>,
        user: impl Into<String>,
        storage: impl Into<String>,
    ) -> RouteConfigBuilder {
        RouteConfigBuilder {
            route: RouteConfig {
                database: database.into(),
                user: user.into(),
                storage: storage.into(),
                pool: PoolMode::default(),
                pool_size: 0,
                pool_timeout: super::defaults::pool_timeout(),
                pool_ttl: super::defaults::pool_ttl(),
                client_max: 0,
                pool_discard: super::defaults::pool_discard(),
                pool_rollback: super::defaults::pool_rollback(),
                pool_cancel: super::defaults::pool_cancel(),
                storage_db: None,
                storage_user: None,
                storage_password: None,
                password: None,
            },
        }
    }

    #[must_use]
    pub fn is_default_db(&self) -> bool {
        self.database == DEFAULT_MATCH
    }

    #[must_use]
    pub fn is_default_user(&self) -> bool {
        self.user == DEFAULT_MATCH
    }
}

/// Builder for [`RouteConfig`]
#[derive(Debug, Clone)]
pub struct RouteConfigBuilder {
    route: RouteConfig,
}

impl RouteConfigBuilder {
    #[must_use]
    pub fn pool(mut self, mode: PoolMode) -> Self {
        self.route.pool = mode;
        self
    }

    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.route.pool_size = size;
        self
    }

    #[must_use]
    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.route.pool_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_ttl(mut self, ttl: Duration) -> Self {
        self.route.pool_ttl = ttl;
        self
    }

    #[must_use]
    pub fn client_max(mut self, max: usize) -> Self {
        self.route.client_max = max;
        self
    }

    #[must_use]
    pub fn pool_discard(mut self, on: bool) -> Self {
        self.route.pool_discard = on;
        self
    }

    #[must_use]
    pub fn pool_rollback(mut self, on: bool) -> Self {
        self.route.pool_rollback = on;
        self
    }

    #[must_use]
    pub fn pool_cancel(mut self, on: bool) -> Self {
        self.route.pool_cancel = on;
        self
    }

    #[must_use]
    pub fn storage_login(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.route.storage_user = Some(user.into());
        self.route.storage_password = password;
        self
    }

    #[must_use]
    pub fn storage_db(mut self, db: impl Into<String>) -> Self {
        self.route.storage_db = Some(db.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.route.password = Some(password.into());
        self
    }

    pub fn build(self) -> anyhow::Result<RouteConfig> {
        if self.route.database.is_empty() || self.route.user.is_empty() {
            anyhow::bail!("route database and user must not be empty");
        }
        if self.route.storage.is_empty() {
            anyhow::bail!(
                "route '{}.{}' must name a storage",
                self.route.database,
                self.route.user
            );
        }
        Ok(self.route)
    }
}
