//! Configuration validation
//!
//! Checks the cross-references the type system cannot: routes must point at
//! declared storages and each (database, user) pair may appear only once.

use anyhow::{Result, bail};
use std::collections::HashSet;

use super::types::{Config, PoolMode, StorageConfig, StorageKind};

impl Config {
    /// Validate configuration for correctness
    pub fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            bail!("listen port must not be 0");
        }
        if self.routes.is_empty() {
            bail!("Configuration must have at least one route");
        }

        let mut storage_names = HashSet::new();
        for storage in &self.storages {
            validate_storage(storage)?;
            if !storage_names.insert(storage.name.as_str()) {
                bail!("storage '{}' is defined twice", storage.name);
            }
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !storage_names.contains(route.storage.as_str()) {
                bail!(
                    "route '{}.{}' uses unknown storage '{}'",
                    route.database,
                    route.user,
                    route.storage
                );
            }
            if !seen.insert((route.database.as_str(), route.user.as_str())) {
                bail!("route '{}.{}' is defined twice", route.database, route.user);
            }
            if route.pool == PoolMode::Transaction && route.pool_size == 0 {
                tracing::warn!(
                    "Route '{}.{}' uses transaction pooling with an unbounded pool_size; \
                     backend connections will not be shared under load",
                    route.database,
                    route.user
                );
            }
        }

        if self.general.readahead == 0 {
            bail!("general.readahead must be greater than 0");
        }
        if self.general.tick_interval.is_zero() {
            bail!("general.tick_interval_ms must be greater than 0");
        }

        Ok(())
    }
}

fn validate_storage(storage: &StorageConfig) -> Result<()> {
    if storage.name.is_empty() {
        bail!("storage name must not be empty");
    }
    if storage.kind == StorageKind::Remote {
        if storage.host.is_none() && storage.unix_socket.is_none() {
            bail!(
                "storage '{}' needs either host or unix_socket",
                storage.name
            );
        }
        if storage.port == 0 {
            bail!("storage '{}' has port 0", storage.name);
        }
    }
    Ok(())
}
