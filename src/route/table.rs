//! The route table: configured templates plus the live routes built from them
//!
//! # Matching
//!
//! A (database, user) pair is matched against the configured templates in
//! this order:
//!
//! 1. exact database and exact user
//! 2. exact database, default user
//! 3. default database, exact user
//! 4. default database, default user
//!
//! Exact templates are instantiated as static routes up front and are never
//! collected. Wildcard templates are instantiated lazily, one dynamic route
//! per concrete pair, and collected once both pools are empty.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Route, RouteId};
use crate::config::{Config, DEFAULT_MATCH, RouteConfig, StorageConfig};

#[derive(Debug)]
pub struct RouteTable<C> {
    rules: Vec<Arc<RouteConfig>>,
    storages: HashMap<String, Arc<StorageConfig>>,
    routes: HashMap<RouteId, Route<C>>,
    next_id: u64,
}

impl<C> RouteTable<C> {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut table = Self {
            rules: Vec::new(),
            storages: HashMap::new(),
            routes: HashMap::new(),
            next_id: 1,
        };
        table.install(config);
        table
    }

    fn install(&mut self, config: &Config) {
        self.rules = config.routes.iter().cloned().map(Arc::new).collect();
        self.storages = config
            .storages
            .iter()
            .cloned()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        let exact: Vec<Arc<RouteConfig>> = self
            .rules
            .iter()
            .filter(|r| !r.is_default_db() && !r.is_default_user())
            .cloned()
            .collect();
        for rule in exact {
            if self.find_live(&rule.database, &rule.user).is_none() {
                self.create(&rule.database, &rule.user, rule.clone());
            }
        }
    }

    /// Best matching template for a (database, user) pair
    pub fn lookup(&self, database: &str, user: &str) -> Option<&Arc<RouteConfig>> {
        let find = |db: &str, u: &str| {
            self.rules
                .iter()
                .find(|r| r.database == db && r.user == u)
        };
        find(database, user)
            .or_else(|| find(database, DEFAULT_MATCH))
            .or_else(|| find(DEFAULT_MATCH, user))
            .or_else(|| find(DEFAULT_MATCH, DEFAULT_MATCH))
    }

    /// Live, non-obsolete route serving exactly this pair
    pub fn find_live(&self, database: &str, user: &str) -> Option<RouteId> {
        self.routes
            .values()
            .find(|r| !r.obsolete && r.database == database && r.user == user)
            .map(|r| r.id)
    }

    /// Route for a pair, instantiating its template when needed
    pub fn get_or_create(&mut self, database: &str, user: &str) -> Option<RouteId> {
        if let Some(id) = self.find_live(database, user) {
            return Some(id);
        }
        let rule = self.lookup(database, user)?.clone();
        self.create(database, user, rule)
    }

    fn create(&mut self, database: &str, user: &str, rule: Arc<RouteConfig>) -> Option<RouteId> {
        let storage = self.storages.get(&rule.storage)?.clone();
        let id = RouteId(self.next_id);
        self.next_id += 1;
        let route = Route::new(id, database, user, rule, storage);
        debug!(
            "Created {} route {} for {} (pool {}, size {})",
            if route.dynamic { "dynamic" } else { "static" },
            id,
            route.name(),
            route.config.pool,
            route.config.pool_size
        );
        self.routes.insert(id, route);
        Some(id)
    }

    pub fn get(&self, id: RouteId) -> Option<&Route<C>> {
        self.routes.get(&id)
    }

    pub fn get_mut(&mut self, id: RouteId) -> Option<&mut Route<C>> {
        self.routes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route<C>> {
        self.routes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Route<C>> {
        self.routes.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Unlink every collectable route
    pub fn gc(&mut self) -> Vec<RouteId> {
        let dead: Vec<RouteId> = self
            .routes
            .values()
            .filter(|r| r.is_collectable())
            .map(|r| r.id)
            .collect();
        for id in &dead {
            if let Some(route) = self.routes.remove(id) {
                debug!("Collected route {} ({})", id, route.name());
            }
        }
        dead
    }

    /// Install a new configuration snapshot
    ///
    /// Live routes keep their pools. Those whose template or storage changed
    /// or vanished become obsolete; new clients go to fresh routes.
    pub fn reload(&mut self, config: &Config) -> usize {
        self.install(config);
        let mut obsoleted = 0;
        let decisions: Vec<(RouteId, bool)> = self
            .routes
            .values()
            .filter(|r| !r.obsolete)
            .map(|r| {
                let unchanged = self
                    .lookup(&r.database, &r.user)
                    .is_some_and(|rule| **rule == *r.config)
                    && self
                        .storages
                        .get(&r.config.storage)
                        .is_some_and(|s| **s == *r.storage);
                (r.id, unchanged)
            })
            .collect();
        for (id, unchanged) in decisions {
            if !unchanged && let Some(route) = self.routes.get_mut(&id) {
                route.obsolete = true;
                obsoleted += 1;
                info!("Route {} ({}) is obsolete after reload", id, route.name());
            }
        }
        // static routes replaced above need a live successor
        let exact: Vec<Arc<RouteConfig>> = self
            .rules
            .iter()
            .filter(|r| !r.is_default_db() && !r.is_default_user())
            .cloned()
            .collect();
        for rule in exact {
            if self.find_live(&rule.database, &rule.user).is_none() {
                self.create(&rule.database, &rule.user, rule.clone());
            }
        }
        obsoleted
    }
}
