//! Facade cache
//!
//! Shares one [`LocalConnectorFacade`] per distinct API configuration.
//! Facades are keyed by [`ApiConfiguration::canonical_key`], so two
//! configurations that differ only in property order map to the same entry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use icf_connector::{ApiConfiguration, ConnectorResult};

use crate::batch::BatchEngine;
use crate::facade::{ConnectorFacade, LocalConnectorFacade};
use crate::registry::ConnectorRegistry;

/// Process-wide cache of local facades.
pub struct FacadeCache {
    registry: Arc<ConnectorRegistry>,
    engine: Arc<BatchEngine>,
    facades: DashMap<String, Arc<LocalConnectorFacade>>,
}

impl FacadeCache {
    /// Create an empty cache building facades from `registry`.
    pub fn new(registry: Arc<ConnectorRegistry>, engine: Arc<BatchEngine>) -> Self {
        Self {
            registry,
            engine,
            facades: DashMap::new(),
        }
    }

    /// Get the facade for `api`, building it on first use.
    ///
    /// Concurrent callers with the same configuration all receive the same
    /// facade. A facade built by a caller that lost the insert race is
    /// disposed before this returns.
    pub async fn new_instance(
        &self,
        api: &ApiConfiguration,
    ) -> ConnectorResult<Arc<LocalConnectorFacade>> {
        let key = api.canonical_key()?;
        if let Some(entry) = self.facades.get(&key) {
            entry.value().touch();
            return Ok(entry.value().clone());
        }

        let factory = self.registry.require(&api.connector)?;
        let built = Arc::new(LocalConnectorFacade::new(
            factory,
            api.clone(),
            self.engine.clone(),
        )?);

        let (facade, loser) = match self.facades.entry(key) {
            Entry::Occupied(entry) => {
                entry.get().touch();
                (entry.get().clone(), Some(built))
            }
            Entry::Vacant(entry) => {
                entry.insert(built.clone());
                (built, None)
            }
        };

        match loser {
            Some(loser) => {
                debug!(connector = %api.connector, "Concurrent facade build discarded");
                loser.dispose().await;
            }
            None => info!(connector = %api.connector, "Facade cached"),
        }
        Ok(facade)
    }

    /// Look up a cached facade without building one.
    pub fn get(&self, api: &ApiConfiguration) -> Option<Arc<LocalConnectorFacade>> {
        let key = api.canonical_key().ok()?;
        self.facades.get(&key).map(|entry| entry.value().clone())
    }

    /// Remove and dispose facades unused for `idle`.
    ///
    /// A facade with operations in flight or instances checked out is kept.
    /// The check and the removal happen under the entry's lock, so a
    /// concurrent `new_instance` either sees the entry before removal (and
    /// refreshes it, keeping it alive) or builds a fresh one after.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let keys: Vec<String> = self.facades.iter().map(|entry| entry.key().clone()).collect();
        let evicted: Vec<Arc<LocalConnectorFacade>> = keys
            .iter()
            .filter_map(|key| {
                self.facades
                    .remove_if(key, |_, facade| facade.is_unused_for(idle))
                    .map(|(_, facade)| facade)
            })
            .collect();

        let count = evicted.len();
        for facade in evicted {
            debug!(connector = %facade.key(), "Evicting idle facade");
            facade.dispose().await;
        }
        if count > 0 {
            info!(evicted = count, remaining = self.facades.len(), "Idle facades evicted");
        }
        count
    }

    /// Run pool eviction on every cached facade.
    pub async fn evict_pools(&self) -> usize {
        let facades: Vec<Arc<LocalConnectorFacade>> = self
            .facades
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut evicted = 0;
        for facade in facades {
            evicted += facade.evict_pool_idle().await;
        }
        evicted
    }

    /// Dispose and forget every facade.
    pub async fn dispose(&self) {
        let keys: Vec<String> = self.facades.iter().map(|entry| entry.key().clone()).collect();
        let facades: Vec<Arc<LocalConnectorFacade>> = keys
            .iter()
            .filter_map(|key| self.facades.remove(key).map(|(_, facade)| facade))
            .collect();
        for facade in &facades {
            facade.dispose().await;
        }
        info!(disposed = facades.len(), "Facade cache disposed");
    }

    /// Number of cached facades.
    pub fn len(&self) -> usize {
        self.facades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facades.is_empty()
    }
}

impl std::fmt::Debug for FacadeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacadeCache")
            .field("facades", &self.facades.len())
            .finish()
    }
}
