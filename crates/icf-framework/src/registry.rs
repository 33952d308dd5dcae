//! Connector factory registry
//!
//! Maps connector keys to the factories that build their instances, and
//! describes the installed connectors for the remote handshake.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use icf_connector::{
    BatchSupport, CapabilitySet, ConfigurationSchema, ConnectorError, ConnectorFactory,
    ConnectorKey, ConnectorResult,
};

/// Description of one installed connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub key: ConnectorKey,
    pub display_name: String,
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub batch_support: BatchSupport,
    pub configuration_schema: ConfigurationSchema,
}

impl ConnectorInfo {
    /// Describe the connector built by a factory.
    pub fn from_factory(factory: &dyn ConnectorFactory) -> Self {
        Self {
            key: factory.key(),
            display_name: factory.display_name().to_string(),
            capabilities: factory.capabilities(),
            batch_support: factory.batch_support(),
            configuration_schema: factory.configuration_schema(),
        }
    }
}

/// Registry of connector factories.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: DashMap<ConnectorKey, Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its key, replacing any previous one.
    ///
    /// Returns the replaced factory.
    pub fn register(&self, factory: Arc<dyn ConnectorFactory>) -> Option<Arc<dyn ConnectorFactory>> {
        let key = factory.key();
        info!(connector = %key, name = factory.display_name(), "Connector registered");
        self.factories.insert(key, factory)
    }

    /// Remove a factory.
    pub fn unregister(&self, key: &ConnectorKey) -> Option<Arc<dyn ConnectorFactory>> {
        self.factories.remove(key).map(|(_, factory)| factory)
    }

    /// Look up a factory.
    pub fn get(&self, key: &ConnectorKey) -> Option<Arc<dyn ConnectorFactory>> {
        self.factories.get(key).map(|entry| entry.value().clone())
    }

    /// Look up a factory, failing with [`ConnectorError::ConnectorNotFound`].
    pub fn require(&self, key: &ConnectorKey) -> ConnectorResult<Arc<dyn ConnectorFactory>> {
        self.get(key)
            .ok_or_else(|| ConnectorError::ConnectorNotFound { key: key.clone() })
    }

    /// Describe every registered connector, ordered by key.
    pub fn infos(&self) -> Vec<ConnectorInfo> {
        let mut infos: Vec<ConnectorInfo> = self
            .factories
            .iter()
            .map(|entry| ConnectorInfo::from_factory(entry.value().as_ref()))
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}
