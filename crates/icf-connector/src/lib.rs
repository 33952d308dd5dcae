//! # Identity Connector SPI
//!
//! Everything a connector implementation and its callers share: the
//! [`Connector`] and [`ConnectorFactory`] traits, the object model moved
//! across the connector boundary, declarative configuration, batch types
//! and the error taxonomy.
//!
//! ## Architecture
//!
//! A [`ConnectorFactory`] declares the operations its connector implements
//! in a [`CapabilitySet`]. Every operation of [`Connector`] has a default
//! body returning [`ConnectorError::Unsupported`], so an implementation only
//! overrides what it declares:
//!
//! ```ignore
//! use icf_connector::prelude::*;
//!
//! struct CsvConnector { /* ... */ }
//!
//! #[async_trait]
//! impl Connector for CsvConnector {
//!     async fn create(
//!         &self,
//!         object_class: &str,
//!         attributes: AttributeSet,
//!         options: &OperationOptions,
//!     ) -> ConnectorResult<Uid> {
//!         // ...
//!     }
//! }
//! ```
//!
//! ## Crate Organization
//!
//! - [`ids`] - Connector keys and batch tokens
//! - [`types`] - Operation kinds, capability sets, batch support tiers
//! - [`error`] - Error types with transient/permanent classification
//! - [`traits`] - Connector SPI
//! - [`schema`] - Object class and attribute descriptions
//! - [`operation`] - UIDs, attribute sets, filters, sync deltas
//! - [`config`] - Configuration schema, pool settings, API configuration
//! - [`batch`] - Batch tasks, results and the result sink

pub mod batch;
pub mod config;
pub mod error;
pub mod ids;
pub mod operation;
pub mod schema;
pub mod traits;
pub mod types;

pub use batch::{BatchListener, BatchOptions, BatchOutcome, BatchResult, BatchSink, BatchTask};
pub use config::{
    ApiConfiguration, Configuration, ConfigurationSchema, PoolConfig, PropertyKind, PropertySpec,
};
pub use error::{ConnectorError, ConnectorResult};
pub use ids::{BatchToken, ConnectorKey};
pub use operation::{
    AttributeSet, AttributeValue, ConnectorObject, Filter, OperationOptions, ResultsHandler,
    ScriptContext, SearchResult, SyncDelta, SyncDeltaType, SyncToken, Uid,
};
pub use schema::{AttributeInfo, ObjectClassInfo, Schema};
pub use traits::{Connector, ConnectorFactory};
pub use types::{BatchSupport, CapabilitySet, OperationKind, UpdateType};

/// Prelude module for convenient imports.
///
/// ```
/// use icf_connector::prelude::*;
/// ```
pub mod prelude {
    // IDs
    pub use crate::ids::{BatchToken, ConnectorKey};

    // Types and enums
    pub use crate::types::{BatchSupport, CapabilitySet, OperationKind, UpdateType};

    // Error handling
    pub use crate::error::{ConnectorError, ConnectorResult};

    // Traits
    pub use crate::traits::{Connector, ConnectorFactory};

    // Schema
    pub use crate::schema::{AttributeInfo, ObjectClassInfo, Schema};

    // Operations
    pub use crate::operation::{
        AttributeSet, AttributeValue, ConnectorObject, Filter, OperationOptions, ResultsHandler,
        ScriptContext, SearchResult, SyncDelta, SyncDeltaType, SyncToken, Uid,
    };

    // Configuration
    pub use crate::config::{
        ApiConfiguration, Configuration, ConfigurationSchema, PoolConfig, PropertyKind,
        PropertySpec,
    };

    // Batches
    pub use crate::batch::{
        BatchListener, BatchOptions, BatchOutcome, BatchResult, BatchSink, BatchTask,
    };

    pub use crate::async_trait;
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    struct Inert;

    #[async_trait]
    impl Connector for Inert {}

    #[test]
    fn test_prelude_imports() {
        let _key = ConnectorKey::new("bundle", "1.0", "Inert");
        let _token = BatchToken::new();
        let _uid = Uid::from_value("test");
        let _attrs = AttributeSet::new().with("name", "test");
        let _filter = Filter::eq("email", "test@example.com");
        let _options = OperationOptions::new();
    }

    #[tokio::test]
    async fn test_undeclared_operations_default_to_unsupported() {
        let connector = Inert;
        let err = connector
            .create("account", AttributeSet::new(), &OperationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Unsupported {
                operation: OperationKind::Create
            }
        ));
        assert!(connector.check_alive().await.is_ok());
    }
}
