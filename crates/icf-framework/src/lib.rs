//! # Connector Framework
//!
//! Caller-facing layer over the connector SPI: configured facades with
//! instance pooling, a shared facade cache, the batch engine, and the remote
//! connector server and client built on `icf-rpc`.
//!
//! ## Architecture
//!
//! - [`ConnectorRegistry`] - Installed connector factories
//! - [`LocalConnectorFacade`] - Operations on pooled local instances
//! - [`FacadeCache`] - One shared facade per configuration, idle eviction
//! - [`BatchEngine`] - Sequential, synchronous, token and callback batches
//! - [`remote`] - Wire messages, server dispatcher, client and remote facade
//! - [`ConnectorFramework`] - Owns all of the above and runs maintenance
//!
//! ## Example
//!
//! ```ignore
//! use icf_framework::prelude::*;
//!
//! let framework = Arc::new(ConnectorFramework::new(FrameworkConfig::from_env()?)?);
//! framework.register(Arc::new(LdapConnectorFactory));
//! framework.start_maintenance();
//!
//! let facade = framework.new_instance(&api).await?;
//! let uid = facade.create("account", attributes, &OperationOptions::default()).await?;
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod facade;
pub mod framework;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod remote;

pub use batch::{BatchEngine, BatchSubscription, LocalBatchSubscription, TaskRunner};
pub use cache::FacadeCache;
pub use config::{
    BatchConfig, CacheConfig, ConfigError, DistributorConfig, FrameworkConfig, LoggingConfig,
    ServerConfig,
};
pub use facade::{ConnectorFacade, LocalConnectorFacade, SharedObserver};
pub use framework::{ConnectorFramework, MaintenanceReport};
pub use logging::{init_from_config, init_logging};
pub use pool::{ConnectorPool, PoolStatistics, PooledConnector};
pub use registry::{ConnectorInfo, ConnectorRegistry};
pub use remote::{
    ConnectorServer, OperationDispatcher, RemoteBatchSubscription, RemoteConnectorClient,
    RemoteConnectorFacade,
};

/// Prelude module for convenient imports.
pub mod prelude {
    // Facades
    pub use crate::facade::{ConnectorFacade, LocalConnectorFacade, SharedObserver};
    pub use crate::remote::{RemoteConnectorClient, RemoteConnectorFacade};

    // Batches
    pub use crate::batch::BatchSubscription;

    // Service
    pub use crate::config::FrameworkConfig;
    pub use crate::framework::ConnectorFramework;
    pub use crate::registry::{ConnectorInfo, ConnectorRegistry};

    // SPI
    pub use icf_connector::prelude::*;
    pub use icf_rpc::{CollectingObserver, Observer, Subscription, Termination};
}
