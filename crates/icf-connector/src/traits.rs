//! Connector Framework traits
//!
//! The connector SPI. A factory declares the operations its connector
//! implements in a [`CapabilitySet`]; every operation of [`Connector`] has a
//! default body returning [`ConnectorError::Unsupported`], so an
//! implementation only overrides what it declares. The framework never calls
//! an undeclared operation.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::batch::{BatchOptions, BatchSink, BatchTask};
use crate::config::{ConfigurationSchema, Configuration};
use crate::error::{ConnectorError, ConnectorResult};
use crate::ids::{BatchToken, ConnectorKey};
use crate::operation::{
    AttributeSet, ConnectorObject, Filter, OperationOptions, ResultsHandler, ScriptContext,
    SearchResult, SyncDelta, SyncToken, Uid,
};
use crate::schema::Schema;
use crate::types::{BatchSupport, CapabilitySet, OperationKind, UpdateType};

/// A live connector instance bound to one configuration.
///
/// Instances are pooled by the framework. Unless its factory reports
/// [`ConnectorFactory::concurrent_safe`], an instance serves one operation
/// at a time.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Lightweight liveness check run before a pooled instance is reused.
    async fn check_alive(&self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Release resources held by this instance.
    async fn dispose(&self) {}

    /// Test the connection to the target system.
    async fn test(&self) -> ConnectorResult<()> {
        Err(ConnectorError::unsupported(OperationKind::Test))
    }

    /// Describe the object classes of the target system.
    async fn schema(&self) -> ConnectorResult<Schema> {
        Err(ConnectorError::unsupported(OperationKind::Schema))
    }

    /// Create a new object.
    ///
    /// # Arguments
    /// * `object_class` - The type of object to create (e.g., "account", "group")
    /// * `attributes` - The attributes for the new object
    ///
    /// # Returns
    /// The UID of the created object.
    async fn create(
        &self,
        object_class: &str,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        let _ = (object_class, attributes, options);
        Err(ConnectorError::unsupported(OperationKind::Create))
    }

    /// Update an existing object.
    ///
    /// Returns the UID of the updated object, which may differ from `uid`
    /// for systems where a rename changes the identifier.
    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        let _ = (object_class, uid, update_type, attributes, options);
        Err(ConnectorError::unsupported(OperationKind::Update))
    }

    /// Delete an object.
    async fn delete(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()> {
        let _ = (object_class, uid, options);
        Err(ConnectorError::unsupported(OperationKind::Delete))
    }

    /// Stream the objects matching `filter` into `handler`.
    ///
    /// Stops early when the handler returns `false`; the returned
    /// [`SearchResult`] then reports `all_results_returned = false`.
    async fn search(
        &self,
        object_class: &str,
        filter: Option<&Filter>,
        handler: &dyn ResultsHandler<ConnectorObject>,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchResult> {
        let _ = (object_class, filter, handler, options);
        Err(ConnectorError::unsupported(OperationKind::Search))
    }

    /// Stream the changes after `token` into `handler`.
    ///
    /// Returns the token to resume from.
    async fn sync(
        &self,
        object_class: &str,
        token: Option<SyncToken>,
        handler: &dyn ResultsHandler<SyncDelta>,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<SyncToken>> {
        let _ = (object_class, token, handler, options);
        Err(ConnectorError::unsupported(OperationKind::Sync))
    }

    /// Current position of the change log.
    async fn latest_sync_token(&self, object_class: &str) -> ConnectorResult<Option<SyncToken>> {
        let _ = object_class;
        Err(ConnectorError::unsupported(OperationKind::Sync))
    }

    /// Verify credentials and return the account's UID.
    async fn authenticate(
        &self,
        object_class: &str,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        let _ = (object_class, username, password, options);
        Err(ConnectorError::unsupported(OperationKind::Authenticate))
    }

    /// Find the UID of an account by username.
    async fn resolve_username(
        &self,
        object_class: &str,
        username: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        let _ = (object_class, username, options);
        Err(ConnectorError::unsupported(OperationKind::ResolveUsername))
    }

    async fn run_script_on_connector(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        let _ = (script, options);
        Err(ConnectorError::unsupported(OperationKind::ScriptOnConnector))
    }

    async fn run_script_on_resource(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        let _ = (script, options);
        Err(ConnectorError::unsupported(OperationKind::ScriptOnResource))
    }

    /// Execute a batch natively.
    ///
    /// Only called when [`ConnectorFactory::batch_support`] is not
    /// [`BatchSupport::None`]. A synchronous connector sends every result
    /// to `sink` before returning `Ok(None)`. A token or callback connector
    /// returns `Ok(Some(token))` right away and keeps a clone of `sink` in
    /// its background work; the last result it sends carries
    /// `complete = true`.
    async fn execute_batch(
        &self,
        tasks: Vec<BatchTask>,
        sink: BatchSink,
        options: &BatchOptions,
    ) -> ConnectorResult<Option<BatchToken>> {
        let _ = (tasks, sink, options);
        Err(ConnectorError::unsupported(OperationKind::Batch))
    }
}

/// Creates connector instances for one connector key.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Key under which this factory is registered.
    fn key(&self) -> ConnectorKey;

    /// Human-readable connector name.
    fn display_name(&self) -> &str;

    /// Properties the connector accepts.
    fn configuration_schema(&self) -> ConfigurationSchema;

    /// Operations the connector implements.
    fn capabilities(&self) -> CapabilitySet;

    /// How the connector executes batches natively.
    fn batch_support(&self) -> BatchSupport {
        BatchSupport::None
    }

    /// Whether one instance may serve concurrent operations.
    fn concurrent_safe(&self) -> bool {
        false
    }

    /// Extra checks beyond what the configuration schema enforces.
    fn validate(&self, configuration: &Configuration) -> ConnectorResult<()> {
        let _ = configuration;
        Ok(())
    }

    /// Build a new instance.
    async fn create(&self, configuration: Configuration) -> ConnectorResult<Arc<dyn Connector>>;
}
