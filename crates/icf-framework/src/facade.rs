//! Connector facades
//!
//! A facade is the caller-facing handle on one configured connector. The
//! [`ConnectorFacade`] trait is implemented locally by
//! [`LocalConnectorFacade`], which runs operations on pooled instances, and
//! remotely by `RemoteConnectorFacade`, which forwards them to a connector
//! server.
//!
//! Streaming operations (`search`, `sync`, batches) push items to an
//! observer and then deliver exactly one terminal event to it, in addition
//! to returning their result.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use icf_connector::{
    ApiConfiguration, AttributeSet, BatchOptions, BatchOutcome, BatchResult, BatchSupport,
    BatchTask, BatchToken, CapabilitySet, Configuration, Connector, ConnectorError,
    ConnectorFactory, ConnectorKey, ConnectorObject, ConnectorResult, Filter, OperationKind,
    OperationOptions, Schema, ScriptContext, SearchResult, SyncDelta, SyncToken, Uid, UpdateType,
};
use icf_rpc::Observer;

use crate::batch::{BatchEngine, BatchSubscription, TaskRunner};
use crate::pool::{ConnectorPool, PoolStatistics};

/// Observer shared between a caller and the facade streaming into it.
pub type SharedObserver<T> = Arc<dyn Observer<T, ConnectorError>>;

/// Caller-facing operations on one configured connector.
#[async_trait]
pub trait ConnectorFacade: Send + Sync {
    /// Key of the connector behind this facade.
    fn key(&self) -> &ConnectorKey;

    /// Operations this facade accepts.
    fn capabilities(&self) -> &CapabilitySet;

    async fn create(
        &self,
        object_class: &str,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;

    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;

    async fn delete(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()>;

    /// Read one object by UID.
    async fn get(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<ConnectorObject>>;

    /// Stream matching objects into `observer`.
    async fn search(
        &self,
        object_class: &str,
        filter: Option<Filter>,
        observer: SharedObserver<ConnectorObject>,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchResult>;

    /// Stream changes after `token` into `observer`.
    async fn sync(
        &self,
        object_class: &str,
        token: Option<SyncToken>,
        observer: SharedObserver<SyncDelta>,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<SyncToken>>;

    async fn latest_sync_token(&self, object_class: &str) -> ConnectorResult<Option<SyncToken>>;

    async fn authenticate(
        &self,
        object_class: &str,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;

    async fn resolve_username(
        &self,
        object_class: &str,
        username: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;

    async fn run_script_on_connector(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value>;

    async fn run_script_on_resource(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value>;

    async fn test(&self) -> ConnectorResult<()>;

    async fn schema(&self) -> ConnectorResult<Schema>;

    /// Check the configuration without touching the target system.
    async fn validate(&self) -> ConnectorResult<()>;

    /// Run a batch.
    ///
    /// Returns no subscription when the batch ran to its end inside the
    /// call without native support.
    async fn execute_batch(
        &self,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>>;

    /// Collect results of an asynchronous batch.
    async fn query_batch(
        &self,
        token: BatchToken,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
    ) -> ConnectorResult<Box<dyn BatchSubscription>>;

    /// Release everything held by this facade.
    async fn dispose(&self);

    /// Check if the facade served nothing for `idle` and holds no checkouts.
    fn is_unused_for(&self, idle: Duration) -> bool;
}

/// Deliver the terminal event of a streaming operation.
pub(crate) fn finish_stream<T, R>(
    observer: &SharedObserver<T>,
    result: ConnectorResult<R>,
) -> ConnectorResult<R> {
    match &result {
        Ok(_) => observer.on_completed(),
        Err(e) => observer.on_error(e.clone()),
    }
    result
}

/// Operations a facade accepts on top of what the connector declares.
///
/// Validation is always available, `get` runs through `search`, and
/// batches run through single writes when there is no native support.
pub(crate) fn facade_capabilities(
    declared: CapabilitySet,
    batch_support: BatchSupport,
) -> CapabilitySet {
    let mut capabilities = declared;
    capabilities.insert(OperationKind::Validate);
    if capabilities.supports(OperationKind::Search) {
        capabilities.insert(OperationKind::Get);
    }
    let single_writes = [
        OperationKind::Create,
        OperationKind::Update,
        OperationKind::Delete,
    ];
    if batch_support != BatchSupport::None
        || single_writes.iter().any(|kind| capabilities.supports(*kind))
    {
        capabilities.insert(OperationKind::Batch);
    }
    capabilities
}

// ============================================================================
// Local facade
// ============================================================================

/// Facade running operations on a pool of local connector instances.
pub struct LocalConnectorFacade {
    key: ConnectorKey,
    api: ApiConfiguration,
    capabilities: CapabilitySet,
    batch_support: BatchSupport,
    factory: Arc<dyn ConnectorFactory>,
    pool: Arc<ConnectorPool>,
    engine: Arc<BatchEngine>,
    in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
    disposed: AtomicBool,
}

/// Counts one operation in flight for as long as it lives.
struct InFlight<'a>(&'a LocalConnectorFacade);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.0.touch();
    }
}

impl LocalConnectorFacade {
    /// Build a facade for `api` on top of `factory`.
    ///
    /// The configuration properties are bound against the connector's
    /// schema and checked by the factory before any instance is created.
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        api: ApiConfiguration,
        engine: Arc<BatchEngine>,
    ) -> ConnectorResult<Self> {
        let key = factory.key();
        if api.connector != key {
            return Err(ConnectorError::invalid_configuration(format!(
                "configuration targets {} but the factory builds {}",
                api.connector, key
            )));
        }
        api.pool.validate()?;
        let configuration = Self::bind(factory.as_ref(), &api)?;

        let batch_support = factory.batch_support();
        let capabilities = facade_capabilities(factory.capabilities(), batch_support);

        let pool = ConnectorPool::new(factory.clone(), configuration, api.pool.clone());
        debug!(connector = %key, batch_support = %batch_support, "Facade created");

        Ok(Self {
            key,
            api,
            capabilities,
            batch_support,
            factory,
            pool,
            engine,
            in_flight: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            disposed: AtomicBool::new(false),
        })
    }

    fn bind(
        factory: &dyn ConnectorFactory,
        api: &ApiConfiguration,
    ) -> ConnectorResult<Configuration> {
        let configuration = factory.configuration_schema().bind(&api.properties)?;
        factory.validate(&configuration)?;
        Ok(configuration)
    }

    /// Configuration this facade was built from.
    pub fn api_configuration(&self) -> &ApiConfiguration {
        &self.api
    }

    /// Native batch tier of the connector.
    pub fn batch_support(&self) -> BatchSupport {
        self.batch_support
    }

    /// Usage of the instance pool.
    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    /// Number of operations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Record a use of this facade.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Dispose pooled instances idle past the pool's eviction threshold.
    pub async fn evict_pool_idle(&self) -> usize {
        self.pool.evict_idle().await
    }

    /// Run a batch that stops when `cancel` fires.
    ///
    /// Errors raised before the batch starts are delivered to `observer`
    /// and returned.
    pub async fn execute_batch_cancellable(
        &self,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
        cancel: CancellationToken,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>> {
        if let Err(e) = self.ensure_supported(OperationKind::Batch) {
            observer.on_error(e.clone());
            return Err(e);
        }
        let _guard = self.begin();

        if self.batch_support == BatchSupport::None {
            return self
                .engine
                .run_sequential(self, tasks, observer, options, &cancel)
                .await;
        }

        let lease = match self.pool.checkout().await {
            Ok(lease) => lease,
            Err(e) => {
                observer.on_error(e.clone());
                return Err(e);
            }
        };
        self.engine
            .run_native(lease, self.batch_support, tasks, observer, options, cancel)
            .await
    }

    fn ensure_supported(&self, operation: OperationKind) -> ConnectorResult<()> {
        if self.capabilities.supports(operation) {
            Ok(())
        } else {
            Err(ConnectorError::unsupported(operation))
        }
    }

    fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        InFlight(self)
    }

    /// Run `call` on a checked-out instance, bounded by the operation's
    /// configured timeout.
    async fn invoke<T, F, Fut>(&self, operation: OperationKind, call: F) -> ConnectorResult<T>
    where
        F: FnOnce(Arc<dyn Connector>) -> Fut + Send,
        Fut: Future<Output = ConnectorResult<T>> + Send,
        T: Send,
    {
        self.ensure_supported(operation)?;
        let _guard = self.begin();

        let run = async {
            let lease = self.pool.checkout().await?;
            let result = call(lease.connector()).await;
            drop(lease);
            result
        };

        let result = match self.api.timeout_for(operation) {
            Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
                Err(ConnectorError::OperationTimeout {
                    operation,
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }),
            None => run.await,
        };

        if let Err(e) = &result {
            debug!(connector = %self.key, operation = %operation, error = %e, "Operation failed");
        }
        result
    }
}

#[async_trait]
impl ConnectorFacade for LocalConnectorFacade {
    fn key(&self) -> &ConnectorKey {
        &self.key
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    async fn create(
        &self,
        object_class: &str,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.invoke(OperationKind::Create, |connector| async move {
            connector.create(object_class, attributes, options).await
        })
        .await
    }

    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.invoke(OperationKind::Update, |connector| async move {
            connector
                .update(object_class, uid, update_type, attributes, options)
                .await
        })
        .await
    }

    async fn delete(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()> {
        self.invoke(OperationKind::Delete, |connector| async move {
            connector.delete(object_class, uid, options).await
        })
        .await
    }

    async fn get(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<ConnectorObject>> {
        self.invoke(OperationKind::Get, |connector| async move {
            let filter = Filter::uid(uid);
            let found = Mutex::new(None);
            let handler = |object: ConnectorObject| {
                *found.lock() = Some(object);
                false
            };
            connector
                .search(object_class, Some(&filter), &handler, options)
                .await?;

            let mut object = found.into_inner();
            if let (Some(object), Some(names)) = (object.as_mut(), &options.attributes_to_get) {
                object.attributes.retain_names(names);
            }
            Ok(object)
        })
        .await
    }

    async fn search(
        &self,
        object_class: &str,
        filter: Option<Filter>,
        observer: SharedObserver<ConnectorObject>,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchResult> {
        let sink = observer.clone();
        let result = self
            .invoke(OperationKind::Search, |connector| async move {
                let handler = |mut object: ConnectorObject| {
                    if let Some(names) = &options.attributes_to_get {
                        object.attributes.retain_names(names);
                    }
                    sink.on_next(object);
                    true
                };
                connector
                    .search(object_class, filter.as_ref(), &handler, options)
                    .await
            })
            .await;
        finish_stream(&observer, result)
    }

    async fn sync(
        &self,
        object_class: &str,
        token: Option<SyncToken>,
        observer: SharedObserver<SyncDelta>,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<SyncToken>> {
        let sink = observer.clone();
        let result = self
            .invoke(OperationKind::Sync, |connector| async move {
                let handler = |mut delta: SyncDelta| {
                    if let (Some(object), Some(names)) =
                        (delta.object.as_mut(), &options.attributes_to_get)
                    {
                        object.attributes.retain_names(names);
                    }
                    sink.on_next(delta);
                    true
                };
                connector.sync(object_class, token, &handler, options).await
            })
            .await;
        finish_stream(&observer, result)
    }

    async fn latest_sync_token(&self, object_class: &str) -> ConnectorResult<Option<SyncToken>> {
        self.invoke(OperationKind::Sync, |connector| async move {
            connector.latest_sync_token(object_class).await
        })
        .await
    }

    async fn authenticate(
        &self,
        object_class: &str,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.invoke(OperationKind::Authenticate, |connector| async move {
            connector
                .authenticate(object_class, username, password, options)
                .await
        })
        .await
    }

    async fn resolve_username(
        &self,
        object_class: &str,
        username: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.invoke(OperationKind::ResolveUsername, |connector| async move {
            connector
                .resolve_username(object_class, username, options)
                .await
        })
        .await
    }

    async fn run_script_on_connector(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        self.invoke(OperationKind::ScriptOnConnector, |connector| async move {
            connector.run_script_on_connector(script, options).await
        })
        .await
    }

    async fn run_script_on_resource(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        self.invoke(OperationKind::ScriptOnResource, |connector| async move {
            connector.run_script_on_resource(script, options).await
        })
        .await
    }

    async fn test(&self) -> ConnectorResult<()> {
        self.invoke(OperationKind::Test, |connector| async move {
            connector.test().await
        })
        .await
    }

    async fn schema(&self) -> ConnectorResult<Schema> {
        self.invoke(OperationKind::Schema, |connector| async move {
            connector.schema().await
        })
        .await
    }

    async fn validate(&self) -> ConnectorResult<()> {
        self.touch();
        Self::bind(self.factory.as_ref(), &self.api).map(|_| ())
    }

    async fn execute_batch(
        &self,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>> {
        self.execute_batch_cancellable(tasks, observer, options, CancellationToken::new())
            .await
    }

    async fn query_batch(
        &self,
        token: BatchToken,
        observer: SharedObserver<BatchResult>,
        _options: &BatchOptions,
    ) -> ConnectorResult<Box<dyn BatchSubscription>> {
        self.touch();
        let result = if self.batch_support == BatchSupport::None {
            Err(ConnectorError::unsupported(OperationKind::Batch))
        } else {
            self.engine.query(token, observer.clone())
        };
        if let Err(e) = &result {
            observer.on_error(e.clone());
        }
        result
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.dispose().await;
        info!(connector = %self.key, "Facade disposed");
    }

    fn is_unused_for(&self, idle: Duration) -> bool {
        self.in_flight() == 0
            && self.pool.statistics().num_active == 0
            && self.last_used.lock().elapsed() >= idle
    }
}

#[async_trait]
impl TaskRunner for LocalConnectorFacade {
    async fn run_task(&self, task: BatchTask) -> ConnectorResult<BatchOutcome> {
        match task {
            BatchTask::Create {
                object_class,
                attributes,
                options,
            } => self
                .create(&object_class, attributes, &options)
                .await
                .map(|uid| BatchOutcome::Uid { uid }),
            BatchTask::Update {
                object_class,
                uid,
                update_type,
                attributes,
                options,
            } => self
                .update(&object_class, &uid, update_type, attributes, &options)
                .await
                .map(|uid| BatchOutcome::Uid { uid }),
            BatchTask::Delete {
                object_class,
                uid,
                options,
            } => self
                .delete(&object_class, &uid, &options)
                .await
                .map(|()| BatchOutcome::Empty {
                    message: format!("deleted {uid}"),
                }),
        }
    }
}

impl fmt::Debug for LocalConnectorFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalConnectorFacade")
            .field("connector", &self.key)
            .field("batch_support", &self.batch_support)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use icf_connector::prelude::*;
    use icf_rpc::CollectingObserver;

    struct Directory;

    #[async_trait]
    impl Connector for Directory {
        async fn create(
            &self,
            _object_class: &str,
            attributes: AttributeSet,
            _options: &OperationOptions,
        ) -> ConnectorResult<Uid> {
            match attributes.get_string("name") {
                Some("taken") => Err(ConnectorError::ObjectAlreadyExists {
                    identifier: "taken".to_string(),
                }),
                Some(name) => Ok(Uid::from_value(name)),
                None => Err(ConnectorError::InvalidData {
                    message: "name is required".to_string(),
                }),
            }
        }

        async fn search(
            &self,
            object_class: &str,
            filter: Option<&Filter>,
            handler: &dyn ResultsHandler<ConnectorObject>,
            _options: &OperationOptions,
        ) -> ConnectorResult<SearchResult> {
            for name in ["alice", "bob"] {
                let object = ConnectorObject::new(object_class, Uid::from_value(name))
                    .with_attributes(AttributeSet::new().with("name", name).with("mail", "x"));
                if filter.map_or(true, |f| f.matches(&object)) && !handler.handle(object) {
                    return Ok(SearchResult::stopped());
                }
            }
            Ok(SearchResult::complete())
        }

        async fn test(&self) -> ConnectorResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct DirectoryFactory;

    #[async_trait]
    impl ConnectorFactory for DirectoryFactory {
        fn key(&self) -> ConnectorKey {
            ConnectorKey::new("test.bundle", "1.0", "Directory")
        }

        fn display_name(&self) -> &str {
            "Directory"
        }

        fn configuration_schema(&self) -> ConfigurationSchema {
            ConfigurationSchema::new().property("host", PropertySpec::string().required())
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::of(&[
                OperationKind::Create,
                OperationKind::Search,
                OperationKind::Test,
            ])
        }

        async fn create(&self, _configuration: Configuration) -> ConnectorResult<Arc<dyn Connector>> {
            Ok(Arc::new(Directory))
        }
    }

    fn facade(api: ApiConfiguration) -> ConnectorResult<LocalConnectorFacade> {
        LocalConnectorFacade::new(
            Arc::new(DirectoryFactory),
            api,
            Arc::new(BatchEngine::new(BatchConfig::default())),
        )
    }

    fn collector<T: Clone + Send + 'static>() -> Arc<CollectingObserver<T, ConnectorError>> {
        Arc::new(CollectingObserver::new())
    }

    fn api() -> ApiConfiguration {
        ApiConfiguration::new(DirectoryFactory.key()).with_property("host", "ldap.example.com")
    }

    #[test]
    fn test_derived_capabilities() {
        let facade = facade(api()).unwrap();
        let capabilities = facade.capabilities();
        assert!(capabilities.supports(OperationKind::Get));
        assert!(capabilities.supports(OperationKind::Validate));
        assert!(capabilities.supports(OperationKind::Batch));
        assert!(!capabilities.supports(OperationKind::Sync));
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let err = facade(ApiConfiguration::new(DirectoryFactory.key())).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");

        let other = ConnectorKey::new("test.bundle", "1.0", "Other");
        let err = facade(ApiConfiguration::new(other)).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_undeclared_operation_is_unsupported() {
        let facade = facade(api()).unwrap();
        let err = facade.latest_sync_token("account").await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Unsupported {
                operation: OperationKind::Sync
            }
        ));
    }

    #[tokio::test]
    async fn test_get_and_search_apply_attributes_to_get() {
        let facade = facade(api()).unwrap();
        let options = OperationOptions::new().with_attributes_to_get(vec!["name".to_string()]);

        let bob = facade
            .get("account", &Uid::from_value("bob"), &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.uid.value(), "bob");
        assert!(!bob.attributes.has("mail"));

        let missing = facade
            .get("account", &Uid::from_value("carol"), &options)
            .await
            .unwrap();
        assert!(missing.is_none());

        let observer = collector::<ConnectorObject>();
        let result = facade
            .search("account", None, observer.clone(), &options)
            .await
            .unwrap();
        assert!(result.all_results_returned);
        assert_eq!(observer.len(), 2);
        assert!(observer.is_completed());
        assert!(observer.items().iter().all(|o| o.attributes.len() == 1));
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let facade = facade(api().with_timeout(OperationKind::Test, Duration::from_millis(20)))
            .unwrap();
        let err = facade.test().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::OperationTimeout {
                operation: OperationKind::Test,
                timeout_ms: 20
            }
        ));
        assert_eq!(facade.in_flight(), 0);
        assert_eq!(facade.pool_statistics().num_active, 0);
    }

    #[tokio::test]
    async fn test_sequential_batch_reports_errors_per_task() {
        let facade = facade(api()).unwrap();
        let tasks = vec![
            BatchTask::create("account", AttributeSet::new().with("name", "alice")),
            BatchTask::create("account", AttributeSet::new().with("name", "taken")),
            BatchTask::create("account", AttributeSet::new().with("name", "bob")),
        ];

        let observer = collector::<BatchResult>();
        let subscription = facade
            .execute_batch(tasks, observer.clone(), &BatchOptions::default())
            .await
            .unwrap();
        assert!(subscription.is_none());

        let results = observer.items();
        assert_eq!(results.len(), 3);
        assert!(results[1].error);
        assert_eq!(results.iter().filter(|r| r.complete).count(), 1);
        assert!(results[2].complete);
        assert!(observer.is_completed());
    }

    #[tokio::test]
    async fn test_sequential_batch_stops_on_error() {
        let facade = facade(api()).unwrap();
        let tasks = vec![
            BatchTask::create("account", AttributeSet::new().with("name", "taken")),
            BatchTask::create("account", AttributeSet::new().with("name", "bob")),
        ];

        let observer = collector::<BatchResult>();
        facade
            .execute_batch(tasks, observer.clone(), &BatchOptions::fail_on_error())
            .await
            .unwrap();

        assert_eq!(observer.len(), 1);
        assert_eq!(
            observer.error().map(|e| e.error_code()),
            Some("OBJECT_EXISTS")
        );
    }

    #[tokio::test]
    async fn test_query_batch_without_native_support() {
        let facade = facade(api()).unwrap();
        let observer = collector::<BatchResult>();
        let err = facade
            .query_batch(BatchToken::new(), observer.clone(), &BatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED");
        assert!(observer.error().is_some());
    }

    #[tokio::test]
    async fn test_unused_tracking() {
        let facade = facade(api()).unwrap();
        assert!(facade.is_unused_for(Duration::ZERO));

        let lease = facade.pool.checkout().await.unwrap();
        assert!(!facade.is_unused_for(Duration::ZERO));
        drop(lease);

        facade.touch();
        assert!(!facade.is_unused_for(Duration::from_secs(60)));
        assert!(facade.is_unused_for(Duration::ZERO));
    }
}
