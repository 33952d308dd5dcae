//! Integration test helpers for icf-framework.
//!
//! Provides an in-memory directory connector available in every batch tier,
//! configurations for it, and wiring for a connector server and client over
//! in-memory connections.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use icf_framework::config::{DistributorConfig, FrameworkConfig, ServerConfig};
use icf_framework::prelude::*;
use icf_framework::remote::RemoteMessage;
use icf_rpc::transport::duplex;
use icf_rpc::ConnectionContext;
use parking_lot::Mutex;
use serde_json::Value;

static INIT: Once = Once::new();

/// Upper bound for every wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Shared key accepted by test servers.
pub const KEY: &str = "changeit";

/// Object class whose batch tasks block until the batch is cancelled.
pub const HOLD: &str = "hold";

/// Username whose resolution never finishes in time.
pub const SLOW: &str = "slow";

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

// ============================================================================
// In-memory directory
// ============================================================================

/// Objects and counters shared by every instance of a [`DirectoryFactory`].
#[derive(Default)]
pub struct DirectoryState {
    pub objects: Mutex<BTreeMap<String, AttributeSet>>,
    pub instances_created: AtomicUsize,
    pub instances_disposed: AtomicUsize,
    pub batches_cancelled: AtomicUsize,
}

impl DirectoryState {
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    fn apply(&self, task: BatchTask) -> ConnectorResult<BatchOutcome> {
        match task {
            BatchTask::Create { attributes, .. } => {
                self.insert(attributes).map(|uid| BatchOutcome::Uid { uid })
            }
            BatchTask::Update {
                uid, attributes, ..
            } => self.replace(&uid, attributes).map(|uid| BatchOutcome::Uid { uid }),
            BatchTask::Delete { uid, .. } => self.remove(&uid).map(|()| BatchOutcome::Empty {
                message: format!("deleted {uid}"),
            }),
        }
    }

    fn insert(&self, attributes: AttributeSet) -> ConnectorResult<Uid> {
        let name = attributes
            .get_string("name")
            .ok_or_else(|| ConnectorError::InvalidData {
                message: "name is required".to_string(),
            })?
            .to_string();
        let mut objects = self.objects.lock();
        if objects.contains_key(&name) {
            return Err(ConnectorError::ObjectAlreadyExists { identifier: name });
        }
        objects.insert(name.clone(), attributes);
        Ok(Uid::from_value(name))
    }

    fn replace(&self, uid: &Uid, attributes: AttributeSet) -> ConnectorResult<Uid> {
        let mut objects = self.objects.lock();
        let entry = objects
            .get_mut(uid.value())
            .ok_or_else(|| ConnectorError::ObjectNotFound {
                identifier: uid.value().to_string(),
            })?;
        for (name, value) in attributes.iter() {
            entry.set(name.clone(), value.clone());
        }
        Ok(uid.clone())
    }

    fn remove(&self, uid: &Uid) -> ConnectorResult<()> {
        self.objects
            .lock()
            .remove(uid.value())
            .map(|_| ())
            .ok_or_else(|| ConnectorError::ObjectNotFound {
                identifier: uid.value().to_string(),
            })
    }

    fn snapshot(&self, object_class: &str) -> Vec<ConnectorObject> {
        self.objects
            .lock()
            .iter()
            .map(|(name, attributes)| {
                ConnectorObject::new(object_class, Uid::from_value(name.clone()))
                    .with_attributes(attributes.clone())
            })
            .collect()
    }
}

pub struct DirectoryConnector {
    state: Arc<DirectoryState>,
    support: BatchSupport,
}

impl DirectoryConnector {
    fn run_batch(state: &DirectoryState, tasks: Vec<BatchTask>, sink: &BatchSink) {
        let total = tasks.len();
        for (index, task) in tasks.into_iter().enumerate() {
            let result = match state.apply(task) {
                Ok(outcome) => BatchResult::success(index.to_string(), outcome),
                Err(e) => BatchResult::failure(index.to_string(), &e),
            };
            let result = if index + 1 == total {
                result.completing()
            } else {
                result
            };
            if !sink.send(result) {
                break;
            }
        }
    }

    async fn run_background(state: Arc<DirectoryState>, tasks: Vec<BatchTask>, sink: BatchSink) {
        let cancel = sink.cancellation_token();
        if tasks.iter().any(|task| task.object_class() == HOLD) {
            cancel.cancelled().await;
            state.batches_cancelled.fetch_add(1, Ordering::SeqCst);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Self::run_batch(&state, tasks, &sink);
    }
}

#[async_trait]
impl Connector for DirectoryConnector {
    async fn dispose(&self) {
        self.state.instances_disposed.fetch_add(1, Ordering::SeqCst);
    }

    async fn test(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn schema(&self) -> ConnectorResult<Schema> {
        Ok(Schema::default())
    }

    async fn create(
        &self,
        _object_class: &str,
        attributes: AttributeSet,
        _options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.state.insert(attributes)
    }

    async fn update(
        &self,
        _object_class: &str,
        uid: &Uid,
        _update_type: UpdateType,
        attributes: AttributeSet,
        _options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.state.replace(uid, attributes)
    }

    async fn delete(
        &self,
        _object_class: &str,
        uid: &Uid,
        _options: &OperationOptions,
    ) -> ConnectorResult<()> {
        self.state.remove(uid)
    }

    async fn search(
        &self,
        object_class: &str,
        filter: Option<&Filter>,
        handler: &dyn ResultsHandler<ConnectorObject>,
        _options: &OperationOptions,
    ) -> ConnectorResult<SearchResult> {
        for object in self.state.snapshot(object_class) {
            if filter.map_or(true, |filter| filter.matches(&object)) && !handler.handle(object) {
                return Ok(SearchResult::stopped());
            }
        }
        Ok(SearchResult::complete())
    }

    async fn sync(
        &self,
        object_class: &str,
        token: Option<SyncToken>,
        handler: &dyn ResultsHandler<SyncDelta>,
        _options: &OperationOptions,
    ) -> ConnectorResult<Option<SyncToken>> {
        let from = token.and_then(|token| token.value().as_u64()).unwrap_or(0);
        let objects = self.state.snapshot(object_class);
        let mut position = from;
        for object in objects.into_iter().skip(from as usize) {
            position += 1;
            let delta = SyncDelta {
                token: SyncToken::new(position),
                delta_type: SyncDeltaType::CreateOrUpdate,
                uid: object.uid.clone(),
                object: Some(object),
            };
            if !handler.handle(delta) {
                break;
            }
        }
        Ok(Some(SyncToken::new(position)))
    }

    async fn latest_sync_token(&self, _object_class: &str) -> ConnectorResult<Option<SyncToken>> {
        Ok(Some(SyncToken::new(self.state.len() as u64)))
    }

    async fn authenticate(
        &self,
        _object_class: &str,
        username: &str,
        password: &str,
        _options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        let known = self.state.objects.lock().contains_key(username);
        if known && password == "secret" {
            Ok(Uid::from_value(username))
        } else {
            Err(ConnectorError::AuthenticationFailed)
        }
    }

    async fn resolve_username(
        &self,
        _object_class: &str,
        username: &str,
        _options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        if username == SLOW {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.state.objects.lock().contains_key(username) {
            Ok(Uid::from_value(username))
        } else {
            Err(ConnectorError::ObjectNotFound {
                identifier: username.to_string(),
            })
        }
    }

    async fn run_script_on_connector(
        &self,
        script: &ScriptContext,
        _options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        Ok(serde_json::json!({
            "language": script.language,
            "length": script.text.len(),
        }))
    }

    async fn execute_batch(
        &self,
        tasks: Vec<BatchTask>,
        sink: BatchSink,
        _options: &BatchOptions,
    ) -> ConnectorResult<Option<BatchToken>> {
        match self.support {
            BatchSupport::Synchronous => {
                Self::run_batch(&self.state, tasks, &sink);
                Ok(None)
            }
            BatchSupport::Token | BatchSupport::Callback => {
                tokio::spawn(Self::run_background(self.state.clone(), tasks, sink));
                Ok(Some(BatchToken::new()))
            }
            BatchSupport::None => Err(ConnectorError::unsupported(OperationKind::Batch)),
        }
    }
}

/// Factory for [`DirectoryConnector`] in one batch tier.
pub struct DirectoryFactory {
    pub state: Arc<DirectoryState>,
    support: BatchSupport,
    concurrent_safe: bool,
}

impl DirectoryFactory {
    pub fn new(support: BatchSupport) -> Self {
        Self {
            state: Arc::new(DirectoryState::default()),
            support,
            concurrent_safe: false,
        }
    }

    /// Share one instance between all callers.
    pub fn shared(mut self) -> Self {
        self.concurrent_safe = true;
        self
    }
}

/// Key of the directory connector in a batch tier.
pub fn directory_key(support: BatchSupport) -> ConnectorKey {
    ConnectorKey::new("test.directory", "1.0", format!("Directory-{support}"))
}

/// Configuration of the directory connector in a batch tier.
pub fn directory_api(support: BatchSupport) -> ApiConfiguration {
    ApiConfiguration::new(directory_key(support)).with_property("host", "directory.test")
}

#[async_trait]
impl ConnectorFactory for DirectoryFactory {
    fn key(&self) -> ConnectorKey {
        directory_key(self.support)
    }

    fn display_name(&self) -> &str {
        "Directory"
    }

    fn configuration_schema(&self) -> ConfigurationSchema {
        ConfigurationSchema::new()
            .property("host", PropertySpec::string().required())
            .property("password", PropertySpec::string().confidential())
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
            OperationKind::Search,
            OperationKind::Sync,
            OperationKind::Authenticate,
            OperationKind::ResolveUsername,
            OperationKind::ScriptOnConnector,
            OperationKind::Test,
            OperationKind::Schema,
        ])
    }

    fn batch_support(&self) -> BatchSupport {
        self.support
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent_safe
    }

    async fn create(&self, _configuration: Configuration) -> ConnectorResult<Arc<dyn Connector>> {
        self.state.instances_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(DirectoryConnector {
            state: self.state.clone(),
            support: self.support,
        }))
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Tasks creating `count` accounts named `user0`, `user1`, ...
pub fn create_tasks(count: usize) -> Vec<BatchTask> {
    (0..count)
        .map(|i| BatchTask::create("account", AttributeSet::new().with("name", format!("user{i}"))))
        .collect()
}

pub fn batch_collector() -> Arc<CollectingObserver<BatchResult, ConnectorError>> {
    Arc::new(CollectingObserver::new())
}

pub fn object_collector() -> Arc<CollectingObserver<ConnectorObject, ConnectorError>> {
    Arc::new(CollectingObserver::new())
}

/// Framework configuration for tests: a known key, short timeouts.
pub fn test_config() -> FrameworkConfig {
    FrameworkConfig {
        server: ServerConfig::default()
            .with_key(KEY)
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0),
        distributor: DistributorConfig::default().with_request_timeout(WAIT),
        ..FrameworkConfig::default()
    }
}

/// A framework with a directory connector installed in every tier.
pub struct Installed {
    pub framework: Arc<ConnectorFramework>,
    pub states: BTreeMap<String, Arc<DirectoryState>>,
}

impl Installed {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FrameworkConfig) -> Self {
        init_test_logging();
        let framework = Arc::new(ConnectorFramework::new(config).unwrap());
        let mut states = BTreeMap::new();
        for support in [
            BatchSupport::None,
            BatchSupport::Synchronous,
            BatchSupport::Token,
            BatchSupport::Callback,
        ] {
            let factory = DirectoryFactory::new(support);
            states.insert(support.to_string(), factory.state.clone());
            framework.register(Arc::new(factory));
        }
        Self { framework, states }
    }

    pub fn state(&self, support: BatchSupport) -> Arc<DirectoryState> {
        self.states[&support.to_string()].clone()
    }

    /// The cached local facade of a tier.
    pub async fn facade(&self, support: BatchSupport) -> Arc<LocalConnectorFacade> {
        self.framework
            .new_instance(&directory_api(support))
            .await
            .unwrap()
    }

    /// Connect a client to the framework's server over an in-memory pair.
    pub async fn connect(&self, key: &str) -> ConnectorResult<RemoteConnectorClient> {
        let (client_end, server_end) = duplex::<RemoteMessage>();
        let server = self.framework.server().clone();
        let accept = tokio::spawn(async move { server.accept_connection(server_end).await });

        let connection: Arc<dyn ConnectionContext<RemoteMessage>> = client_end;
        let client = RemoteConnectorClient::from_connection(
            connection,
            key,
            DistributorConfig::default().with_request_timeout(WAIT),
        )
        .await;
        let _ = accept.await;
        client
    }
}
