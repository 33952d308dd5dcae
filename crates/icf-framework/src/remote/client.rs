//! Remote connector client
//!
//! [`RemoteConnectorClient`] dials a connector server, performs the
//! handshake and hands out [`RemoteConnectorFacade`]s that forward every
//! operation over the shared connection group.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};
use uuid::Uuid;

use icf_connector::{
    ApiConfiguration, AttributeSet, BatchOptions, BatchResult, BatchSupport, BatchTask,
    BatchToken, CapabilitySet, ConnectorError, ConnectorKey, ConnectorObject, ConnectorResult,
    Filter, OperationKind, OperationOptions, Schema, ScriptContext, SearchResult, SyncDelta,
    SyncToken, Uid, UpdateType,
};
use icf_rpc::{
    ConnectionContext, ConnectionGroup, Frame, JsonFrameConnection, LocalRequest, Observer,
    Promise, RejectingHandler, RemoteFault, RequestDistributor, RpcError, Subscription,
};

use crate::batch::BatchSubscription;
use crate::config::DistributorConfig;
use crate::facade::{facade_capabilities, finish_stream, ConnectorFacade, SharedObserver};
use crate::registry::ConnectorInfo;
use crate::remote::messages::{
    GuardedString, HelloMessage, Operation, OperationFactory, OperationResponse, RemoteMessage,
};

type OperationHandle = Arc<LocalRequest<RemoteMessage, OperationFactory>>;

fn fault_error(fault: RemoteFault) -> ConnectorError {
    ConnectorError::from(RpcError::from(fault))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Client
// ============================================================================

/// Session with one connector server.
pub struct RemoteConnectorClient {
    group: Arc<ConnectionGroup<RemoteMessage>>,
    distributor: RequestDistributor<RemoteMessage>,
    config: DistributorConfig,
    key: GuardedString,
    session: Uuid,
    server_start_time: DateTime<Utc>,
    connectors: Vec<ConnectorInfo>,
}

impl RemoteConnectorClient {
    /// Dial `addr` over TCP and open a session with `key`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        key: &str,
        config: DistributorConfig,
    ) -> ConnectorResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            ConnectorError::connection_failed_with_source("cannot reach connector server", e)
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "TCP_NODELAY not set");
        }
        let connection = Arc::new(JsonFrameConnection::<RemoteMessage>::new(stream));
        Self::from_connection(connection, key, config).await
    }

    /// Open a session over an established connection.
    pub async fn from_connection(
        connection: Arc<dyn ConnectionContext<RemoteMessage>>,
        key: &str,
        config: DistributorConfig,
    ) -> ConnectorResult<Self> {
        let key = GuardedString::new(key);
        let session = Uuid::new_v4();
        let (server_start_time, connectors) =
            handshake(&connection, &key, session, config.request_timeout()).await?;

        let group = ConnectionGroup::new(
            format!("client-{session}"),
            config.group_config(),
            Arc::new(RejectingHandler),
        );
        group.attach(connection)?;
        let distributor = RequestDistributor::new(group.clone());

        info!(
            session = %session,
            connectors = connectors.len(),
            server_start_time = %server_start_time,
            "Connected to connector server"
        );
        Ok(Self {
            group,
            distributor,
            config,
            key,
            session,
            server_start_time,
            connectors,
        })
    }

    /// Add another connection to this session.
    pub async fn attach_connection(
        &self,
        connection: Arc<dyn ConnectionContext<RemoteMessage>>,
    ) -> ConnectorResult<()> {
        handshake(
            &connection,
            &self.key,
            self.session,
            self.config.request_timeout(),
        )
        .await?;
        self.group.attach(connection)?;
        Ok(())
    }

    /// Build a facade for a connector installed on the server.
    pub fn new_facade(&self, api: ApiConfiguration) -> ConnectorResult<Arc<RemoteConnectorFacade>> {
        let info = self
            .connectors
            .iter()
            .find(|info| info.key == api.connector)
            .ok_or_else(|| ConnectorError::ConnectorNotFound {
                key: api.connector.clone(),
            })?;
        Ok(Arc::new(RemoteConnectorFacade::new(
            info,
            api,
            self.distributor.clone(),
            self.config.request_timeout(),
        )))
    }

    /// Connectors the server reported during the handshake.
    pub fn connectors(&self) -> &[ConnectorInfo] {
        &self.connectors
    }

    pub fn server_start_time(&self) -> DateTime<Utc> {
        self.server_start_time
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Connection group carrying this session.
    pub fn group(&self) -> &Arc<ConnectionGroup<RemoteMessage>> {
        &self.group
    }

    /// Close every connection; pending requests fail.
    pub async fn close(&self) {
        self.group.close().await;
        info!(session = %self.session, "Connector server session closed");
    }
}

impl fmt::Debug for RemoteConnectorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnectorClient")
            .field("session", &self.session)
            .field("state", &self.group.state())
            .field("connectors", &self.connectors.len())
            .finish()
    }
}

async fn handshake(
    connection: &Arc<dyn ConnectionContext<RemoteMessage>>,
    key: &GuardedString,
    session: Uuid,
    limit: Duration,
) -> ConnectorResult<(DateTime<Utc>, Vec<ConnectorInfo>)> {
    let hello = HelloMessage::Request {
        key: key.clone(),
        session,
    };
    connection
        .write(&Frame::Hello {
            payload: RemoteMessage::Hello(hello),
        })
        .await?;

    let reply = tokio::time::timeout(limit, connection.read())
        .await
        .map_err(|_| ConnectorError::ConnectionTimeout {
            timeout_secs: limit.as_secs(),
        })??;

    match reply {
        Some(Frame::Hello {
            payload:
                RemoteMessage::Hello(HelloMessage::Response {
                    server_start_time,
                    connectors,
                }),
        }) => Ok((server_start_time, connectors)),
        Some(Frame::Hello {
            payload: RemoteMessage::Hello(HelloMessage::Rejected { reason }),
        }) => {
            warn!(session = %session, reason = %reason, "Connector server rejected the key");
            connection.close().await;
            Err(ConnectorError::AuthenticationFailed)
        }
        Some(other) => {
            connection.close().await;
            Err(ConnectorError::connection_failed(format!(
                "unexpected {} frame during handshake",
                other.kind()
            )))
        }
        None => Err(ConnectorError::connection_failed(
            "connection closed during handshake",
        )),
    }
}

// ============================================================================
// Observer adapters
// ============================================================================

/// Forwards the streamed parts of one response kind and ignores the rest.
struct PartAdapter<T> {
    target: SharedObserver<T>,
    extract: fn(OperationResponse) -> Option<T>,
}

impl<T> Observer<OperationResponse> for PartAdapter<T> {
    fn on_next(&self, value: OperationResponse) {
        if let Some(item) = (self.extract)(value) {
            self.target.on_next(item);
        }
    }

    fn on_error(&self, _error: RpcError) {}

    fn on_completed(&self) {}
}

/// Forwards batch results and, once the batch runs detached from the
/// caller, its terminal event.
struct BatchAdapter {
    target: SharedObserver<BatchResult>,
    started: Promise<(BatchToken, BatchSupport)>,
    detached: AtomicBool,
}

impl BatchAdapter {
    fn new(target: SharedObserver<BatchResult>) -> Self {
        Self {
            target,
            started: Promise::new(),
            detached: AtomicBool::new(false),
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl Observer<OperationResponse> for BatchAdapter {
    fn on_next(&self, value: OperationResponse) {
        match value {
            OperationResponse::BatchResult(result) => self.target.on_next(result),
            OperationResponse::BatchStarted { token, support } => {
                self.detached.store(true, Ordering::Release);
                self.started.resolve(Ok((token, support)));
            }
            OperationResponse::Batch {
                finished: true,
                failure,
                ..
            } if self.is_detached() => match failure {
                Some(fault) => self.target.on_error(fault_error(fault)),
                None => self.target.on_completed(),
            },
            _ => {}
        }
    }

    fn on_error(&self, error: RpcError) {
        if self.is_detached() {
            self.target.on_error(error.into());
        }
    }

    fn on_completed(&self) {}
}

// ============================================================================
// Batch subscription
// ============================================================================

enum RemoteBatchState {
    /// The terminal event was delivered.
    Settled,
    /// Results wait on the server for `query_batch`.
    Polled,
    /// Results keep streaming over the request.
    Streaming(OperationHandle),
}

/// Subscription on a batch running on a connector server.
pub struct RemoteBatchSubscription {
    token: Option<BatchToken>,
    support: BatchSupport,
    state: RemoteBatchState,
}

impl Subscription for RemoteBatchSubscription {
    fn unsubscribe(&self) {
        if let RemoteBatchState::Streaming(request) = &self.state {
            if request.cancel() {
                debug!(request_id = %request.id(), "Remote batch cancelled");
            }
        }
    }

    fn is_unsubscribed(&self) -> bool {
        match &self.state {
            RemoteBatchState::Settled => true,
            RemoteBatchState::Polled => false,
            RemoteBatchState::Streaming(request) => request.is_done(),
        }
    }
}

impl BatchSubscription for RemoteBatchSubscription {
    fn token(&self) -> Option<BatchToken> {
        self.token
    }

    fn support(&self) -> BatchSupport {
        self.support
    }
}

impl fmt::Debug for RemoteBatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBatchSubscription")
            .field("support", &self.support)
            .field("token", &self.token)
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

// ============================================================================
// Remote facade
// ============================================================================

/// Facade forwarding operations to a connector server.
pub struct RemoteConnectorFacade {
    key: ConnectorKey,
    api: ApiConfiguration,
    capabilities: CapabilitySet,
    batch_support: BatchSupport,
    distributor: RequestDistributor<RemoteMessage>,
    request_timeout: Duration,
    in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
}

/// Counts one remote call in flight for as long as it lives.
struct InFlight<'a>(&'a RemoteConnectorFacade);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
        *self.0.last_used.lock() = Instant::now();
    }
}

impl RemoteConnectorFacade {
    fn new(
        info: &ConnectorInfo,
        api: ApiConfiguration,
        distributor: RequestDistributor<RemoteMessage>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            key: info.key.clone(),
            api,
            capabilities: facade_capabilities(info.capabilities.clone(), info.batch_support),
            batch_support: info.batch_support,
            distributor,
            request_timeout,
            in_flight: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Native batch tier of the remote connector.
    pub fn batch_support(&self) -> BatchSupport {
        self.batch_support
    }

    pub fn api_configuration(&self) -> &ApiConfiguration {
        &self.api
    }

    fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        *self.last_used.lock() = Instant::now();
        InFlight(self)
    }

    fn ensure_supported(&self, operation: OperationKind) -> ConnectorResult<()> {
        if self.capabilities.supports(operation) {
            Ok(())
        } else {
            Err(ConnectorError::unsupported(operation))
        }
    }

    fn timeout_for(&self, operation: OperationKind) -> Duration {
        self.api
            .timeout_for(operation)
            .unwrap_or(self.request_timeout)
    }

    async fn submit(
        &self,
        operation: Operation,
        observer: Option<Arc<dyn Observer<OperationResponse>>>,
    ) -> ConnectorResult<OperationHandle> {
        let factory = OperationFactory::new(self.api.clone(), operation);
        let submitted = match observer {
            Some(observer) => self.distributor.try_submit_observed(factory, observer).await,
            None => self.distributor.try_submit(factory).await,
        };
        submitted.ok_or_else(|| {
            ConnectorError::connection_failed(format!(
                "no connection to the connector server for {}",
                self.key
            ))
        })
    }

    /// Wait for the final response, cancelling the request on timeout.
    async fn settle(
        &self,
        request: &OperationHandle,
        operation: OperationKind,
    ) -> ConnectorResult<OperationResponse> {
        let limit = self.timeout_for(operation);
        match request.wait_timeout(limit).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_timeout() => {
                request.cancel();
                warn!(connector = %self.key, operation = %operation, request_id = %request.id(), "Remote operation timed out");
                Err(ConnectorError::OperationTimeout {
                    operation,
                    timeout_ms: millis(limit),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn call_observed(
        &self,
        operation: Operation,
        observer: Option<Arc<dyn Observer<OperationResponse>>>,
    ) -> ConnectorResult<OperationResponse> {
        let kind = operation.kind();
        self.ensure_supported(kind)?;
        let _guard = self.begin();
        let request = self.submit(operation, observer).await?;
        let result = self.settle(&request, kind).await;
        if let Err(e) = &result {
            debug!(connector = %self.key, operation = %kind, error = %e, "Remote operation failed");
        }
        result
    }

    async fn call(&self, operation: Operation) -> ConnectorResult<OperationResponse> {
        self.call_observed(operation, None).await
    }

    /// Submit a batch request and wait until it finished or went detached.
    async fn run_batch(
        &self,
        operation: Operation,
        observer: &SharedObserver<BatchResult>,
    ) -> ConnectorResult<RemoteBatchSubscription> {
        self.ensure_supported(OperationKind::Batch)?;
        let _guard = self.begin();
        let adapter = Arc::new(BatchAdapter::new(observer.clone()));
        let forward: Arc<dyn Observer<OperationResponse>> = adapter.clone();
        let request = self.submit(operation, Some(forward)).await?;

        let started = adapter.started.clone();
        tokio::select! {
            biased;
            detached = started.wait() => {
                let (token, support) = detached?;
                debug!(token = %token, support = %support, "Remote batch streaming");
                Ok(RemoteBatchSubscription {
                    token: Some(token),
                    support,
                    state: RemoteBatchState::Streaming(request),
                })
            }
            response = self.settle(&request, OperationKind::Batch) => {
                match response? {
                    OperationResponse::Batch {
                        token,
                        support,
                        finished,
                        failure,
                    } => {
                        let state = if finished {
                            match failure {
                                Some(fault) => observer.on_error(fault_error(fault)),
                                None => observer.on_completed(),
                            }
                            RemoteBatchState::Settled
                        } else {
                            RemoteBatchState::Polled
                        };
                        Ok(RemoteBatchSubscription { token, support, state })
                    }
                    other => Err(other.unexpected("batch")),
                }
            }
        }
    }
}

#[async_trait]
impl ConnectorFacade for RemoteConnectorFacade {
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
        self.call(Operation::Create {
            object_class: object_class.to_string(),
            attributes,
            options: options.clone(),
        })
        .await?
        .expect_uid()
    }

    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.call(Operation::Update {
            object_class: object_class.to_string(),
            uid: uid.clone(),
            update_type,
            attributes,
            options: options.clone(),
        })
        .await?
        .expect_uid()
    }

    async fn delete(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()> {
        self.call(Operation::Delete {
            object_class: object_class.to_string(),
            uid: uid.clone(),
            options: options.clone(),
        })
        .await?
        .expect_empty()
    }

    async fn get(
        &self,
        object_class: &str,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<ConnectorObject>> {
        self.call(Operation::Get {
            object_class: object_class.to_string(),
            uid: uid.clone(),
            options: options.clone(),
        })
        .await?
        .expect_maybe_object()
    }

    async fn search(
        &self,
        object_class: &str,
        filter: Option<Filter>,
        observer: SharedObserver<ConnectorObject>,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchResult> {
        let adapter: Arc<dyn Observer<OperationResponse>> = Arc::new(PartAdapter {
            target: observer.clone(),
            extract: |response| match response {
                OperationResponse::Object(object) => Some(object),
                _ => None,
            },
        });
        let operation = Operation::Search {
            object_class: object_class.to_string(),
            filter,
            options: options.clone(),
        };
        let result = match self.call_observed(operation, Some(adapter)).await {
            Ok(response) => response.expect_search(),
            Err(e) => Err(e),
        };
        finish_stream(&observer, result)
    }

    async fn sync(
        &self,
        object_class: &str,
        token: Option<SyncToken>,
        observer: SharedObserver<SyncDelta>,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<SyncToken>> {
        let adapter: Arc<dyn Observer<OperationResponse>> = Arc::new(PartAdapter {
            target: observer.clone(),
            extract: |response| match response {
                OperationResponse::Delta(delta) => Some(delta),
                _ => None,
            },
        });
        let operation = Operation::Sync {
            object_class: object_class.to_string(),
            token,
            options: options.clone(),
        };
        let result = match self.call_observed(operation, Some(adapter)).await {
            Ok(response) => response.expect_sync_token(),
            Err(e) => Err(e),
        };
        finish_stream(&observer, result)
    }

    async fn latest_sync_token(&self, object_class: &str) -> ConnectorResult<Option<SyncToken>> {
        self.call(Operation::LatestSyncToken {
            object_class: object_class.to_string(),
        })
        .await?
        .expect_sync_token()
    }

    async fn authenticate(
        &self,
        object_class: &str,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.call(Operation::Authenticate {
            object_class: object_class.to_string(),
            username: username.to_string(),
            password: GuardedString::new(password),
            options: options.clone(),
        })
        .await?
        .expect_uid()
    }

    async fn resolve_username(
        &self,
        object_class: &str,
        username: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.call(Operation::ResolveUsername {
            object_class: object_class.to_string(),
            username: username.to_string(),
            options: options.clone(),
        })
        .await?
        .expect_uid()
    }

    async fn run_script_on_connector(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        self.call(Operation::RunScriptOnConnector {
            script: script.clone(),
            options: options.clone(),
        })
        .await?
        .expect_script_result()
    }

    async fn run_script_on_resource(
        &self,
        script: &ScriptContext,
        options: &OperationOptions,
    ) -> ConnectorResult<Value> {
        self.call(Operation::RunScriptOnResource {
            script: script.clone(),
            options: options.clone(),
        })
        .await?
        .expect_script_result()
    }

    async fn test(&self) -> ConnectorResult<()> {
        self.call(Operation::Test).await?.expect_empty()
    }

    async fn schema(&self) -> ConnectorResult<Schema> {
        self.call(Operation::Schema).await?.expect_schema()
    }

    async fn validate(&self) -> ConnectorResult<()> {
        self.call(Operation::Validate).await?.expect_empty()
    }

    async fn execute_batch(
        &self,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>> {
        let operation = Operation::ExecuteBatch {
            tasks,
            options: options.clone(),
        };
        match self.run_batch(operation, &observer).await {
            Ok(subscription) => {
                if subscription.token.is_none() && subscription.support == BatchSupport::None {
                    Ok(None)
                } else {
                    Ok(Some(Box::new(subscription)))
                }
            }
            Err(e) => {
                observer.on_error(e.clone());
                Err(e)
            }
        }
    }

    async fn query_batch(
        &self,
        token: BatchToken,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
    ) -> ConnectorResult<Box<dyn BatchSubscription>> {
        let operation = Operation::QueryBatch {
            token,
            options: options.clone(),
        };
        match self.run_batch(operation, &observer).await {
            Ok(subscription) => Ok(Box::new(subscription)),
            Err(e) => {
                observer.on_error(e.clone());
                Err(e)
            }
        }
    }

    async fn dispose(&self) {
        debug!(connector = %self.key, "Remote facade disposed");
    }

    fn is_unused_for(&self, idle: Duration) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0 && self.last_used.lock().elapsed() >= idle
    }
}

impl fmt::Debug for RemoteConnectorFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnectorFacade")
            .field("connector", &self.key)
            .field("batch_support", &self.batch_support)
            .field("operational", &self.distributor.is_operational())
            .finish()
    }
}
