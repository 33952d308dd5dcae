//! Server-side operation dispatch
//!
//! Runs incoming operation requests against facades from the
//! [`FacadeCache`] and answers through the RPC request. Streamed items are
//! sent as response parts, in order, before the terminal value.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use icf_connector::{BatchSupport, BatchToken, ConnectorError, ConnectorResult};
use icf_rpc::{Observer, RemoteFault, RemoteRequest, RequestHandler, Termination};

use crate::batch::BatchSubscription;
use crate::cache::FacadeCache;
use crate::facade::{ConnectorFacade, LocalConnectorFacade, SharedObserver};
use crate::remote::messages::{Operation, OperationRequest, OperationResponse, RemoteMessage};

type Request = Arc<RemoteRequest<RemoteMessage>>;

// ============================================================================
// Streaming bridge
// ============================================================================

enum StreamEvent<T> {
    Next(T),
    Failed(ConnectorError),
    Completed,
}

/// Observer forwarding facade events to a pump task.
struct ChannelObserver<T> {
    events: mpsc::UnboundedSender<StreamEvent<T>>,
}

impl<T: Send> Observer<T, ConnectorError> for ChannelObserver<T> {
    fn on_next(&self, value: T) {
        let _ = self.events.send(StreamEvent::Next(value));
    }

    fn on_error(&self, error: ConnectorError) {
        let _ = self.events.send(StreamEvent::Failed(error));
    }

    fn on_completed(&self) {
        let _ = self.events.send(StreamEvent::Completed);
    }
}

/// Start streaming events as response parts of `request`.
///
/// The pump ends at the terminal event, when every observer clone is
/// dropped, or when the request stops accepting parts. It resolves to the
/// terminal event, if one was seen.
fn stream_parts<T: Send + 'static>(
    request: &Request,
    wrap: fn(T) -> OperationResponse,
) -> (SharedObserver<T>, Pump) {
    let (events, mut receiver) = mpsc::unbounded_channel();
    let request = request.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                StreamEvent::Next(item) => {
                    if let Err(e) = request.send_part(RemoteMessage::Response(wrap(item))).await {
                        debug!(request_id = %request.id(), error = %e, "Streaming stopped");
                        return None;
                    }
                }
                StreamEvent::Failed(e) => return Some(Termination::Failed(e)),
                StreamEvent::Completed => return Some(Termination::Completed),
            }
        }
        None
    });
    (Arc::new(ChannelObserver { events }), pump)
}

type Pump = JoinHandle<Option<Termination<ConnectorError>>>;

async fn finished(pump: Pump) -> Option<Termination<ConnectorError>> {
    pump.await.ok().flatten()
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = ConnectorResult<T>>,
) -> ConnectorResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
        result = work => result,
    }
}

fn batch_response(
    token: Option<BatchToken>,
    support: BatchSupport,
    termination: Option<Termination<ConnectorError>>,
) -> OperationResponse {
    let failure = match termination {
        Some(Termination::Failed(e)) => Some(e.to_fault()),
        _ => None,
    };
    OperationResponse::Batch {
        token,
        support,
        finished: true,
        failure,
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Request handler of a connector server.
pub struct OperationDispatcher {
    cache: Arc<FacadeCache>,
}

impl OperationDispatcher {
    pub fn new(cache: Arc<FacadeCache>) -> Self {
        Self { cache }
    }

    async fn execute(
        &self,
        request: &Request,
        message: OperationRequest,
    ) -> ConnectorResult<OperationResponse> {
        let facade = self.cache.new_instance(&message.configuration).await?;
        let cancel = request.cancellation_token();

        match message.operation {
            Operation::Create {
                object_class,
                attributes,
                options,
            } => until_cancelled(&cancel, facade.create(&object_class, attributes, &options))
                .await
                .map(OperationResponse::Uid),
            Operation::Update {
                object_class,
                uid,
                update_type,
                attributes,
                options,
            } => until_cancelled(
                &cancel,
                facade.update(&object_class, &uid, update_type, attributes, &options),
            )
            .await
            .map(OperationResponse::Uid),
            Operation::Delete {
                object_class,
                uid,
                options,
            } => until_cancelled(&cancel, facade.delete(&object_class, &uid, &options))
                .await
                .map(|()| OperationResponse::Empty),
            Operation::Get {
                object_class,
                uid,
                options,
            } => until_cancelled(&cancel, facade.get(&object_class, &uid, &options))
                .await
                .map(OperationResponse::MaybeObject),
            Operation::Search {
                object_class,
                filter,
                options,
            } => {
                let (observer, pump) = stream_parts(request, OperationResponse::Object);
                let result = until_cancelled(
                    &cancel,
                    facade.search(&object_class, filter, observer, &options),
                )
                .await;
                finished(pump).await;
                result.map(OperationResponse::Search)
            }
            Operation::Sync {
                object_class,
                token,
                options,
            } => {
                let (observer, pump) = stream_parts(request, OperationResponse::Delta);
                let result = until_cancelled(
                    &cancel,
                    facade.sync(&object_class, token, observer, &options),
                )
                .await;
                finished(pump).await;
                result.map(OperationResponse::SyncToken)
            }
            Operation::LatestSyncToken { object_class } => {
                until_cancelled(&cancel, facade.latest_sync_token(&object_class))
                    .await
                    .map(OperationResponse::SyncToken)
            }
            Operation::Authenticate {
                object_class,
                username,
                password,
                options,
            } => until_cancelled(
                &cancel,
                facade.authenticate(&object_class, &username, password.expose(), &options),
            )
            .await
            .map(OperationResponse::Uid),
            Operation::ResolveUsername {
                object_class,
                username,
                options,
            } => until_cancelled(
                &cancel,
                facade.resolve_username(&object_class, &username, &options),
            )
            .await
            .map(OperationResponse::Uid),
            Operation::RunScriptOnConnector { script, options } => {
                until_cancelled(&cancel, facade.run_script_on_connector(&script, &options))
                    .await
                    .map(OperationResponse::ScriptResult)
            }
            Operation::RunScriptOnResource { script, options } => {
                until_cancelled(&cancel, facade.run_script_on_resource(&script, &options))
                    .await
                    .map(OperationResponse::ScriptResult)
            }
            Operation::Test => until_cancelled(&cancel, facade.test())
                .await
                .map(|()| OperationResponse::Empty),
            Operation::Schema => until_cancelled(&cancel, facade.schema())
                .await
                .map(OperationResponse::Schema),
            Operation::Validate => facade.validate().await.map(|()| OperationResponse::Empty),
            Operation::ExecuteBatch { tasks, options } => {
                let (observer, pump) = stream_parts(request, OperationResponse::BatchResult);
                let started = facade
                    .execute_batch_cancellable(tasks, observer, &options, cancel.clone())
                    .await;
                self.follow_batch(request, &facade, started, pump).await
            }
            Operation::QueryBatch { token, options } => {
                let (observer, pump) = stream_parts(request, OperationResponse::BatchResult);
                let resumed = facade.query_batch(token, observer, &options).await.map(Some);
                self.follow_batch(request, &facade, resumed, pump).await
            }
        }
    }

    /// Answer a batch request once its subscription is known.
    ///
    /// Finished and token batches are answered right away. A running
    /// callback batch is announced with a `BatchStarted` part and answered
    /// once its terminal event has been streamed.
    async fn follow_batch(
        &self,
        request: &Request,
        facade: &LocalConnectorFacade,
        subscription: ConnectorResult<Option<Box<dyn BatchSubscription>>>,
        mut pump: Pump,
    ) -> ConnectorResult<OperationResponse> {
        let support = facade.batch_support();
        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                finished(pump).await;
                return Err(e);
            }
        };

        let Some(subscription) = subscription else {
            return Ok(batch_response(None, support, finished(pump).await));
        };
        let Some(token) = subscription.token() else {
            return Ok(batch_response(None, support, finished(pump).await));
        };

        if subscription.support() != BatchSupport::Callback {
            let termination = finished(pump).await;
            let done = subscription.is_unsubscribed();
            return Ok(if done {
                batch_response(Some(token), support, termination)
            } else {
                OperationResponse::Batch {
                    token: Some(token),
                    support,
                    finished: false,
                    failure: None,
                }
            });
        }

        let announce = OperationResponse::BatchStarted { token, support };
        request
            .send_part(RemoteMessage::Response(announce))
            .await
            .map_err(ConnectorError::from)?;

        let cancel = request.cancellation_token();
        let termination = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(token = %token, "Batch request cancelled by peer");
                subscription.unsubscribe();
                finished(pump).await;
                return Err(ConnectorError::Cancelled);
            }
            termination = &mut pump => termination.ok().flatten(),
        };
        Ok(batch_response(Some(token), support, termination))
    }
}

#[async_trait]
impl RequestHandler<RemoteMessage> for OperationDispatcher {
    async fn handle(&self, request: Request, payload: RemoteMessage) {
        let message = match payload {
            RemoteMessage::Request(message) => message,
            other => {
                warn!(request_id = %request.id(), kind = other.kind(), "Unexpected request payload");
                request
                    .fail(RemoteFault::new(
                        "PROTOCOL_ERROR",
                        format!("expected an operation request, got {}", other.kind()),
                    ))
                    .await;
                return;
            }
        };

        let operation = message.operation.kind();
        let connector = message.configuration.connector.clone();
        debug!(request_id = %request.id(), connector = %connector, operation = %operation, "Operation received");

        match self.execute(&request, message).await {
            Ok(response) => {
                request.complete(RemoteMessage::Response(response)).await;
            }
            Err(e) => {
                debug!(
                    request_id = %request.id(),
                    connector = %connector,
                    operation = %operation,
                    error = %e,
                    "Operation failed"
                );
                request.fail(e.to_fault()).await;
            }
        }
    }
}

impl std::fmt::Debug for OperationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDispatcher")
            .field("cache", &self.cache)
            .finish()
    }
}
