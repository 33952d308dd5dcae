//! Request lifecycle
//!
//! A [`LocalRequest`] is one we originated and whose reply we are waiting
//! for. A [`RemoteRequest`] is one the peer sent us and that we must answer.
//! Both move from `Pending` to exactly one sticky terminal state; the winner
//! of that transition removes the request from its group's map.

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ConnectionContext;
use crate::error::{RpcError, RpcResult};
use crate::frame::{Frame, Outcome, Payload, RemoteFault};
use crate::group::ConnectionGroup;
use crate::ids::{ConnectionId, RequestId};
use crate::observer::{Observer, Subscription};
use crate::promise::Promise;

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for a terminal frame.
    Pending,
    /// Resolved with a value.
    Completed,
    /// Resolved with an error.
    Failed,
    /// Cancelled by either side.
    Cancelled,
}

impl RequestState {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    /// Check if no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestState::Pending,
            1 => RequestState::Completed,
            2 => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RequestState::Pending => 0,
            RequestState::Completed => 1,
            RequestState::Failed => 2,
            RequestState::Cancelled => 3,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Atomic state holding the sticky-terminal rule.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RequestState::Pending.to_u8()))
    }

    fn get(&self) -> RequestState {
        RequestState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `Pending` to `to`. Only one caller ever wins.
    fn finish(&self, to: RequestState) -> bool {
        self.0
            .compare_exchange(
                RequestState::Pending.to_u8(),
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Consecutive liveness checks in which the peer did not list a request.
#[derive(Debug, Default)]
pub(crate) struct Strikes(AtomicU8);

impl Strikes {
    pub(crate) fn record(&self) -> u8 {
        self.0.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub(crate) fn count(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Request factory
// ============================================================================

/// Builds the outbound payload of a request and interprets its replies.
///
/// Supplied per request kind so the distributor never looks inside payloads.
pub trait RequestFactory<M: Payload>: Send + Sync + 'static {
    /// Value produced by each response part and by the terminal response.
    type Value: Clone + Send + Sync + 'static;

    /// Render the outbound payload for a freshly allocated id.
    fn create_payload(&self, id: RequestId) -> RpcResult<M>;

    /// Interpret one response payload.
    fn decode(&self, id: RequestId, payload: M) -> RpcResult<Self::Value>;

    /// Map a remote failure to the error the caller sees.
    fn decode_fault(&self, fault: RemoteFault) -> RpcError {
        fault.into()
    }
}

// ============================================================================
// Local requests
// ============================================================================

/// Type-erased view the group keeps of its local requests.
pub(crate) trait PendingLocal<M>: Send + Sync {
    fn id(&self) -> RequestId;
    fn state(&self) -> RequestState;
    fn handle_part(&self, payload: M);
    fn handle_end(&self, outcome: Outcome<M>);
    fn fail(&self, error: RpcError) -> bool;
    fn cancel(&self) -> bool;
    fn strikes(&self) -> &Strikes;
}

/// A request we sent and whose reply we are waiting for.
pub struct LocalRequest<M: Payload, F: RequestFactory<M>> {
    id: RequestId,
    factory: F,
    state: StateCell,
    promise: Promise<F::Value>,
    observer: Option<Arc<dyn Observer<F::Value>>>,
    partial_results: Mutex<Vec<F::Value>>,
    delivery: ReentrantMutex<()>,
    source: Mutex<Option<Weak<dyn ConnectionContext<M>>>>,
    group: Weak<ConnectionGroup<M>>,
    strikes: Strikes,
}

impl<M: Payload, F: RequestFactory<M>> LocalRequest<M, F> {
    pub(crate) fn new(
        id: RequestId,
        factory: F,
        observer: Option<Arc<dyn Observer<F::Value>>>,
        group: Weak<ConnectionGroup<M>>,
    ) -> Self {
        Self {
            id,
            factory,
            state: StateCell::new(),
            promise: Promise::new(),
            observer,
            partial_results: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
            source: Mutex::new(None),
            group,
            strikes: Strikes::default(),
        }
    }

    pub(crate) fn set_source(&self, connection: &Arc<dyn ConnectionContext<M>>) {
        *self.source.lock() = Some(Arc::downgrade(connection));
    }

    /// Get the correlation id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Get the current state.
    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    /// Check if the request reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state.get().is_terminal()
    }

    /// Get the factory this request was built with.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get a handle on the final value.
    pub fn promise(&self) -> Promise<F::Value> {
        self.promise.clone()
    }

    /// Values received from response parts so far, in arrival order.
    pub fn partial_results(&self) -> Vec<F::Value> {
        self.partial_results.lock().clone()
    }

    /// Id of the connection the request was written to, while it is alive.
    pub fn source_connection(&self) -> Option<ConnectionId> {
        self.source
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|c| c.connection_id())
    }

    /// Wait for the final value.
    pub async fn wait(&self) -> RpcResult<F::Value> {
        self.promise.wait().await
    }

    /// Wait for the final value with a timeout.
    ///
    /// A timeout does not cancel the request.
    pub async fn wait_timeout(&self, timeout: Duration) -> RpcResult<F::Value> {
        self.promise.wait_timeout(timeout).await
    }

    /// Cancel the request and tell the peer, best effort.
    ///
    /// Returns false if the request had already finished.
    pub fn cancel(&self) -> bool {
        if !self.finish(Err(RpcError::Cancelled)) {
            return false;
        }
        self.send_cancel_notice();
        true
    }

    fn finish(&self, outcome: RpcResult<F::Value>) -> bool {
        let _delivery = self.delivery.lock();
        let target = match &outcome {
            Ok(_) => RequestState::Completed,
            Err(e) if e.is_cancelled() => RequestState::Cancelled,
            Err(_) => RequestState::Failed,
        };
        if !self.state.finish(target) {
            return false;
        }
        if let Some(group) = self.group.upgrade() {
            group.remove_local(self.id);
        }
        if let Some(observer) = &self.observer {
            match &outcome {
                Ok(value) => {
                    observer.on_next(value.clone());
                    observer.on_completed();
                }
                Err(e) => observer.on_error(e.clone()),
            }
        }
        self.promise.resolve(outcome);
        true
    }

    fn send_cancel_notice(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(request_id = %self.id, "No runtime, cancel notice not sent");
            return;
        };
        let source = self.source.lock().as_ref().and_then(Weak::upgrade);
        let group = self.group.upgrade();
        let id = self.id;
        runtime.spawn(async move {
            let frame = Frame::Cancel { id };
            let sent = match source {
                Some(connection) if !connection.is_closed() => connection.write(&frame).await,
                _ => match group {
                    Some(group) => group.try_send(&frame).await.map(|_| ()),
                    None => Err(RpcError::NotOperational),
                },
            };
            if let Err(e) = sent {
                debug!(request_id = %id, error = %e, "Cancel notice not delivered");
            }
        });
    }

    fn decode_error(&self, error: RpcError) -> RpcError {
        match error {
            RpcError::Decode { message, .. } => RpcError::decode_for(self.id, message),
            other => RpcError::decode_for(self.id, other.to_string()),
        }
    }
}

impl<M: Payload, F: RequestFactory<M>> PendingLocal<M> for LocalRequest<M, F> {
    fn id(&self) -> RequestId {
        self.id
    }

    fn state(&self) -> RequestState {
        self.state.get()
    }

    fn handle_part(&self, payload: M) {
        let _delivery = self.delivery.lock();
        if self.state.get().is_terminal() {
            debug!(request_id = %self.id, "Late response part dropped");
            return;
        }
        match self.factory.decode(self.id, payload) {
            Ok(value) => {
                self.partial_results.lock().push(value.clone());
                if let Some(observer) = &self.observer {
                    observer.on_next(value);
                }
            }
            Err(e) => {
                warn!(request_id = %self.id, error = %e, "Failed to decode response part");
                self.finish(Err(self.decode_error(e)));
            }
        }
    }

    fn handle_end(&self, outcome: Outcome<M>) {
        let result = match outcome {
            Outcome::Value(payload) => self
                .factory
                .decode(self.id, payload)
                .map_err(|e| self.decode_error(e)),
            Outcome::Fault(fault) => Err(self.factory.decode_fault(fault)),
        };
        if !self.finish(result) {
            debug!(request_id = %self.id, "Duplicate terminal frame ignored");
        }
    }

    fn fail(&self, error: RpcError) -> bool {
        self.finish(Err(error))
    }

    fn cancel(&self) -> bool {
        LocalRequest::cancel(self)
    }

    fn strikes(&self) -> &Strikes {
        &self.strikes
    }
}

impl<M: Payload, F: RequestFactory<M>> Subscription for LocalRequest<M, F> {
    fn unsubscribe(&self) {
        self.cancel();
    }

    fn is_unsubscribed(&self) -> bool {
        self.is_done()
    }
}

impl<M: Payload, F: RequestFactory<M>> fmt::Debug for LocalRequest<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRequest")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

// ============================================================================
// Remote requests
// ============================================================================

/// A request the peer sent us.
///
/// The handler answers through [`send_part`](Self::send_part),
/// [`complete`](Self::complete) or [`fail`](Self::fail). Once the request
/// is terminal, further answers are discarded.
pub struct RemoteRequest<M: Payload> {
    id: RequestId,
    source: ConnectionId,
    state: StateCell,
    cancel: CancellationToken,
    group: Weak<ConnectionGroup<M>>,
    strikes: Strikes,
}

impl<M: Payload> RemoteRequest<M> {
    pub(crate) fn new(id: RequestId, source: ConnectionId, group: Weak<ConnectionGroup<M>>) -> Self {
        Self {
            id,
            source,
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            group,
            strikes: Strikes::default(),
        }
    }

    /// Get the correlation id chosen by the peer.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Get the connection the request arrived on.
    pub fn source_connection(&self) -> ConnectionId {
        self.source
    }

    /// Get the current state.
    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    /// Check if the request is still waiting for an answer.
    pub fn is_pending(&self) -> bool {
        !self.state.get().is_terminal()
    }

    /// Check if the peer cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the peer no longer wants the result.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send one partial result.
    pub async fn send_part(&self, payload: M) -> RpcResult<()> {
        if !self.is_pending() {
            return Err(RpcError::Cancelled);
        }
        let group = self.group.upgrade().ok_or(RpcError::NotOperational)?;
        group
            .try_send(&Frame::ResponsePart {
                id: self.id,
                payload,
            })
            .await
            .map(|_| ())
    }

    /// Answer with the final value. Returns false if already terminal.
    pub async fn complete(&self, payload: M) -> bool {
        self.respond(Outcome::Value(payload), RequestState::Completed)
            .await
    }

    /// Answer with a failure. Returns false if already terminal.
    pub async fn fail(&self, fault: RemoteFault) -> bool {
        self.respond(Outcome::Fault(fault), RequestState::Failed)
            .await
    }

    async fn respond(&self, outcome: Outcome<M>, state: RequestState) -> bool {
        if !self.state.finish(state) {
            debug!(request_id = %self.id, "Result for finished request discarded");
            return false;
        }
        let Some(group) = self.group.upgrade() else {
            return false;
        };
        group.remove_remote(self.id);
        if let Err(e) = group
            .try_send(&Frame::ResponseEnd {
                id: self.id,
                outcome,
            })
            .await
        {
            warn!(request_id = %self.id, error = %e, "Failed to send response");
        }
        true
    }

    /// Stop the request without answering it.
    pub(crate) fn abandon(&self) -> bool {
        if self.state.finish(RequestState::Cancelled) {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub(crate) fn strikes(&self) -> &Strikes {
        &self.strikes
    }
}

impl<M: Payload> fmt::Debug for RemoteRequest<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRequest")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("state", &self.state.get())
            .finish()
    }
}
