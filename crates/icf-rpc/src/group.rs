//! Connection group
//!
//! All state shared by the physical connections to one peer: the two
//! pending-request maps, the connection list and the operational state.
//!
//! ```text
//! NOT_CONNECTED ──attach──▶ OPERATIONAL ──close──▶ CLOSED
//!        ▲                       │
//!        └──last connection lost─┘   (reconnect enabled, else CLOSED)
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::ConnectionContext;
use crate::distributor::RequestDistributor;
use crate::error::{RpcError, RpcResult};
use crate::frame::{Frame, Payload, RemoteFault};
use crate::ids::{ConnectionId, RequestId, MAX_REQUEST_ID};
use crate::request::{PendingLocal, RemoteRequest, RequestState};

/// Strikes after which a request unknown to the peer is dropped.
const LOST_REQUEST_STRIKES: u8 = 2;

// ============================================================================
// Operational state
// ============================================================================

/// Operational state of a connection group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    /// No usable connection; may become operational again.
    NotConnected,
    /// At least one connection is attached.
    Operational,
    /// Shut down for good.
    Closed,
}

impl OperationalState {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalState::NotConnected => "not_connected",
            OperationalState::Operational => "operational",
            OperationalState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationalState::NotConnected,
            1 => OperationalState::Operational,
            _ => OperationalState::Closed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            OperationalState::NotConnected => 0,
            OperationalState::Operational => 1,
            OperationalState::Closed => 2,
        }
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Connection group settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Go back to `NotConnected` instead of `Closed` when the last
    /// connection is lost.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// Maximum number of incoming requests executed at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_reconnect() -> bool {
    true
}

fn default_max_concurrent_requests() -> usize {
    64
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            reconnect: default_reconnect(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl GroupConfig {
    /// Set reconnect support.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the worker concurrency limit.
    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }
}

// ============================================================================
// Request handler
// ============================================================================

/// Executes requests received from the peer.
///
/// Runs on a worker task, never on the connection's reader. The handler
/// answers through the [`RemoteRequest`]; returning without an answer sends
/// a `NO_RESPONSE` fault.
#[async_trait]
pub trait RequestHandler<M: Payload>: Send + Sync + 'static {
    /// Handle one incoming request.
    async fn handle(&self, request: Arc<RemoteRequest<M>>, payload: M);
}

/// Handler for groups that only originate requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingHandler;

#[async_trait]
impl<M: Payload> RequestHandler<M> for RejectingHandler {
    async fn handle(&self, request: Arc<RemoteRequest<M>>, _payload: M) {
        request
            .fail(RemoteFault::new(
                "UNSUPPORTED",
                "this peer does not accept requests",
            ))
            .await;
    }
}

// ============================================================================
// Connection group
// ============================================================================

/// Requests and connections shared with one peer.
pub struct ConnectionGroup<M: Payload> {
    name: String,
    config: GroupConfig,
    state: AtomicU8,
    next_id: AtomicU64,
    next_connection: AtomicUsize,
    connections: RwLock<Vec<Arc<dyn ConnectionContext<M>>>>,
    local_requests: DashMap<RequestId, Arc<dyn PendingLocal<M>>>,
    remote_requests: DashMap<RequestId, Arc<RemoteRequest<M>>>,
    handler: Arc<dyn RequestHandler<M>>,
    workers: Arc<Semaphore>,
    last_activity: Mutex<Instant>,
    shutdown: CancellationToken,
    this: Weak<ConnectionGroup<M>>,
}

impl<M: Payload> ConnectionGroup<M> {
    /// Create a group with no connection attached.
    pub fn new(
        name: impl Into<String>,
        config: GroupConfig,
        handler: Arc<dyn RequestHandler<M>>,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            config,
            state: AtomicU8::new(OperationalState::NotConnected.to_u8()),
            next_id: AtomicU64::new(0),
            next_connection: AtomicUsize::new(0),
            connections: RwLock::new(Vec::new()),
            local_requests: DashMap::new(),
            remote_requests: DashMap::new(),
            handler,
            workers,
            last_activity: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Get the group name (peer or session identifier).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the group settings.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Get the operational state.
    pub fn state(&self) -> OperationalState {
        OperationalState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if requests can be sent.
    pub fn is_operational(&self) -> bool {
        self.state() == OperationalState::Operational
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Number of requests we are waiting on.
    pub fn local_request_count(&self) -> usize {
        self.local_requests.len()
    }

    /// Number of peer requests we are executing.
    pub fn remote_request_count(&self) -> usize {
        self.remote_requests.len()
    }

    /// Ids of requests we are waiting on.
    pub fn local_request_ids(&self) -> Vec<RequestId> {
        self.local_requests.iter().map(|e| *e.key()).collect()
    }

    /// Ids of peer requests we are executing.
    pub fn remote_request_ids(&self) -> Vec<RequestId> {
        self.remote_requests.iter().map(|e| *e.key()).collect()
    }

    /// Instant of the last frame read or written.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Check if the group has been unusable and silent for longer than `idle`.
    pub fn is_idle_for(&self, idle: Duration) -> bool {
        !self.is_operational() && self.last_activity().elapsed() > idle
    }

    /// Get a distributor bound to this group.
    pub fn distributor(&self) -> Option<RequestDistributor<M>> {
        self.this.upgrade().map(RequestDistributor::new)
    }

    /// Attach a connection that completed its handshake and start reading it.
    pub fn attach(&self, connection: Arc<dyn ConnectionContext<M>>) -> RpcResult<()> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| RpcError::connection_closed("connection group dropped"))?;
        if self.state() == OperationalState::Closed {
            return Err(RpcError::connection_closed("connection group closed"));
        }

        self.connections.write().push(connection.clone());
        let _ = self.state.compare_exchange(
            OperationalState::NotConnected.to_u8(),
            OperationalState::Operational.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.state() == OperationalState::Closed {
            self.connections
                .write()
                .retain(|c| c.connection_id() != connection.connection_id());
            return Err(RpcError::connection_closed("connection group closed"));
        }

        self.touch();
        info!(
            group = %self.name,
            connection = %connection.connection_id(),
            connections = self.connection_count(),
            "Connection attached"
        );
        tokio::spawn(this.reader_loop(connection));
        Ok(())
    }

    /// Close the group: fail every local request, drop every remote one
    /// and close all connections. Idempotent.
    pub async fn close(&self) {
        let previous = self
            .state
            .swap(OperationalState::Closed.to_u8(), Ordering::AcqRel);
        if previous == OperationalState::Closed.to_u8() {
            return;
        }
        self.shutdown.cancel();
        self.workers.close();
        self.fail_pending(RpcError::connection_closed("connection group closed"));

        let connections = std::mem::take(&mut *self.connections.write());
        for connection in connections {
            connection.close().await;
        }
        info!(group = %self.name, "Connection group closed");
    }

    /// Write a frame to one of the connections, round-robin, falling over
    /// to the next connection when a write fails.
    pub async fn try_send(&self, frame: &Frame<M>) -> RpcResult<Arc<dyn ConnectionContext<M>>> {
        let connections: Vec<_> = self.connections.read().clone();
        if connections.is_empty() {
            return Err(RpcError::NotOperational);
        }

        let start = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for offset in 0..connections.len() {
            let connection = &connections[(start + offset) % connections.len()];
            if connection.is_closed() {
                continue;
            }
            match connection.write(frame).await {
                Ok(()) => {
                    self.touch();
                    return Ok(connection.clone());
                }
                Err(e) => {
                    debug!(
                        group = %self.name,
                        connection = %connection.connection_id(),
                        frame = frame.kind(),
                        error = %e,
                        "Write failed, trying next connection"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(RpcError::NotOperational))
    }

    /// Send the ids of every tracked request to the peer for reconciliation.
    pub async fn check_is_active(&self) -> RpcResult<()> {
        if !self.is_operational() {
            return Err(RpcError::NotOperational);
        }
        let frame = Frame::Control {
            local: self.local_request_ids(),
            remote: self.remote_request_ids(),
        };
        self.try_send(&frame).await.map(|_| ())
    }

    /// Drop requests the peer has repeatedly reported as unknown.
    ///
    /// Returns the number of requests dropped.
    pub fn check_requests(&self) -> usize {
        let lost_local: Vec<_> = self
            .local_requests
            .iter()
            .filter(|e| e.value().strikes().count() >= LOST_REQUEST_STRIKES)
            .map(|e| e.value().clone())
            .collect();
        let lost_remote: Vec<_> = self
            .remote_requests
            .iter()
            .filter(|e| e.value().strikes().count() >= LOST_REQUEST_STRIKES)
            .map(|e| e.value().clone())
            .collect();

        let mut dropped = 0;
        for request in lost_local {
            warn!(group = %self.name, request_id = %request.id(), "Request lost by peer");
            if request.fail(RpcError::RequestLost {
                request_id: request.id(),
            }) {
                dropped += 1;
            }
        }
        for request in lost_remote {
            warn!(group = %self.name, request_id = %request.id(), "Peer abandoned request");
            self.remove_remote(request.id());
            if request.abandon() {
                dropped += 1;
            }
        }
        dropped
    }

    // ------------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------------

    /// Next id from the 63-bit counter, skipping zero.
    pub(crate) fn next_request_id(&self) -> RequestId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & MAX_REQUEST_ID;
            if raw != 0 {
                return RequestId::new(raw);
            }
        }
    }

    pub(crate) fn local_requests(&self) -> &DashMap<RequestId, Arc<dyn PendingLocal<M>>> {
        &self.local_requests
    }

    pub(crate) fn remote_requests(&self) -> &DashMap<RequestId, Arc<RemoteRequest<M>>> {
        &self.remote_requests
    }

    pub(crate) fn remove_local(&self, id: RequestId) {
        self.local_requests
            .remove_if(&id, |_, request| request.state().is_terminal());
    }

    pub(crate) fn remove_remote(&self, id: RequestId) {
        self.remote_requests.remove(&id);
    }

    pub(crate) fn this(&self) -> Weak<ConnectionGroup<M>> {
        self.this.clone()
    }

    /// Run a remote request on a worker task.
    pub(crate) fn dispatch(&self, request: Arc<RemoteRequest<M>>, payload: M) {
        let handler = self.handler.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                request.abandon();
                return;
            };
            if request.is_pending() {
                handler.handle(request.clone(), payload).await;
            }
            if request.state() == RequestState::Pending {
                request.fail(RemoteFault::no_response()).await;
            }
        });
    }

    /// Apply a peer's control frame.
    pub(crate) fn reconcile(&self, peer_local: &[RequestId], peer_remote: &[RequestId]) {
        let peer_local: HashSet<_> = peer_local.iter().copied().collect();
        let peer_remote: HashSet<_> = peer_remote.iter().copied().collect();

        for entry in self.local_requests.iter() {
            if peer_remote.contains(entry.key()) {
                entry.value().strikes().reset();
            } else {
                entry.value().strikes().record();
            }
        }
        for entry in self.remote_requests.iter() {
            if peer_local.contains(entry.key()) {
                entry.value().strikes().reset();
            } else {
                entry.value().strikes().record();
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Fail every tracked request. Only entries that were failed here are
    /// removed; a request inserted concurrently fails itself on submit.
    fn fail_pending(&self, error: RpcError) {
        let locals: Vec<_> = self
            .local_requests
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, request) in locals {
            request.fail(error.clone());
            self.local_requests
                .remove_if(&id, |_, r| r.state().is_terminal());
        }

        let remotes: Vec<_> = self
            .remote_requests
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, request) in remotes {
            request.abandon();
            self.remote_requests.remove_if(&id, |_, r| !r.is_pending());
        }
    }

    #[instrument(skip_all, fields(group = %self.name))]
    async fn reader_loop(self: Arc<Self>, connection: Arc<dyn ConnectionContext<M>>) {
        let distributor = RequestDistributor::new(self.clone());
        let reason = loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                next = connection.read() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    self.touch();
                    distributor.on_frame(&connection, frame);
                }
                Ok(None) => break Some("end of stream".to_string()),
                Err(RpcError::Decode {
                    request_id: Some(id),
                    request_frame,
                    message,
                }) => {
                    distributor
                        .on_decode_error(&connection, id, request_frame, message)
                        .await;
                }
                Err(RpcError::Decode {
                    request_id: None,
                    message,
                    ..
                }) => {
                    warn!(error = %message, "Undecodable frame dropped");
                }
                Err(e) => break Some(e.to_string()),
            }
        };

        if let Some(reason) = reason {
            connection.close().await;
            self.connection_lost(connection.connection_id(), reason).await;
        }
    }

    async fn connection_lost(&self, id: ConnectionId, reason: String) {
        let remaining = {
            let mut connections = self.connections.write();
            connections.retain(|c| c.connection_id() != id);
            connections.len()
        };
        warn!(
            group = %self.name,
            connection = %id,
            remaining,
            reason = %reason,
            "Connection lost"
        );
        if remaining > 0 {
            return;
        }

        if self.config.reconnect {
            let moved = self
                .state
                .compare_exchange(
                    OperationalState::Operational.to_u8(),
                    OperationalState::NotConnected.to_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if moved {
                self.fail_pending(RpcError::connection_closed(reason));
            }
        } else {
            self.close().await;
        }
    }
}

impl<M: Payload> fmt::Debug for ConnectionGroup<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGroup")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .field("local_requests", &self.local_requests.len())
            .field("remote_requests", &self.remote_requests.len())
            .finish()
    }
}
