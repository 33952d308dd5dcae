//! Request distributor
//!
//! Allocates ids for outgoing requests, correlates incoming frames with
//! pending requests and hands fresh peer requests to the group's handler.

use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ConnectionContext;
use crate::error::RpcError;
use crate::frame::{Frame, Outcome, Payload, RemoteFault};
use crate::group::ConnectionGroup;
use crate::ids::RequestId;
use crate::observer::Observer;
use crate::request::{LocalRequest, PendingLocal, RemoteRequest, RequestFactory};

/// Correlates requests and responses on one connection group.
pub struct RequestDistributor<M: Payload> {
    group: Arc<ConnectionGroup<M>>,
}

impl<M: Payload> Clone for RequestDistributor<M> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
        }
    }
}

impl<M: Payload> RequestDistributor<M> {
    /// Create a distributor for a group.
    pub fn new(group: Arc<ConnectionGroup<M>>) -> Self {
        Self { group }
    }

    /// Get the group this distributor works on.
    pub fn group(&self) -> &Arc<ConnectionGroup<M>> {
        &self.group
    }

    /// Check if the group can send requests.
    pub fn is_operational(&self) -> bool {
        self.group.is_operational()
    }

    /// Submit a request.
    ///
    /// Returns as soon as the request frame is written. Returns `None`
    /// without raising when the group is not operational or no connection
    /// accepted the frame.
    pub async fn try_submit<F>(&self, factory: F) -> Option<Arc<LocalRequest<M, F>>>
    where
        F: RequestFactory<M>,
    {
        self.submit_inner(factory, None).await
    }

    /// Submit a request whose parts and result are also pushed to `observer`.
    pub async fn try_submit_observed<F>(
        &self,
        factory: F,
        observer: Arc<dyn Observer<F::Value>>,
    ) -> Option<Arc<LocalRequest<M, F>>>
    where
        F: RequestFactory<M>,
    {
        self.submit_inner(factory, Some(observer)).await
    }

    async fn submit_inner<F>(
        &self,
        factory: F,
        observer: Option<Arc<dyn Observer<F::Value>>>,
    ) -> Option<Arc<LocalRequest<M, F>>>
    where
        F: RequestFactory<M>,
    {
        if !self.group.is_operational() {
            debug!(group = %self.group.name(), "Group not operational, request not sent");
            return None;
        }

        let request = loop {
            let id = self.group.next_request_id();
            match self.group.local_requests().entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let request = Arc::new(LocalRequest::new(
                        id,
                        factory,
                        observer,
                        self.group.this(),
                    ));
                    slot.insert(request.clone() as Arc<dyn PendingLocal<M>>);
                    break request;
                }
            }
        };
        let id = request.id();
        if self.abort_if_closed(&request) {
            debug!(request_id = %id, "Group closed during submit, request not sent");
            return None;
        }

        let payload = match request.factory().create_payload(id) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to build request payload");
                self.group.local_requests().remove(&id);
                return None;
            }
        };

        match self.group.try_send(&Frame::Request { id, payload }).await {
            Ok(connection) => {
                request.set_source(&connection);
                if self.abort_if_closed(&request) {
                    debug!(request_id = %id, "Group closed while the request was sent");
                    return Some(request);
                }
                debug!(
                    request_id = %id,
                    connection = %connection.connection_id(),
                    "Request sent"
                );
                Some(request)
            }
            Err(e) => {
                debug!(request_id = %id, error = %e, "No connection accepted the request");
                self.group.local_requests().remove(&id);
                None
            }
        }
    }

    /// Fail a freshly registered request if the group stopped being
    /// operational, which the close sweep may have missed.
    fn abort_if_closed<F>(&self, request: &Arc<LocalRequest<M, F>>) -> bool
    where
        F: RequestFactory<M>,
    {
        if self.group.is_operational() {
            return false;
        }
        self.group.local_requests().remove(&request.id());
        request.fail(RpcError::connection_closed("connection group closed"));
        true
    }

    /// Cancel a request we submitted. Returns false if it was already done.
    pub fn cancel_local(&self, id: RequestId) -> bool {
        let request = self.group.local_requests().get(&id).map(|e| e.value().clone());
        match request {
            Some(request) => request.cancel(),
            None => false,
        }
    }

    /// Abandon a request the peer sent us. Its result will be discarded.
    pub fn cancel_remote(&self, id: RequestId) -> bool {
        match self.group.remote_requests().remove(&id) {
            Some((_, request)) => request.abandon(),
            None => false,
        }
    }

    /// Route one frame read from `source`.
    pub fn on_frame(&self, source: &Arc<dyn ConnectionContext<M>>, frame: Frame<M>) {
        match frame {
            Frame::Request { id, payload } => self.receive_request(source, id, payload),
            Frame::ResponsePart { id, payload } => match self.local(id) {
                Some(request) => request.handle_part(payload),
                None => debug!(request_id = %id, "Response part for unknown request dropped"),
            },
            Frame::ResponseEnd { id, outcome } => match self.local(id) {
                Some(request) => request.handle_end(outcome),
                None => {
                    let fault = matches!(outcome, Outcome::Fault(_));
                    debug!(request_id = %id, fault, "Response for unknown request dropped");
                }
            },
            Frame::Cancel { id } => {
                if self.cancel_remote(id) {
                    debug!(request_id = %id, "Request cancelled by peer");
                } else {
                    debug!(request_id = %id, "Cancel for unknown request dropped");
                }
            }
            Frame::Control { local, remote } => self.group.reconcile(&local, &remote),
            Frame::Hello { .. } => {
                warn!(
                    group = %self.group.name(),
                    connection = %source.connection_id(),
                    "Hello after handshake ignored"
                );
            }
        }
    }

    /// Handle a frame from `source` that could not be decoded.
    ///
    /// An undecodable reply fails the pending request it belongs to. An
    /// undecodable request from the peer is answered with a decode fault on
    /// the connection it arrived on.
    pub async fn on_decode_error(
        &self,
        source: &Arc<dyn ConnectionContext<M>>,
        id: RequestId,
        request_frame: bool,
        message: String,
    ) {
        if request_frame {
            warn!(request_id = %id, error = %message, "Undecodable request rejected");
            let fault = RemoteFault::new("DECODE_ERROR", message);
            let frame = Frame::ResponseEnd {
                id,
                outcome: Outcome::Fault(fault),
            };
            if let Err(e) = source.write(&frame).await {
                debug!(request_id = %id, error = %e, "Decode fault not delivered");
            }
            return;
        }

        match self.local(id) {
            Some(request) => {
                warn!(request_id = %id, error = %message, "Undecodable response");
                request.fail(RpcError::decode_for(id, message));
            }
            None => debug!(request_id = %id, error = %message, "Undecodable frame dropped"),
        }
    }

    fn local(&self, id: RequestId) -> Option<Arc<dyn PendingLocal<M>>> {
        self.group.local_requests().get(&id).map(|e| e.value().clone())
    }

    fn receive_request(&self, source: &Arc<dyn ConnectionContext<M>>, id: RequestId, payload: M) {
        let request = Arc::new(RemoteRequest::new(
            id,
            source.connection_id(),
            self.group.this(),
        ));
        match self.group.remote_requests().entry(id) {
            Entry::Occupied(_) => {
                warn!(request_id = %id, "Duplicate request dropped");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
            }
        }
        self.group.dispatch(request, payload);
    }
}
