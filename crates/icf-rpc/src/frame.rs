//! Wire frame shapes
//!
//! The envelope every transport carries. The payload type is chosen by the
//! layer above; this crate only looks at the envelope.

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// Marker for types that can travel inside a [`Frame`].
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// One message on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame<M> {
    /// Handshake exchange, sent before a connection joins a group.
    Hello { payload: M },

    /// A new request the sender wants the receiver to execute.
    Request { id: RequestId, payload: M },

    /// One partial result for a pending request.
    ResponsePart { id: RequestId, payload: M },

    /// Terminal frame for a pending request.
    ResponseEnd { id: RequestId, outcome: Outcome<M> },

    /// The sender no longer wants the result of `id`.
    Cancel { id: RequestId },

    /// Liveness exchange listing every request the sender still tracks.
    Control {
        local: Vec<RequestId>,
        remote: Vec<RequestId>,
    },
}

impl<M> Frame<M> {
    /// Get the correlation id, if this frame carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Frame::Request { id, .. }
            | Frame::ResponsePart { id, .. }
            | Frame::ResponseEnd { id, .. }
            | Frame::Cancel { id } => Some(*id),
            Frame::Hello { .. } | Frame::Control { .. } => None,
        }
    }

    /// Get the frame kind for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Request { .. } => "request",
            Frame::ResponsePart { .. } => "response_part",
            Frame::ResponseEnd { .. } => "response_end",
            Frame::Cancel { .. } => "cancel",
            Frame::Control { .. } => "control",
        }
    }
}

/// Final value or error of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<M> {
    Value(M),
    Fault(RemoteFault),
}

/// Serialized description of an operation failure on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Classification code of the original error.
    pub code: String,
    /// Human-readable description of the original error.
    pub message: String,
}

impl RemoteFault {
    /// Create a new fault.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Fault raised when the remote handler finished without answering.
    pub fn no_response() -> Self {
        Self::new("NO_RESPONSE", "request handler finished without a response")
    }
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
