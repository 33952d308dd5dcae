//! RPC error types
//!
//! Terminal causes for requests, split into transport failures, remote
//! operation failures, cancellation and timeouts so callers can tell them apart.

use thiserror::Error;

use crate::frame::RemoteFault;
use crate::ids::RequestId;

/// Error resolving a request or operating a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    // Transport errors
    /// The connection group has no operational connection.
    #[error("connection group is not operational")]
    NotOperational,

    /// The connection (or the whole group) was closed.
    #[error("connection closed: {message}")]
    ConnectionClosed { message: String },

    /// I/O failure while reading or writing a frame.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A frame could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Id of the affected request when the envelope was readable.
        request_id: Option<RequestId>,
        /// The frame was a new request from the peer, not a reply.
        request_frame: bool,
        message: String,
    },

    /// The peer no longer knows about this request.
    #[error("request {request_id} lost by peer")]
    RequestLost { request_id: RequestId },

    /// A frame arrived that violates the protocol state machine.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    // Caller-side terminal causes
    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Waiting for the result timed out.
    #[error("timed out after {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    // Operation errors
    /// The remote side executed the operation and it failed.
    #[error("remote operation failed [{code}]: {message}")]
    Remote { code: String, message: String },
}

impl RpcError {
    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }

    /// Check if this is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }

    /// Check if this is a transport-level failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::NotOperational
                | RpcError::ConnectionClosed { .. }
                | RpcError::Transport { .. }
                | RpcError::Decode { .. }
                | RpcError::RequestLost { .. }
                | RpcError::Protocol { .. }
        )
    }

    /// Check if the remote operation failed.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote { .. })
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            RpcError::NotOperational => "NOT_OPERATIONAL",
            RpcError::ConnectionClosed { .. } => "CONNECTION_CLOSED",
            RpcError::Transport { .. } => "TRANSPORT_ERROR",
            RpcError::Decode { .. } => "DECODE_ERROR",
            RpcError::RequestLost { .. } => "REQUEST_LOST",
            RpcError::Protocol { .. } => "PROTOCOL_ERROR",
            RpcError::Cancelled => "CANCELLED",
            RpcError::TimedOut { .. } => "TIMED_OUT",
            RpcError::Remote { .. } => "REMOTE_FAILURE",
        }
    }

    // Convenience constructors

    /// Create a connection closed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        RpcError::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
        }
    }

    /// Create a decode error not tied to a request.
    pub fn decode(message: impl Into<String>) -> Self {
        RpcError::Decode {
            request_id: None,
            request_frame: false,
            message: message.into(),
        }
    }

    /// Create a decode error for one request.
    pub fn decode_for(request_id: RequestId, message: impl Into<String>) -> Self {
        RpcError::Decode {
            request_id: Some(request_id),
            request_frame: false,
            message: message.into(),
        }
    }

    /// Create a decode error for a request frame the peer sent us.
    pub fn decode_request(request_id: RequestId, message: impl Into<String>) -> Self {
        RpcError::Decode {
            request_id: Some(request_id),
            request_frame: true,
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error from a duration.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        RpcError::TimedOut {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<RemoteFault> for RpcError {
    fn from(fault: RemoteFault) -> Self {
        RpcError::Remote {
            code: fault.code,
            message: fault.message,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => RpcError::connection_closed(err.to_string()),
            _ => RpcError::transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::decode(err.to_string())
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_causes_are_distinguishable() {
        let cancelled = RpcError::Cancelled;
        let timeout = RpcError::timed_out(std::time::Duration::from_secs(2));
        let remote = RpcError::from(RemoteFault::new("OBJECT_NOT_FOUND", "no such user"));
        let closed = RpcError::connection_closed("peer went away");

        assert!(cancelled.is_cancelled() && !cancelled.is_timeout() && !cancelled.is_transport());
        assert!(timeout.is_timeout() && !timeout.is_cancelled() && !timeout.is_remote());
        assert!(remote.is_remote() && !remote.is_transport());
        assert!(closed.is_transport() && !closed.is_remote());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RpcError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(RpcError::NotOperational.error_code(), "NOT_OPERATIONAL");
        assert_eq!(
            RpcError::decode_for(RequestId::new(3), "bad").error_code(),
            "DECODE_ERROR"
        );
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::timed_out(std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1500 ms");

        let err = RpcError::Remote {
            code: "OPERATION_FAILED".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "remote operation failed [OPERATION_FAILED]: boom");
    }

    #[test]
    fn test_io_error_classification() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(RpcError::from(eof), RpcError::ConnectionClosed { .. }));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(matches!(RpcError::from(other), RpcError::Transport { .. }));
    }
}
