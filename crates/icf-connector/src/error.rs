//! Connector Framework error types
//!
//! Error definitions with transient/permanent classification. Errors are
//! cheap to clone so one failure can be fanned out to every observer of a
//! stream.

use std::sync::Arc;
use thiserror::Error;

use icf_rpc::{RemoteFault, RpcError};

use crate::ids::{BatchToken, ConnectorKey};
use crate::types::OperationKind;

/// Error that can occur during connector operations.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    // Connection errors (usually transient)
    /// Failed to establish connection to target system.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// Target system is temporarily unavailable.
    #[error("target system unavailable: {message}")]
    TargetUnavailable { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    // Authentication errors (permanent)
    /// Invalid credentials provided.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// Insufficient permissions for the operation.
    #[error("permission denied for {operation}")]
    PermissionDenied { operation: String },

    // Configuration errors (permanent)
    /// Connector configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// No factory is registered for the connector key.
    #[error("connector not found: {key}")]
    ConnectorNotFound { key: ConnectorKey },

    /// The connector does not declare the operation.
    #[error("operation {operation} is not supported by this connector")]
    Unsupported { operation: OperationKind },

    // Operation errors
    /// Operation did not finish within its configured timeout.
    #[error("operation {operation} timed out after {timeout_ms} ms")]
    OperationTimeout {
        operation: OperationKind,
        timeout_ms: u64,
    },

    /// Operation failed.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Object already exists in target system (create conflict).
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// Object not found in target system (update/delete target missing).
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Constraint violation in target system.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Invalid data format.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    // Batch errors
    /// Unknown or expired batch token.
    #[error("batch token not found: {token}")]
    BatchTokenNotFound { token: BatchToken },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    // Remote errors
    /// The remote connector server reported a failure.
    #[error("remote failure [{code}]: {message}")]
    RemoteFault { code: String, message: String },

    // Internal errors
    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl ConnectorError {
    /// Check if this error is transient and the operation should be retried.
    ///
    /// Transient errors are those caused by temporary conditions that may resolve
    /// themselves, such as network issues or temporary unavailability.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::ConnectionTimeout { .. }
                | ConnectorError::TargetUnavailable { .. }
                | ConnectorError::NetworkError { .. }
                | ConnectorError::OperationTimeout { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Check if this error is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectorError::Cancelled)
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::NetworkError { .. } => "NETWORK_ERROR",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::ConnectorNotFound { .. } => "CONNECTOR_NOT_FOUND",
            ConnectorError::Unsupported { .. } => "UNSUPPORTED",
            ConnectorError::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            ConnectorError::OperationFailed { .. } => "OPERATION_FAILED",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::BatchTokenNotFound { .. } => "BATCH_TOKEN_NOT_FOUND",
            ConnectorError::Cancelled => "CANCELLED",
            ConnectorError::RemoteFault { .. } => "REMOTE_FAULT",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
            ConnectorError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Describe this error for the wire.
    ///
    /// A fault received from another server keeps its original code.
    pub fn to_fault(&self) -> RemoteFault {
        match self {
            ConnectorError::RemoteFault { code, message } => RemoteFault::new(code, message),
            other => RemoteFault::new(other.error_code(), other.to_string()),
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        ConnectorError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::OperationFailed {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ConnectorError::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::NetworkError {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: OperationKind) -> Self {
        ConnectorError::Unsupported { operation }
    }
}

impl From<RpcError> for ConnectorError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote { code, .. } if code == "CANCELLED" => ConnectorError::Cancelled,
            RpcError::Remote { code, message } => ConnectorError::RemoteFault { code, message },
            RpcError::Cancelled => ConnectorError::Cancelled,
            RpcError::NotOperational | RpcError::ConnectionClosed { .. } => {
                ConnectorError::connection_failed_with_source("remote connection unavailable", err)
            }
            other => ConnectorError::network_with_source("remote request failed", other),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let transient_errors = vec![
            ConnectorError::connection_failed("test"),
            ConnectorError::ConnectionTimeout { timeout_secs: 30 },
            ConnectorError::TargetUnavailable {
                message: "test".to_string(),
            },
            ConnectorError::network("test"),
            ConnectorError::OperationTimeout {
                operation: OperationKind::Search,
                timeout_ms: 500,
            },
        ];

        for err in transient_errors {
            assert!(
                err.is_transient(),
                "Expected {} to be transient",
                err.error_code()
            );
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn test_permanent_errors() {
        let permanent_errors = vec![
            ConnectorError::AuthenticationFailed,
            ConnectorError::invalid_configuration("test"),
            ConnectorError::unsupported(OperationKind::Sync),
            ConnectorError::ObjectNotFound {
                identifier: "test".to_string(),
            },
            ConnectorError::Cancelled,
        ];

        for err in permanent_errors {
            assert!(
                err.is_permanent(),
                "Expected {} to be permanent",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_error_display() {
        let err = ConnectorError::unsupported(OperationKind::Authenticate);
        assert_eq!(
            err.to_string(),
            "operation authenticate is not supported by this connector"
        );

        let err = ConnectorError::OperationTimeout {
            operation: OperationKind::Create,
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "operation create timed out after 250 ms");
    }

    #[test]
    fn test_fault_keeps_remote_code() {
        let err = ConnectorError::ObjectAlreadyExists {
            identifier: "bob".to_string(),
        };
        let fault = err.to_fault();
        assert_eq!(fault.code, "OBJECT_EXISTS");
        assert_eq!(fault.message, "object already exists: bob");

        let relayed = ConnectorError::RemoteFault {
            code: "OBJECT_EXISTS".to_string(),
            message: "object already exists: bob".to_string(),
        };
        assert_eq!(relayed.to_fault(), fault);
    }

    #[test]
    fn test_from_rpc_error() {
        let err: ConnectorError = RpcError::Remote {
            code: "OPERATION_FAILED".to_string(),
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, ConnectorError::RemoteFault { ref code, .. } if code == "OPERATION_FAILED"));

        let err: ConnectorError = RpcError::Cancelled.into();
        assert!(err.is_cancelled());

        let err: ConnectorError = RpcError::connection_closed("gone").into();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_with_source_is_clonable() {
        let source_err = std::io::Error::new(std::io::ErrorKind::Other, "underlying error");
        let err = ConnectorError::connection_failed_with_source("failed", source_err);
        let copy = err.clone();

        assert!(std::error::Error::source(&copy).is_some());
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_source_is_optional() {
        use std::error::Error as _;

        assert!(ConnectorError::operation_failed("plain").source().is_none());
        assert!(ConnectorError::internal("plain").source().is_none());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ConnectorError::network_with_source("write failed", reset);
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("reset by peer"));
    }
}
