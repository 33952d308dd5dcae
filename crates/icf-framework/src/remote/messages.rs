//! Remote protocol messages
//!
//! Payloads carried inside RPC frames between a connector client and a
//! connector server: the handshake, operation requests, and the parts and
//! terminal values of operation responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use icf_connector::{
    ApiConfiguration, AttributeSet, BatchOptions, BatchResult, BatchSupport, BatchTask, BatchToken,
    ConnectorError, ConnectorObject, ConnectorResult, Filter, OperationKind, OperationOptions,
    Schema, ScriptContext, SearchResult, SyncDelta, SyncToken, Uid, UpdateType,
};
use icf_rpc::{RemoteFault, RequestFactory, RequestId, RpcError, RpcResult};

use crate::registry::ConnectorInfo;

/// A secret that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuardedString(String);

impl GuardedString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Get the clear text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for GuardedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedString(********)")
    }
}

/// Every payload of the remote protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum RemoteMessage {
    Hello(HelloMessage),
    Request(OperationRequest),
    Response(OperationResponse),
}

impl RemoteMessage {
    /// Get the message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteMessage::Hello(_) => "hello",
            RemoteMessage::Request(_) => "request",
            RemoteMessage::Response(_) => "response",
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Handshake exchanged before a connection joins a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hello", rename_all = "snake_case")]
pub enum HelloMessage {
    /// Sent by the client.
    Request { key: GuardedString, session: Uuid },

    /// Server accepted the key.
    Response {
        server_start_time: DateTime<Utc>,
        connectors: Vec<ConnectorInfo>,
    },

    /// Server refused the key; the connection is closed after this.
    Rejected { reason: String },
}

// ============================================================================
// Requests
// ============================================================================

/// One operation on the facade identified by `configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub configuration: ApiConfiguration,
    pub operation: Operation,
}

/// An operation and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        object_class: String,
        attributes: AttributeSet,
        #[serde(default)]
        options: OperationOptions,
    },
    Update {
        object_class: String,
        uid: Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        #[serde(default)]
        options: OperationOptions,
    },
    Delete {
        object_class: String,
        uid: Uid,
        #[serde(default)]
        options: OperationOptions,
    },
    Get {
        object_class: String,
        uid: Uid,
        #[serde(default)]
        options: OperationOptions,
    },
    Search {
        object_class: String,
        #[serde(default)]
        filter: Option<Filter>,
        #[serde(default)]
        options: OperationOptions,
    },
    Sync {
        object_class: String,
        #[serde(default)]
        token: Option<SyncToken>,
        #[serde(default)]
        options: OperationOptions,
    },
    LatestSyncToken {
        object_class: String,
    },
    Authenticate {
        object_class: String,
        username: String,
        password: GuardedString,
        #[serde(default)]
        options: OperationOptions,
    },
    ResolveUsername {
        object_class: String,
        username: String,
        #[serde(default)]
        options: OperationOptions,
    },
    RunScriptOnConnector {
        script: ScriptContext,
        #[serde(default)]
        options: OperationOptions,
    },
    RunScriptOnResource {
        script: ScriptContext,
        #[serde(default)]
        options: OperationOptions,
    },
    Test,
    Schema,
    Validate,
    ExecuteBatch {
        tasks: Vec<BatchTask>,
        #[serde(default)]
        options: BatchOptions,
    },
    QueryBatch {
        token: BatchToken,
        #[serde(default)]
        options: BatchOptions,
    },
}

impl Operation {
    /// The capability this operation requires.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Get { .. } => OperationKind::Get,
            Operation::Search { .. } => OperationKind::Search,
            Operation::Sync { .. } | Operation::LatestSyncToken { .. } => OperationKind::Sync,
            Operation::Authenticate { .. } => OperationKind::Authenticate,
            Operation::ResolveUsername { .. } => OperationKind::ResolveUsername,
            Operation::RunScriptOnConnector { .. } => OperationKind::ScriptOnConnector,
            Operation::RunScriptOnResource { .. } => OperationKind::ScriptOnResource,
            Operation::Test => OperationKind::Test,
            Operation::Schema => OperationKind::Schema,
            Operation::Validate => OperationKind::Validate,
            Operation::ExecuteBatch { .. } | Operation::QueryBatch { .. } => OperationKind::Batch,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A response part or terminal value.
///
/// `Object`, `Delta`, `BatchResult` and `BatchStarted` travel as response
/// parts; the others are terminal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationResponse {
    Object(ConnectorObject),
    Delta(SyncDelta),
    BatchResult(BatchResult),
    /// A callback batch is running; later results follow as parts.
    BatchStarted {
        token: BatchToken,
        support: BatchSupport,
    },

    Uid(Uid),
    Empty,
    MaybeObject(Option<ConnectorObject>),
    Search(SearchResult),
    SyncToken(Option<SyncToken>),
    Schema(Schema),
    ScriptResult(Value),
    Batch {
        token: Option<BatchToken>,
        support: BatchSupport,
        /// The batch delivered its terminal event.
        finished: bool,
        /// Set when the batch ended with an error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<RemoteFault>,
    },
}

impl OperationResponse {
    fn name(&self) -> &'static str {
        match self {
            OperationResponse::Object(_) => "object",
            OperationResponse::Delta(_) => "delta",
            OperationResponse::BatchResult(_) => "batch_result",
            OperationResponse::BatchStarted { .. } => "batch_started",
            OperationResponse::Uid(_) => "uid",
            OperationResponse::Empty => "empty",
            OperationResponse::MaybeObject(_) => "maybe_object",
            OperationResponse::Search(_) => "search",
            OperationResponse::SyncToken(_) => "sync_token",
            OperationResponse::Schema(_) => "schema",
            OperationResponse::ScriptResult(_) => "script_result",
            OperationResponse::Batch { .. } => "batch",
        }
    }

    pub(crate) fn unexpected(self, expected: &str) -> ConnectorError {
        ConnectorError::InvalidData {
            message: format!("expected a {expected} response, got {}", self.name()),
        }
    }

    pub fn expect_uid(self) -> ConnectorResult<Uid> {
        match self {
            OperationResponse::Uid(uid) => Ok(uid),
            other => Err(other.unexpected("uid")),
        }
    }

    pub fn expect_empty(self) -> ConnectorResult<()> {
        match self {
            OperationResponse::Empty => Ok(()),
            other => Err(other.unexpected("empty")),
        }
    }

    pub fn expect_maybe_object(self) -> ConnectorResult<Option<ConnectorObject>> {
        match self {
            OperationResponse::MaybeObject(object) => Ok(object),
            other => Err(other.unexpected("maybe_object")),
        }
    }

    pub fn expect_search(self) -> ConnectorResult<SearchResult> {
        match self {
            OperationResponse::Search(result) => Ok(result),
            other => Err(other.unexpected("search")),
        }
    }

    pub fn expect_sync_token(self) -> ConnectorResult<Option<SyncToken>> {
        match self {
            OperationResponse::SyncToken(token) => Ok(token),
            other => Err(other.unexpected("sync_token")),
        }
    }

    pub fn expect_schema(self) -> ConnectorResult<Schema> {
        match self {
            OperationResponse::Schema(schema) => Ok(schema),
            other => Err(other.unexpected("schema")),
        }
    }

    pub fn expect_script_result(self) -> ConnectorResult<Value> {
        match self {
            OperationResponse::ScriptResult(value) => Ok(value),
            other => Err(other.unexpected("script_result")),
        }
    }
}

// ============================================================================
// Request factory
// ============================================================================

/// Builds `OperationRequest` payloads and decodes their responses.
#[derive(Debug, Clone)]
pub struct OperationFactory {
    request: OperationRequest,
}

impl OperationFactory {
    pub fn new(configuration: ApiConfiguration, operation: Operation) -> Self {
        Self {
            request: OperationRequest {
                configuration,
                operation,
            },
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.request.operation
    }
}

impl RequestFactory<RemoteMessage> for OperationFactory {
    type Value = OperationResponse;

    fn create_payload(&self, _id: RequestId) -> RpcResult<RemoteMessage> {
        Ok(RemoteMessage::Request(self.request.clone()))
    }

    fn decode(&self, _id: RequestId, payload: RemoteMessage) -> RpcResult<OperationResponse> {
        match payload {
            RemoteMessage::Response(response) => Ok(response),
            other => Err(RpcError::decode(format!(
                "expected an operation response, got {}",
                other.kind()
            ))),
        }
    }
}
