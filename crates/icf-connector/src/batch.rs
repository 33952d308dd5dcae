//! Batch execution types
//!
//! A batch is an ordered list of create/update/delete tasks run as one
//! operation. Connectors that execute batches natively stream their results
//! through a [`BatchSink`]; the framework decides how those results reach
//! the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;
use crate::operation::{AttributeSet, OperationOptions, Uid};
use crate::types::{OperationKind, UpdateType};

/// One task of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchTask {
    Create {
        object_class: String,
        attributes: AttributeSet,
        #[serde(default)]
        options: OperationOptions,
    },
    Update {
        object_class: String,
        uid: Uid,
        #[serde(default)]
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
}

impl BatchTask {
    /// Create a create task.
    pub fn create(object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        BatchTask::Create {
            object_class: object_class.into(),
            attributes,
            options: OperationOptions::default(),
        }
    }

    /// Create a replace update task.
    pub fn update(object_class: impl Into<String>, uid: Uid, attributes: AttributeSet) -> Self {
        BatchTask::Update {
            object_class: object_class.into(),
            uid,
            update_type: UpdateType::Replace,
            attributes,
            options: OperationOptions::default(),
        }
    }

    /// Create a delete task.
    pub fn delete(object_class: impl Into<String>, uid: Uid) -> Self {
        BatchTask::Delete {
            object_class: object_class.into(),
            uid,
            options: OperationOptions::default(),
        }
    }

    /// The single operation this task maps to.
    pub fn operation(&self) -> OperationKind {
        match self {
            BatchTask::Create { .. } => OperationKind::Create,
            BatchTask::Update { .. } => OperationKind::Update,
            BatchTask::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn object_class(&self) -> &str {
        match self {
            BatchTask::Create { object_class, .. }
            | BatchTask::Update { object_class, .. }
            | BatchTask::Delete { object_class, .. } => object_class,
        }
    }
}

/// What one task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// UID of the created or updated object.
    Uid { uid: Uid },
    /// No value, with a short description (deletes).
    Empty { message: String },
    /// The task failed.
    Error { code: String, message: String },
}

impl BatchOutcome {
    /// Outcome describing a connector error.
    pub fn from_error(err: &ConnectorError) -> Self {
        let fault = err.to_fault();
        BatchOutcome::Error {
            code: fault.code,
            message: fault.message,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, BatchOutcome::Error { .. })
    }
}

/// One result streamed out of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub result: BatchOutcome,

    /// Identifies the task the result belongs to. Results with an id
    /// already delivered are dropped.
    pub result_id: String,

    /// Set on the last result of the batch.
    pub complete: bool,

    pub error: bool,
}

impl BatchResult {
    /// Result for a task that succeeded.
    pub fn success(result_id: impl Into<String>, result: BatchOutcome) -> Self {
        Self {
            error: result.is_error(),
            result,
            result_id: result_id.into(),
            complete: false,
        }
    }

    /// Result for a task that failed.
    pub fn failure(result_id: impl Into<String>, err: &ConnectorError) -> Self {
        Self {
            result: BatchOutcome::from_error(err),
            result_id: result_id.into(),
            complete: false,
            error: true,
        }
    }

    /// Mark this as the last result.
    #[must_use]
    pub fn completing(mut self) -> Self {
        self.complete = true;
        self
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch result {}", self.result_id)?;
        if self.error {
            write!(f, " (error)")?;
        }
        if self.complete {
            write!(f, " (complete)")?;
        }
        Ok(())
    }
}

/// Options of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Stop at the first failing task.
    #[serde(default)]
    pub fail_on_error: bool,
}

impl BatchOptions {
    #[must_use]
    pub fn fail_on_error() -> Self {
        Self {
            fail_on_error: true,
        }
    }
}

/// Receiver of native batch output, implemented by the framework.
pub trait BatchListener: Send + Sync {
    /// Accept one result. Returning `false` tells the connector to stop.
    fn on_result(&self, result: BatchResult) -> bool;

    /// The batch failed as a whole.
    fn on_failure(&self, error: ConnectorError);

    /// Every sink handle was dropped.
    fn on_abandoned(&self);
}

struct SinkInner {
    listener: Arc<dyn BatchListener>,
    cancel: CancellationToken,
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        self.listener.on_abandoned();
    }
}

/// Handle through which a connector reports batch results.
///
/// Cheap to clone; connectors running a batch in the background move a
/// clone into their task. Dropping the last handle tells the framework no
/// further result will arrive.
#[derive(Clone)]
pub struct BatchSink {
    inner: Arc<SinkInner>,
}

impl BatchSink {
    /// Create a sink reporting to a listener.
    pub fn new(listener: Arc<dyn BatchListener>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SinkInner { listener, cancel }),
        }
    }

    /// Report a result. Returns `false` once the batch is cancelled or the
    /// listener no longer wants results.
    pub fn send(&self, result: BatchResult) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        self.inner.listener.on_result(result)
    }

    /// Fail the batch as a whole.
    pub fn fail(&self, error: ConnectorError) {
        self.inner.listener.on_failure(error);
    }

    /// Check if the caller cancelled the batch.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the caller cancels the batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl fmt::Debug for BatchSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSink")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
