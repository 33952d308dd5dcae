//! Connector Framework type definitions
//!
//! Operation kinds, capability sets and the enums describing how a
//! connector takes part in updates and batches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Every operation a facade can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Get,
    Search,
    Sync,
    Authenticate,
    ResolveUsername,
    ScriptOnConnector,
    ScriptOnResource,
    Test,
    Schema,
    Validate,
    Batch,
}

impl OperationKind {
    /// Get all operation kinds.
    #[must_use]
    pub fn all() -> &'static [OperationKind] {
        &[
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
            OperationKind::Get,
            OperationKind::Search,
            OperationKind::Sync,
            OperationKind::Authenticate,
            OperationKind::ResolveUsername,
            OperationKind::ScriptOnConnector,
            OperationKind::ScriptOnResource,
            OperationKind::Test,
            OperationKind::Schema,
            OperationKind::Validate,
            OperationKind::Batch,
        ]
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Get => "get",
            OperationKind::Search => "search",
            OperationKind::Sync => "sync",
            OperationKind::Authenticate => "authenticate",
            OperationKind::ResolveUsername => "resolve_username",
            OperationKind::ScriptOnConnector => "script_on_connector",
            OperationKind::ScriptOnResource => "script_on_resource",
            OperationKind::Test => "test",
            OperationKind::Schema => "schema",
            OperationKind::Validate => "validate",
            OperationKind::Batch => "batch",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ParseOperationKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        OperationKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| ParseOperationKindError(s.to_string()))
    }
}

/// Error parsing operation kind from string.
#[derive(Debug, Clone)]
pub struct ParseOperationKindError(String);

impl fmt::Display for ParseOperationKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation kind '{}'", self.0)
    }
}

impl std::error::Error for ParseOperationKindError {}

/// The closed set of operations a connector declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<OperationKind>);

impl CapabilitySet {
    /// Create an empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set from a list of kinds.
    #[must_use]
    pub fn of(kinds: &[OperationKind]) -> Self {
        Self(kinds.iter().copied().collect())
    }

    /// Create a set holding every operation kind.
    #[must_use]
    pub fn all() -> Self {
        Self::of(OperationKind::all())
    }

    /// Add a kind using builder pattern.
    #[must_use]
    pub fn with(mut self, kind: OperationKind) -> Self {
        self.0.insert(kind);
        self
    }

    /// Add a kind.
    pub fn insert(&mut self, kind: OperationKind) {
        self.0.insert(kind);
    }

    /// Check if a kind is declared.
    #[must_use]
    pub fn supports(&self, kind: OperationKind) -> bool {
        self.0.contains(&kind)
    }

    /// Iterate over the declared kinds in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.0.iter().copied()
    }

    /// Number of declared kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<OperationKind> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = OperationKind>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How an update applies its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// Replace the current values.
    #[default]
    Replace,
    /// Add values to multi-valued attributes.
    AddValues,
    /// Remove values from multi-valued attributes.
    RemoveValues,
}

impl UpdateType {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Replace => "replace",
            UpdateType::AddValues => "add_values",
            UpdateType::RemoveValues => "remove_values",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a connector executes batches natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchSupport {
    /// No native support; the framework runs each task itself.
    #[default]
    None,
    /// All results are produced before `execute_batch` returns.
    Synchronous,
    /// Runs in the background; results are collected by querying the token.
    Token,
    /// Runs in the background and pushes results as they are produced.
    Callback,
}

impl BatchSupport {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchSupport::None => "none",
            BatchSupport::Synchronous => "synchronous",
            BatchSupport::Token => "token",
            BatchSupport::Callback => "callback",
        }
    }

    /// Check if the connector keeps running after `execute_batch` returns.
    #[must_use]
    pub fn is_asynchronous(&self) -> bool {
        matches!(self, BatchSupport::Token | BatchSupport::Callback)
    }
}

impl fmt::Display for BatchSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
