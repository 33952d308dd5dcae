//! Connector Framework configuration types
//!
//! Connectors describe their configuration with a declarative
//! [`ConfigurationSchema`]: a table of property name to kind, default,
//! required and confidential flags. Raw JSON properties are bound against
//! it into a typed [`Configuration`].
//!
//! [`ApiConfiguration`] is what callers hand to the framework: the connector
//! key, the raw properties, pool settings and per-operation timeouts. Its
//! canonical key identifies one facade instance.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::error::{ConnectorError, ConnectorResult};
use crate::ids::ConnectorKey;
use crate::types::OperationKind;

const REDACTED: &str = "********";

// ============================================================================
// Declarative schema
// ============================================================================

/// Value kind of a configuration property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    String,
    Integer,
    Boolean,
    Float,
    StringList,
    /// Any JSON value.
    Json,
}

impl PropertyKind {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Integer => "integer",
            PropertyKind::Boolean => "boolean",
            PropertyKind::Float => "float",
            PropertyKind::StringList => "string_list",
            PropertyKind::Json => "json",
        }
    }

    /// Check if a JSON value has this kind.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyKind::String => value.is_string(),
            PropertyKind::Integer => value.is_i64() || value.is_u64(),
            PropertyKind::Boolean => value.is_boolean(),
            PropertyKind::Float => value.is_number(),
            PropertyKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            PropertyKind::Json => true,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declaration of one configuration property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub kind: PropertyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    /// Never logged or displayed.
    #[serde(default)]
    pub confidential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl PropertySpec {
    /// Create an optional property of the given kind.
    #[must_use]
    pub fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            default: None,
            required: false,
            confidential: false,
            help: None,
        }
    }

    #[must_use]
    pub fn string() -> Self {
        Self::new(PropertyKind::String)
    }

    #[must_use]
    pub fn integer() -> Self {
        Self::new(PropertyKind::Integer)
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::new(PropertyKind::Boolean)
    }

    #[must_use]
    pub fn string_list() -> Self {
        Self::new(PropertyKind::StringList)
    }

    /// Mark the property as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the property as confidential.
    #[must_use]
    pub fn confidential(mut self) -> Self {
        self.confidential = true;
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the help text.
    #[must_use]
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

/// The configuration properties a connector accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationSchema {
    properties: BTreeMap<String, PropertySpec>,
}

impl ConfigurationSchema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a property using builder pattern.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, spec: PropertySpec) -> Self {
        self.properties.insert(name.into(), spec);
        self
    }

    /// Get a property declaration.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.get(name)
    }

    /// Iterate over the declarations by name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertySpec)> {
        self.properties.iter()
    }

    /// Bind raw properties into a configuration.
    ///
    /// Applies defaults and rejects unknown names, missing required values
    /// and values of the wrong kind.
    pub fn bind(&self, raw: &Map<String, Value>) -> ConnectorResult<Configuration> {
        if let Some(unknown) = raw.keys().find(|name| !self.properties.contains_key(*name)) {
            return Err(ConnectorError::invalid_configuration(format!(
                "unknown configuration property '{unknown}'"
            )));
        }

        let mut values = BTreeMap::new();
        let mut confidential = BTreeSet::new();
        for (name, spec) in &self.properties {
            let value = raw
                .get(name)
                .filter(|v| !v.is_null())
                .or(spec.default.as_ref());
            match value {
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(ConnectorError::invalid_configuration(format!(
                        "property '{name}' must be of kind {}",
                        spec.kind
                    )));
                }
                Some(value) => {
                    values.insert(name.clone(), value.clone());
                }
                None if spec.required => {
                    return Err(ConnectorError::invalid_configuration(format!(
                        "missing required property '{name}'"
                    )));
                }
                None => {}
            }
            if spec.confidential {
                confidential.insert(name.clone());
            }
        }

        Ok(Configuration {
            values,
            confidential,
        })
    }
}

/// Configuration bound against a [`ConfigurationSchema`].
#[derive(Clone, Default, PartialEq)]
pub struct Configuration {
    values: BTreeMap<String, Value>,
    confidential: BTreeSet<String>,
}

impl Configuration {
    /// Get a raw value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_strings(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
    }

    /// Check if a property is confidential.
    pub fn is_confidential(&self, name: &str) -> bool {
        self.confidential.contains(name)
    }

    /// All values, with confidential ones replaced by a placeholder.
    pub fn redacted(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| {
                let shown = if self.is_confidential(name) {
                    Value::String(REDACTED.to_string())
                } else {
                    value.clone()
                };
                (name.clone(), shown)
            })
            .collect()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.redacted()).finish()
    }
}

// ============================================================================
// Pool configuration
// ============================================================================

/// Settings of the connector instance pool behind a facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of instances checked out or idle.
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,

    /// Maximum number of idle instances kept.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Idle instances kept by eviction.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Longest wait for a free instance, in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Idle time after which an instance may be evicted, in milliseconds.
    #[serde(default = "default_min_evictable_idle_ms")]
    pub min_evictable_idle_ms: u64,
}

fn default_max_objects() -> usize {
    10
}

fn default_max_idle() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_max_wait_ms() -> u64 {
    150_000
}

fn default_min_evictable_idle_ms() -> u64 {
    120_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_objects: default_max_objects(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            max_wait_ms: default_max_wait_ms(),
            min_evictable_idle_ms: default_min_evictable_idle_ms(),
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of instances.
    #[must_use]
    pub fn with_max_objects(mut self, max: usize) -> Self {
        self.max_objects = max;
        self
    }

    /// Set the maximum number of idle instances.
    #[must_use]
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = max;
        self
    }

    /// Set the number of idle instances kept by eviction.
    #[must_use]
    pub fn with_min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    /// Set the checkout wait limit.
    #[must_use]
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = duration_ms(wait);
        self
    }

    /// Set the idle time after which instances may be evicted.
    #[must_use]
    pub fn with_min_evictable_idle(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_ms = duration_ms(idle);
        self
    }

    /// Get the checkout wait limit as Duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Get the eviction idle threshold as Duration.
    pub fn min_evictable_idle(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_ms)
    }

    /// Validate the settings.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.max_objects == 0 {
            return Err(ConnectorError::invalid_configuration(
                "pool max_objects must be at least 1",
            ));
        }
        if self.min_idle > self.max_idle {
            return Err(ConnectorError::invalid_configuration(
                "pool min_idle must not exceed max_idle",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// API configuration
// ============================================================================

/// Everything needed to build one connector facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfiguration {
    pub connector: ConnectorKey,

    /// Raw connector properties, bound against the connector's schema.
    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-operation timeouts in milliseconds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timeouts: BTreeMap<OperationKind, u64>,
}

impl ApiConfiguration {
    /// Create a configuration with no properties.
    pub fn new(connector: ConnectorKey) -> Self {
        Self {
            connector,
            properties: Map::new(),
            pool: PoolConfig::default(),
            timeouts: BTreeMap::new(),
        }
    }

    /// Set a raw property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the pool settings.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the timeout of one operation.
    #[must_use]
    pub fn with_timeout(mut self, operation: OperationKind, timeout: Duration) -> Self {
        self.timeouts.insert(operation, duration_ms(timeout));
        self
    }

    /// Get the timeout of one operation, if any.
    pub fn timeout_for(&self, operation: OperationKind) -> Option<Duration> {
        self.timeouts
            .get(&operation)
            .map(|ms| Duration::from_millis(*ms))
    }

    /// Stable identity of this configuration.
    ///
    /// Base64 SHA-256 of the JSON form with object keys sorted, so equal
    /// configurations produce the same key regardless of property order.
    pub fn canonical_key(&self) -> ConnectorResult<String> {
        let value = canonicalize(serde_json::to_value(self)?);
        let bytes = serde_json::to_vec(&value)?;
        Ok(STANDARD.encode(Sha256::digest(&bytes)))
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
