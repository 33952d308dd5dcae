//! Connector Framework ID types
//!
//! Newtype wrappers for type-safe identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies a connector implementation: the bundle that ships it, the
/// bundle version and the connector name inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorKey {
    pub bundle_name: String,
    pub bundle_version: String,
    pub connector_name: String,
}

impl ConnectorKey {
    /// Create a new connector key.
    pub fn new(
        bundle_name: impl Into<String>,
        bundle_version: impl Into<String>,
        connector_name: impl Into<String>,
    ) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            bundle_version: bundle_version.into(),
            connector_name: connector_name.into(),
        }
    }
}

impl fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.bundle_name, self.bundle_version, self.connector_name
        )
    }
}

impl FromStr for ConnectorKey {
    type Err = ParseConnectorKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(bundle), Some(version), Some(name))
                if !bundle.is_empty() && !version.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(bundle, version, name))
            }
            _ => Err(ParseConnectorKeyError(s.to_string())),
        }
    }
}

/// Error parsing a connector key from string.
#[derive(Debug, Clone)]
pub struct ParseConnectorKeyError(String);

impl fmt::Display for ParseConnectorKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid connector key '{}', expected bundle:version:connector",
            self.0
        )
    }
}

impl std::error::Error for ParseConnectorKeyError {}

/// Opaque handle on an asynchronous batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchToken(Uuid);

impl BatchToken {
    /// Create a new random BatchToken.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a BatchToken from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse from a string representation.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for BatchToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for BatchToken {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BatchToken> for Uuid {
    fn from(token: BatchToken) -> Self {
        token.0
    }
}
