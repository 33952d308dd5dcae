//! Connector Framework operation types
//!
//! The object model seen at the connector boundary: UIDs, attribute sets,
//! objects, filters, sync deltas, operation options and script contexts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Unique identifier for an object in a target system.
///
/// Different systems use different identifier schemes:
/// - LDAP: Distinguished Name (DN) or entryUUID
/// - Database: Primary key column value
/// - CSV: Key column value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    /// The attribute name used as the identifier (e.g., "dn", "id", "uid").
    attribute_name: String,
    /// The actual value of the identifier.
    value: String,
}

impl Uid {
    /// Create a new UID with the given attribute name and value.
    pub fn new(attribute_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            value: value.into(),
        }
    }

    /// Create a UID using the default "uid" attribute name.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::new("uid", value)
    }

    /// Get the attribute name.
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// Get the value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.attribute_name, self.value)
    }
}

/// A set of attributes for create/update operations or search results.
///
/// Ordered by name so the serialized form is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Set an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Get a multi-valued string attribute.
    pub fn get_strings(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name).map(|v| v.as_strings())
    }

    /// Check if an attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Get all attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|s| s.as_str())
    }

    /// Get the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    /// Keep only the named attributes.
    pub fn retain_names(&mut self, names: &[String]) {
        self.attributes.retain(|name, _| names.iter().any(|n| n == name));
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// A value for an attribute, which may be single or multi-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value (null).
    Null,
    /// A single string value.
    String(String),
    /// A single integer value.
    Integer(i64),
    /// A single boolean value.
    Boolean(bool),
    /// A single floating-point value.
    Float(f64),
    /// Multiple values.
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().filter_map(|v| v.as_string()).collect(),
            _ => vec![],
        }
    }

    /// Get as an integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a boolean if this is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Check if this is multi-valued.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, AttributeValue::Array(_))
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(vec: Vec<T>) -> Self {
        AttributeValue::Array(vec.into_iter().map(Into::into).collect())
    }
}

/// An object read from a target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorObject {
    pub object_class: String,
    pub uid: Uid,
    #[serde(default)]
    pub attributes: AttributeSet,
}

impl ConnectorObject {
    /// Create an object with no attributes.
    pub fn new(object_class: impl Into<String>, uid: Uid) -> Self {
        Self {
            object_class: object_class.into(),
            uid,
            attributes: AttributeSet::new(),
        }
    }

    /// Set the attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Filter for search operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match objects where attribute equals value.
    Equals { attribute: String, value: String },

    /// Match objects where attribute contains value (substring).
    Contains { attribute: String, value: String },

    /// Match objects where attribute starts with value.
    StartsWith { attribute: String, value: String },

    /// Match objects where attribute exists (has any value).
    Present { attribute: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical OR of multiple filters.
    Or { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a filter matching one object by UID.
    pub fn uid(uid: &Uid) -> Self {
        Filter::eq(uid.attribute_name(), uid.value())
    }

    /// Create a contains filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a starts-with filter.
    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::StartsWith {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present (attribute exists) filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create a NOT filter (negation).
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine this filter with another using AND.
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }

    /// Combine this filter with another using OR.
    pub fn or_with(self, other: Filter) -> Self {
        match self {
            Filter::Or { mut filters } => {
                filters.push(other);
                Filter::Or { filters }
            }
            _ => Filter::Or {
                filters: vec![self, other],
            },
        }
    }

    /// Evaluate the filter against an object.
    ///
    /// The UID attribute name matches the object's UID as well as a regular
    /// attribute of that name.
    pub fn matches(&self, object: &ConnectorObject) -> bool {
        let values = |attribute: &str| -> Vec<String> {
            let mut values: Vec<String> = object
                .attributes
                .get(attribute)
                .map(|v| v.as_strings().into_iter().map(str::to_string).collect())
                .unwrap_or_default();
            if object.uid.attribute_name() == attribute {
                values.push(object.uid.value().to_string());
            }
            values
        };

        match self {
            Filter::Equals { attribute, value } => values(attribute).iter().any(|v| v == value),
            Filter::Contains { attribute, value } => {
                values(attribute).iter().any(|v| v.contains(value.as_str()))
            }
            Filter::StartsWith { attribute, value } => values(attribute)
                .iter()
                .any(|v| v.starts_with(value.as_str())),
            Filter::Present { attribute } => {
                object.attributes.has(attribute) || object.uid.attribute_name() == attribute
            }
            Filter::And { filters } => filters.iter().all(|f| f.matches(object)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(object)),
            Filter::Not { filter } => !filter.matches(object),
        }
    }
}

/// Receives streamed items from a connector.
///
/// Returning `false` asks the connector to stop producing.
pub trait ResultsHandler<T>: Send + Sync {
    fn handle(&self, item: T) -> bool;
}

impl<T, F> ResultsHandler<T> for F
where
    F: Fn(T) -> bool + Send + Sync,
{
    fn handle(&self, item: T) -> bool {
        self(item)
    }
}

/// Summary returned once a search finished streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Cookie for the next page, if the search was paged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paged_results_cookie: Option<String>,

    /// Results left after this page, or -1 if unknown.
    pub remaining_paged_results: i64,

    /// False when the handler stopped the search early.
    pub all_results_returned: bool,
}

impl SearchResult {
    /// Create a result for a search that returned everything.
    pub fn complete() -> Self {
        Self {
            paged_results_cookie: None,
            remaining_paged_results: -1,
            all_results_returned: true,
        }
    }

    /// Create a result for a search stopped by its handler.
    pub fn stopped() -> Self {
        Self {
            all_results_returned: false,
            ..Self::complete()
        }
    }

    /// Set the paged results cookie.
    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<String>, remaining: i64) -> Self {
        self.paged_results_cookie = Some(cookie.into());
        self.remaining_paged_results = remaining;
        self
    }
}

impl Default for SearchResult {
    fn default() -> Self {
        Self::complete()
    }
}

/// Position in a target system's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncToken(pub Value);

impl SyncToken {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Type of change reported by a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDeltaType {
    CreateOrUpdate,
    Delete,
}

/// One change reported by a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub token: SyncToken,
    pub delta_type: SyncDeltaType,
    pub uid: Uid,
    /// Current state of the object; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ConnectorObject>,
}

/// Options accompanying an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Attributes to return; all when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes_to_get: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paged_results_cookie: Option<String>,

    /// Run the operation on behalf of this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<String>,

    /// Connector-specific options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl OperationOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attributes to return.
    #[must_use]
    pub fn with_attributes_to_get(mut self, names: Vec<String>) -> Self {
        self.attributes_to_get = Some(names);
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Set a connector-specific option.
    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// A script to run on the connector or through it on the resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    pub language: String,
    pub text: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

impl ScriptContext {
    pub fn new(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            text: text.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Add a script argument.
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ConnectorObject {
        ConnectorObject::new("account", Uid::from_value("alice")).with_attributes(
            AttributeSet::new()
                .with("email", "alice@example.com")
                .with("groups", vec!["admins", "users"]),
        )
    }

    #[test]
    fn test_uid_creation() {
        let uid = Uid::new("dn", "cn=john,ou=users,dc=example,dc=com");
        assert_eq!(uid.attribute_name(), "dn");
        assert_eq!(uid.value(), "cn=john,ou=users,dc=example,dc=com");
        assert_eq!(uid.to_string(), "dn=cn=john,ou=users,dc=example,dc=com");
    }

    #[test]
    fn test_attribute_set() {
        let attrs = AttributeSet::new()
            .with("email", "john@example.com")
            .with("age", 30i64)
            .with("active", true);

        assert_eq!(attrs.get_string("email"), Some("john@example.com"));
        assert_eq!(attrs.get("age").and_then(|v| v.as_integer()), Some(30));
        assert_eq!(attrs.get("active").and_then(|v| v.as_boolean()), Some(true));
        assert!(!attrs.has("nonexistent"));
    }

    #[test]
    fn test_retain_names() {
        let mut attrs = alice().attributes;
        attrs.retain_names(&["email".to_string()]);
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["email"]);
    }

    #[test]
    fn test_filter_matches() {
        let object = alice();

        assert!(Filter::uid(&object.uid).matches(&object));
        assert!(Filter::eq("groups", "admins").matches(&object));
        assert!(Filter::starts_with("email", "alice@").matches(&object));
        assert!(!Filter::eq("email", "bob@example.com").matches(&object));
        assert!(Filter::negate(Filter::present("phone")).matches(&object));
        assert!(Filter::eq("email", "nobody")
            .or_with(Filter::contains("email", "example"))
            .matches(&object));
        assert!(!Filter::present("email")
            .and_with(Filter::present("phone"))
            .matches(&object));
    }

    #[test]
    fn test_closure_results_handler() {
        let handler = |object: ConnectorObject| object.uid.value() != "stop";
        assert!(handler.handle(alice()));
        assert!(!handler.handle(ConnectorObject::new("account", Uid::from_value("stop"))));
    }

    #[test]
    fn test_object_serialization_is_stable() {
        let json = serde_json::to_string(&alice()).unwrap();
        let again = serde_json::to_string(&alice()).unwrap();
        assert_eq!(json, again);

        let parsed: ConnectorObject = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, alice());
    }

    #[test]
    fn test_search_result() {
        let result = SearchResult::complete().with_cookie("page-2", 40);
        assert_eq!(result.paged_results_cookie.as_deref(), Some("page-2"));
        assert_eq!(result.remaining_paged_results, 40);
        assert!(result.all_results_returned);
        assert!(!SearchResult::stopped().all_results_returned);
    }
}
