//! Connector Framework schema types
//!
//! Object classes and attributes a connector reports for its resource.

use serde::{Deserialize, Serialize};

/// Structure of a target system as reported by its connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// The object classes available in this schema.
    pub object_classes: Vec<ObjectClassInfo>,
}

impl Schema {
    /// Create a new empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object class using builder pattern.
    #[must_use]
    pub fn with_object_class(mut self, object_class: ObjectClassInfo) -> Self {
        self.object_classes.push(object_class);
        self
    }

    /// Find an object class by name.
    #[must_use]
    pub fn get_object_class(&self, name: &str) -> Option<&ObjectClassInfo> {
        self.object_classes.iter().find(|oc| oc.name == name)
    }

    /// Check if an object class exists.
    #[must_use]
    pub fn has_object_class(&self, name: &str) -> bool {
        self.get_object_class(name).is_some()
    }
}

/// One object class of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectClassInfo {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeInfo>,
}

impl ObjectClassInfo {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    /// Add an attribute using builder pattern.
    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeInfo) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Names of the attributes that must be present on create.
    pub fn required_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
    }
}

/// One attribute of an object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multi_valued: bool,
}

impl AttributeInfo {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            multi_valued: false,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn multi_valued(mut self) -> Self {
        self.multi_valued = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lookup() {
        let schema = Schema::new().with_object_class(
            ObjectClassInfo::new("account")
                .with_attribute(AttributeInfo::new("name").required())
                .with_attribute(AttributeInfo::new("groups").multi_valued()),
        );

        let account = schema.get_object_class("account").unwrap();
        assert_eq!(account.required_attributes().collect::<Vec<_>>(), vec!["name"]);
        assert!(schema.has_object_class("account"));
        assert!(!schema.has_object_class("group"));
    }
}
