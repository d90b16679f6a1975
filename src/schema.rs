//! Schema types for describing source plugin resources.
//!
//! Schemas are reported by the plugin during the handshake (`get_schema`) and
//! describe the shape of provider configuration, resources, and data sources
//! using the plugin's own (snake_case) property names. They drive validation,
//! state encoding, and diffing.
//!
//! Shapes form a closed tree: a property is a primitive, a collection of a
//! shape, or an object with its own [`ResourceSchema`]. Nested blocks from the
//! plugin's point of view are simply `List(Object(..))` / `Set(Object(..))`
//! shapes, optionally limited to a single item.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::value::PropertyValue;

/// The kind of a property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// A string value.
    String,
    /// A number (integer or float).
    Number,
    /// A boolean value.
    Bool,
    /// An ordered list of values of a single shape.
    List(Box<ShapeKind>),
    /// A set of unique values of a single shape.
    Set(Box<ShapeKind>),
    /// A map from string keys to values of a single shape.
    Map(Box<ShapeKind>),
    /// An object with its own properties.
    Object(Box<ResourceSchema>),
}

impl ShapeKind {
    /// Create a list shape.
    pub fn list(element: ShapeKind) -> Self {
        Self::List(Box::new(element))
    }

    /// Create a set shape.
    pub fn set(element: ShapeKind) -> Self {
        Self::Set(Box::new(element))
    }

    /// Create a map shape.
    pub fn map(element: ShapeKind) -> Self {
        Self::Map(Box::new(element))
    }

    /// Create an object shape.
    pub fn object(schema: ResourceSchema) -> Self {
        Self::Object(Box::new(schema))
    }

    /// Returns true for list and set shapes.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::List(_) | Self::Set(_))
    }

    /// Returns true for string, number, and bool shapes.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Bool)
    }

    /// A short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
        }
    }
}

/// Describes how a property can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ShapeFlags {
    /// The property is required in configuration.
    pub required: bool,
    /// The property is optional in configuration.
    pub optional: bool,
    /// The property is computed by the plugin.
    pub computed: bool,
    /// The property is sensitive and should be hidden in logs/UI.
    pub sensitive: bool,
}

impl ShapeFlags {
    /// Create flags for a required property.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional property.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed property (read-only, set by the plugin).
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional+computed property.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }

    /// Mark the property as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Describes a single property in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyShape {
    /// The kind of the property.
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    /// Flags describing how the property can be used.
    #[serde(flatten)]
    pub flags: ShapeFlags,
    /// If set, changing this property forces resource replacement.
    #[serde(default)]
    pub force_new: bool,
    /// Default value applied when the property is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<PropertyValue>,
    /// Minimum number of items for list/set shapes.
    #[serde(default)]
    pub min_items: u32,
    /// Maximum number of items for list/set shapes (0 = unlimited).
    #[serde(default)]
    pub max_items: u32,
    /// Allowed values for primitive shapes (empty = anything).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<PropertyValue>,
    /// Human-readable description of the property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyShape {
    /// Create a new property with the given kind and flags.
    pub fn new(kind: ShapeKind, flags: ShapeFlags) -> Self {
        Self {
            kind,
            flags,
            force_new: false,
            default: None,
            min_items: 0,
            max_items: 0,
            allowed_values: Vec::new(),
            description: None,
        }
    }

    /// Create a required string property.
    pub fn required_string() -> Self {
        Self::new(ShapeKind::String, ShapeFlags::required())
    }

    /// Create an optional string property.
    pub fn optional_string() -> Self {
        Self::new(ShapeKind::String, ShapeFlags::optional())
    }

    /// Create a computed string property.
    pub fn computed_string() -> Self {
        Self::new(ShapeKind::String, ShapeFlags::computed())
    }

    /// Create a required number property.
    pub fn required_number() -> Self {
        Self::new(ShapeKind::Number, ShapeFlags::required())
    }

    /// Create an optional number property.
    pub fn optional_number() -> Self {
        Self::new(ShapeKind::Number, ShapeFlags::optional())
    }

    /// Create a computed number property.
    pub fn computed_number() -> Self {
        Self::new(ShapeKind::Number, ShapeFlags::computed())
    }

    /// Create a required bool property.
    pub fn required_bool() -> Self {
        Self::new(ShapeKind::Bool, ShapeFlags::required())
    }

    /// Create an optional bool property.
    pub fn optional_bool() -> Self {
        Self::new(ShapeKind::Bool, ShapeFlags::optional())
    }

    /// Create a computed bool property.
    pub fn computed_bool() -> Self {
        Self::new(ShapeKind::Bool, ShapeFlags::computed())
    }

    /// Set the description for this property.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this property as forcing resource replacement when changed.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this property.
    pub fn with_default(mut self, default: PropertyValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the minimum number of items.
    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    /// Set the maximum number of items.
    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }

    /// Restrict the property to the given values.
    pub fn with_allowed_values(mut self, values: impl IntoIterator<Item = PropertyValue>) -> Self {
        self.allowed_values = values.into_iter().collect();
        self
    }

    /// Mark this property as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// Returns true if the property is set only by the plugin.
    pub fn is_computed_only(&self) -> bool {
        self.flags.computed && !self.flags.optional && !self.flags.required
    }

    /// Returns true for a list or set limited to a single item.
    pub fn is_single_item(&self) -> bool {
        self.kind.is_collection() && self.max_items == 1
    }
}

/// Schema for a resource, data source, nested object, or provider config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceSchema {
    /// The version of this schema (for state upgrades).
    #[serde(default)]
    pub version: u64,
    /// Properties keyed by source name, in name order.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyShape>,
    /// For a property, the properties implicitly invalidated when it changes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependents: BTreeMap<String, BTreeSet<String>>,
    /// Whether replacement must delete the old resource first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_before_replace: Option<bool>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ResourceSchema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add a property to the schema.
    pub fn with_property(mut self, name: impl Into<String>, shape: PropertyShape) -> Self {
        self.properties.insert(name.into(), shape);
        self
    }

    /// Declare the properties invalidated when `name` changes.
    pub fn with_dependents<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        dependents: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dependents
            .entry(name.into())
            .or_default()
            .extend(dependents.into_iter().map(Into::into));
        self
    }

    /// Declare the replacement order for this resource.
    pub fn with_delete_before_replace(mut self, delete_first: bool) -> Self {
        self.delete_before_replace = Some(delete_first);
        self
    }

    /// Set the description for this schema.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Look up a property by source name.
    pub fn property(&self, name: &str) -> Option<&PropertyShape> {
        self.properties.get(name)
    }
}

/// The complete schema reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Schema for provider configuration.
    #[serde(default)]
    pub provider: ResourceSchema,
    /// Schemas for each resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSchema>,
    /// Schemas for each data source type.
    #[serde(default)]
    pub data_sources: BTreeMap<String, ResourceSchema>,
}

impl ProviderSchema {
    /// Create a new empty provider schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider configuration schema.
    pub fn with_provider_config(mut self, schema: ResourceSchema) -> Self {
        self.provider = schema;
        self
    }

    /// Add a resource schema.
    pub fn with_resource(mut self, name: impl Into<String>, schema: ResourceSchema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Add a data source schema.
    pub fn with_data_source(mut self, name: impl Into<String>, schema: ResourceSchema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A diagnostic message about a property or an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The property path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the property path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Returns true for error diagnostics.
    pub fn is_error(&self) -> bool {
        matches!(self.severity, DiagnosticSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_kind_constructors() {
        let list = ShapeKind::list(ShapeKind::String);
        assert!(matches!(list, ShapeKind::List(_)));
        assert!(list.is_collection());

        let map = ShapeKind::map(ShapeKind::Number);
        assert!(matches!(map, ShapeKind::Map(_)));
        assert!(!map.is_collection());
        assert!(ShapeKind::Bool.is_primitive());
    }

    #[test]
    fn test_shape_flags() {
        let required = ShapeFlags::required();
        assert!(required.required);
        assert!(!required.optional);
        assert!(!required.computed);

        let optional_computed = ShapeFlags::optional_computed();
        assert!(!optional_computed.required);
        assert!(optional_computed.optional);
        assert!(optional_computed.computed);

        assert!(ShapeFlags::required().sensitive().sensitive);
    }

    #[test]
    fn test_property_builders() {
        let shape = PropertyShape::required_string()
            .with_description("The machine image")
            .with_force_new();

        assert_eq!(shape.kind, ShapeKind::String);
        assert!(shape.flags.required);
        assert_eq!(shape.description.as_deref(), Some("The machine image"));
        assert!(shape.force_new);
        assert!(!shape.is_computed_only());
        assert!(PropertyShape::computed_string().is_computed_only());
    }

    #[test]
    fn test_single_item_collections() {
        let block = PropertyShape::new(
            ShapeKind::list(ShapeKind::object(ResourceSchema::v0())),
            ShapeFlags::optional(),
        )
        .with_max_items(1);
        assert!(block.is_single_item());
        assert!(!PropertyShape::optional_string().with_max_items(1).is_single_item());
    }

    #[test]
    fn test_schema_builder() {
        let schema = ResourceSchema::new(2)
            .with_property("ami", PropertyShape::required_string().with_force_new())
            .with_property("public_ip", PropertyShape::computed_string())
            .with_dependents("ami", ["public_ip"])
            .with_delete_before_replace(true);

        assert_eq!(schema.version, 2);
        assert!(schema.property("ami").is_some());
        assert!(schema.dependents["ami"].contains("public_ip"));
        assert_eq!(schema.delete_before_replace, Some(true));
    }

    #[test]
    fn test_schema_json_shape() {
        let json = serde_json::json!({
            "version": 1,
            "properties": {
                "name": {"type": "string", "required": true},
                "tags": {"type": {"set": "string"}, "optional": true},
                "ingress": {
                    "type": {"list": {"object": {"properties": {
                        "port": {"type": "number", "required": true}
                    }}}},
                    "optional": true
                }
            }
        });
        let schema: ResourceSchema = serde_json::from_value(json).unwrap();
        assert!(schema.properties["name"].flags.required);
        assert_eq!(
            schema.properties["tags"].kind,
            ShapeKind::set(ShapeKind::String)
        );
        match &schema.properties["ingress"].kind {
            ShapeKind::List(inner) => match inner.as_ref() {
                ShapeKind::Object(nested) => assert!(nested.properties.contains_key("port")),
                other => panic!("unexpected element shape: {other:?}"),
            },
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid configuration")
            .with_detail("The value must be positive")
            .with_attribute("count");

        assert_eq!(err.severity, DiagnosticSeverity::Error);
        assert!(err.is_error());
        assert_eq!(err.detail, Some("The value must be positive".to_string()));
        assert_eq!(err.attribute, Some("count".to_string()));
    }
}
