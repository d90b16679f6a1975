//! Schema validation helpers.
//!
//! This module validates [`PropertyValue`] trees against a [`ResourceSchema`]
//! and reports every problem as a [`Diagnostic`]. The bridge uses it for
//! Check, Configure, and Invoke arguments.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_bridge::schema::{PropertyShape, ResourceSchema};
//! use hemmer_provider_bridge::validation::validate;
//! use hemmer_provider_bridge::value::PropertyValue;
//!
//! let schema = ResourceSchema::v0()
//!     .with_property("name", PropertyShape::required_string())
//!     .with_property("count", PropertyShape::optional_number());
//!
//! // Valid input
//! let input = PropertyValue::map(vec![
//!     ("name", PropertyValue::from("test")),
//!     ("count", PropertyValue::from(42i64)),
//! ]);
//! assert!(validate(&schema, &input).is_empty());
//!
//! // Invalid input - wrong type for count
//! let input = PropertyValue::map(vec![
//!     ("name", PropertyValue::from("test")),
//!     ("count", PropertyValue::from("not a number")),
//! ]);
//! let diagnostics = validate(&schema, &input);
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("count".to_string()));
//! ```

use crate::schema::{Diagnostic, DiagnosticSeverity, PropertyShape, ResourceSchema, ShapeKind};
use crate::value::PropertyValue;

/// Validate a property map against a schema.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the value is valid.
///
/// # Validation Rules
///
/// - Required properties must be present and non-null
/// - Optional properties may be absent or null
/// - Computed-only properties are skipped (the plugin sets these)
/// - Properties the schema does not declare are rejected
/// - Types, allowed values, and list/set item counts must match the schema
/// - Unknown values are accepted anywhere; they are checked once known
pub fn validate(schema: &ResourceSchema, value: &PropertyValue) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_object(schema, value, "", &mut diagnostics);
    diagnostics
}

/// Validate a property map, returning Ok if valid or Err with diagnostics.
///
/// This is a convenience wrapper around [`validate`] that returns a Result.
pub fn validate_result(schema: &ResourceSchema, value: &PropertyValue) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Check if a property map is valid against a schema.
///
/// Use [`validate`] to get detailed error information.
pub fn is_valid(schema: &ResourceSchema, value: &PropertyValue) -> bool {
    validate(schema, value).is_empty()
}

fn validate_object(
    schema: &ResourceSchema,
    value: &PropertyValue,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let map = match value.reveal() {
        PropertyValue::Map(map) => map,
        PropertyValue::Null | PropertyValue::Unknown => {
            // Nothing to check yet, but required properties are still missing
            if value.is_null() {
                for (name, shape) in &schema.properties {
                    validate_property(shape, None, &join_path(path, name), diagnostics);
                }
            }
            return;
        },
        other => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", other.kind_name()))
                    .with_attribute_if_not_empty(path),
            );
            return;
        },
    };

    for (name, shape) in &schema.properties {
        validate_property(shape, map.get(name), &join_path(path, name), diagnostics);
    }

    for name in map.keys().filter(|k| !schema.properties.contains_key(*k)) {
        let prop_path = join_path(path, name);
        diagnostics.push(
            Diagnostic::error(format!("Unknown property '{}'", prop_path))
                .with_detail("The schema does not declare this property")
                .with_attribute(prop_path),
        );
    }
}

fn validate_property(
    shape: &PropertyShape,
    value: Option<&PropertyValue>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Skip computed-only properties (plugin sets these)
    if shape.is_computed_only() {
        return;
    }

    match value.map(PropertyValue::reveal) {
        None | Some(PropertyValue::Null) => {
            if shape.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required property '{}'", path))
                        .with_detail("This property is required and must be provided")
                        .with_attribute(path),
                );
            } else if shape.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Property '{}' requires at least {} item(s)",
                        path, shape.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        Some(PropertyValue::Unknown) => {},
        Some(v) => {
            validate_kind(&shape.kind, v, path, diagnostics);
            validate_items(shape, v, path, diagnostics);
            validate_allowed(shape, v, path, diagnostics);
        },
    }
}

fn validate_kind(kind: &ShapeKind, value: &PropertyValue, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let value = value.reveal();
    if value.is_unknown() {
        return;
    }
    match kind {
        ShapeKind::String => {
            if !matches!(value, PropertyValue::String(_)) {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        ShapeKind::Number => {
            if !matches!(value, PropertyValue::Number(_)) {
                diagnostics.push(type_error(path, "number", value));
            }
        },
        ShapeKind::Bool => {
            if !matches!(value, PropertyValue::Bool(_)) {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        ShapeKind::List(element) | ShapeKind::Set(element) => match value {
            // Lists and sets are interchangeable on input
            PropertyValue::List(items) | PropertyValue::Set(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}.{}", path, i);
                    validate_kind(element, item, &item_path, diagnostics);
                }
            },
            _ => diagnostics.push(type_error(path, kind.name(), value)),
        },
        ShapeKind::Map(element) => match value {
            PropertyValue::Map(entries) => {
                for (key, item) in entries {
                    let key_path = format!("{}.{}", path, key);
                    validate_kind(element, item, &key_path, diagnostics);
                }
            },
            _ => diagnostics.push(type_error(path, "map", value)),
        },
        ShapeKind::Object(schema) => match value {
            PropertyValue::Map(_) => validate_object(schema, value, path, diagnostics),
            _ => diagnostics.push(type_error(path, "object", value)),
        },
    }
}

fn validate_items(shape: &PropertyShape, value: &PropertyValue, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let len = match value {
        PropertyValue::List(items) | PropertyValue::Set(items) => items.len() as u32,
        _ => return,
    };

    // Check min_items
    if len < shape.min_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Property '{}' requires at least {} item(s), got {}",
                path, shape.min_items, len
            ))
            .with_attribute(path),
        );
    }

    // Check max_items (0 means unlimited)
    if shape.max_items > 0 && len > shape.max_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Property '{}' allows at most {} item(s), got {}",
                path, shape.max_items, len
            ))
            .with_attribute(path),
        );
    }
}

fn validate_allowed(shape: &PropertyShape, value: &PropertyValue, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    if shape.allowed_values.is_empty() || !shape.kind.is_primitive() {
        return;
    }
    if !shape.allowed_values.iter().any(|a| a.semantically_eq(value)) {
        let allowed: Vec<String> = shape.allowed_values.iter().map(|a| a.to_string()).collect();
        diagnostics.push(
            Diagnostic::error(format!("Invalid value for property '{}'", path))
                .with_detail(format!("Expected one of {}, got {}", allowed.join(", "), value))
                .with_attribute(path),
        );
    }
}

// Helper functions

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn type_error(path: &str, expected: &str, got: &PropertyValue) -> Diagnostic {
    Diagnostic {
        severity: DiagnosticSeverity::Error,
        summary: format!("Invalid type for property '{}'", path),
        detail: Some(format!("Expected {}, got {}", expected, got.kind_name())),
        attribute: Some(path.to_string()),
    }
}

trait DiagnosticExt {
    fn with_attribute_if_not_empty(self, path: &str) -> Self;
}

impl DiagnosticExt for Diagnostic {
    fn with_attribute_if_not_empty(self, path: &str) -> Self {
        if path.is_empty() {
            self
        } else {
            self.with_attribute(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ShapeFlags;

    fn map(entries: Vec<(&str, PropertyValue)>) -> PropertyValue {
        PropertyValue::map(entries)
    }

    #[test]
    fn test_validate_required_string() {
        let schema = ResourceSchema::v0().with_property("name", PropertyShape::required_string());

        // Valid
        let diagnostics = validate(&schema, &map(vec![("name", "test".into())]));
        assert!(diagnostics.is_empty());

        // Missing required
        let diagnostics = validate(&schema, &map(vec![]));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("name".to_string()));

        // Null value
        let diagnostics = validate(&schema, &map(vec![("name", PropertyValue::Null)]));
        assert_eq!(diagnostics.len(), 1);

        // Wrong type
        let diagnostics = validate(&schema, &map(vec![("name", 123i64.into())]));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Invalid type"));
    }

    #[test]
    fn test_validate_optional_property() {
        let schema = ResourceSchema::v0().with_property("count", PropertyShape::optional_number());

        assert!(validate(&schema, &map(vec![("count", 42i64.into())])).is_empty());
        assert!(validate(&schema, &map(vec![])).is_empty());
        assert!(validate(&schema, &map(vec![("count", PropertyValue::Null)])).is_empty());
        assert_eq!(
            validate(&schema, &map(vec![("count", "not a number".into())])).len(),
            1
        );
    }

    #[test]
    fn test_validate_computed_property_skipped() {
        let schema = ResourceSchema::v0().with_property("arn", PropertyShape::computed_string());

        assert!(validate(&schema, &map(vec![])).is_empty());
        assert!(validate(&schema, &map(vec![("arn", 123i64.into())])).is_empty());
    }

    #[test]
    fn test_validate_unknown_property_name() {
        let schema = ResourceSchema::v0().with_property("name", PropertyShape::optional_string());
        let diagnostics = validate(&schema, &map(vec![("nmae", "typo".into())]));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("nmae".to_string()));
        assert!(diagnostics[0].summary.contains("Unknown property"));
    }

    #[test]
    fn test_unknown_and_secret_values() {
        let schema = ResourceSchema::v0()
            .with_property("ami", PropertyShape::required_string())
            .with_property("password", PropertyShape::optional_string());

        let input = map(vec![
            ("ami", PropertyValue::Unknown),
            ("password", PropertyValue::secret("hunter2".into())),
        ]);
        assert!(is_valid(&schema, &input));

        let input = map(vec![
            ("ami", "ami-1".into()),
            ("password", PropertyValue::secret(7i64.into())),
        ]);
        assert_eq!(validate(&schema, &input).len(), 1);
    }

    #[test]
    fn test_validate_collections() {
        let schema = ResourceSchema::v0()
            .with_property(
                "tags",
                PropertyShape::new(ShapeKind::set(ShapeKind::String), ShapeFlags::optional())
                    .with_max_items(2),
            )
            .with_property(
                "labels",
                PropertyShape::new(ShapeKind::map(ShapeKind::String), ShapeFlags::optional()),
            );

        let ok = map(vec![
            ("tags", PropertyValue::list(vec!["a".into(), "b".into()])),
            ("labels", map(vec![("env", "prod".into())])),
        ]);
        assert!(validate(&schema, &ok).is_empty());

        let too_many = map(vec![(
            "tags",
            PropertyValue::set(vec!["a".into(), "b".into(), "c".into()]),
        )]);
        let diagnostics = validate(&schema, &too_many);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("at most 2"));

        let bad_element = map(vec![("labels", map(vec![("env", true.into())]))]);
        let diagnostics = validate(&schema, &bad_element);
        assert_eq!(diagnostics[0].attribute, Some("labels.env".to_string()));
    }

    #[test]
    fn test_validate_min_items_when_absent() {
        let schema = ResourceSchema::v0().with_property(
            "subnets",
            PropertyShape::new(ShapeKind::list(ShapeKind::String), ShapeFlags::optional())
                .with_min_items(1),
        );
        let diagnostics = validate(&schema, &map(vec![]));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("at least 1"));
    }

    #[test]
    fn test_validate_allowed_values() {
        let schema = ResourceSchema::v0().with_property(
            "tier",
            PropertyShape::optional_string().with_allowed_values(["free".into(), "pro".into()]),
        );
        assert!(is_valid(&schema, &map(vec![("tier", "pro".into())])));
        let diagnostics = validate(&schema, &map(vec![("tier", "gold".into())]));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].detail.as_deref().unwrap_or("").contains("\"free\""));
    }

    #[test]
    fn test_validate_nested_objects() {
        let rule = ResourceSchema::v0()
            .with_property("port", PropertyShape::required_number())
            .with_property("cidr", PropertyShape::optional_string());
        let schema = ResourceSchema::v0().with_property(
            "ingress",
            PropertyShape::new(ShapeKind::list(ShapeKind::object(rule)), ShapeFlags::optional()),
        );

        let input = map(vec![(
            "ingress",
            PropertyValue::list(vec![
                map(vec![("port", 80i64.into())]),
                map(vec![("cidr", "0.0.0.0/0".into())]),
            ]),
        )]);
        let diagnostics = validate(&schema, &input);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("ingress.1.port".to_string()));
    }

    #[test]
    fn test_validate_result_helper() {
        let schema = ResourceSchema::v0().with_property("name", PropertyShape::required_string());
        assert!(validate_result(&schema, &map(vec![("name", "x".into())])).is_ok());
        let err = validate_result(&schema, &map(vec![])).unwrap_err();
        assert_eq!(err.len(), 1);
    }

    #[test]
    fn test_validate_root_not_object() {
        let schema = ResourceSchema::v0();
        let diagnostics = validate(&schema, &PropertyValue::from("nope"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].summary, "Expected object");
        assert!(diagnostics[0].attribute.is_none());
    }
}
