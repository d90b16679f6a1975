//! Convenience types for the bridge's RPC surface.
//!
//! These types provide an ergonomic API over the raw protobuf types.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::schema::Diagnostic;
use crate::value::PropertyValue;

/// The state of one live resource instance, as held by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The instance id assigned by the plugin.
    pub id: String,
    /// The target token of the resource type.
    pub resource_type: String,
    /// The last-known structured properties.
    pub properties: PropertyValue,
    /// The schema version the properties were written under.
    #[serde(default)]
    pub schema_version: u64,
}

impl ResourceState {
    /// Create a new resource state.
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        properties: PropertyValue,
        schema_version: u64,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties,
            schema_version,
        }
    }
}

/// A parsed resource URN: `urn:<namespace>:<stack>::<project>::<type>::<name>`.
///
/// The type segment may be qualified with parent types separated by `$`;
/// only the last one names this resource's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urn {
    /// The stack the resource belongs to.
    pub stack: String,
    /// The project the resource belongs to.
    pub project: String,
    /// The resource's type token.
    pub resource_type: String,
    /// The logical resource name.
    pub name: String,
}

impl Urn {
    /// Parse a URN string.
    pub fn parse(urn: &str) -> Result<Self, BridgeError> {
        let invalid = || BridgeError::InvalidRequest(format!("malformed URN '{}'", urn));

        let rest = urn.strip_prefix("urn:").ok_or_else(invalid)?;
        let mut parts = rest.splitn(4, "::");
        let head = parts.next().ok_or_else(invalid)?;
        let project = parts.next().ok_or_else(invalid)?;
        let qualified_type = parts.next().ok_or_else(invalid)?;
        let name = parts.next().ok_or_else(invalid)?;

        let stack = head.split_once(':').map(|(_, s)| s).ok_or_else(invalid)?;
        let resource_type = qualified_type.rsplit('$').next().unwrap_or(qualified_type);
        if resource_type.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            stack: stack.to_string(),
            project: project.to_string(),
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        })
    }
}

/// Which side of a replacement happens first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementOrder {
    /// Create the replacement, then delete the old resource.
    #[default]
    CreateBeforeDelete,
    /// Delete the old resource, then create the replacement.
    DeleteBeforeCreate,
}

/// The result of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiffResult {
    /// Property paths whose values changed (or may change).
    pub changes: Vec<String>,
    /// The subset of changes that require replacement.
    pub replaces: Vec<String>,
    /// Property paths known not to change.
    pub stables: Vec<String>,
    /// Replacement ordering, meaningful only when `replaces` is non-empty.
    pub replacement_order: ReplacementOrder,
}

impl DiffResult {
    /// Returns true if any property changed.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Returns true if the resource must be replaced.
    pub fn requires_replace(&self) -> bool {
        !self.replaces.is_empty()
    }

    /// Returns true if the old resource must be deleted before its replacement
    /// is created.
    pub fn delete_before_replace(&self) -> bool {
        self.requires_replace() && self.replacement_order == ReplacementOrder::DeleteBeforeCreate
    }
}

/// A per-property validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    /// The property path that failed.
    pub property: String,
    /// Why it failed.
    pub reason: String,
}

impl CheckFailure {
    /// Create a new failure.
    pub fn new(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            reason: reason.into(),
        }
    }
}

impl From<Diagnostic> for CheckFailure {
    fn from(diag: Diagnostic) -> Self {
        let reason = match diag.detail {
            Some(detail) => format!("{}: {}", diag.summary, detail),
            None => diag.summary,
        };
        Self {
            property: diag.attribute.unwrap_or_default(),
            reason,
        }
    }
}

/// The result of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// The normalized inputs, with defaults applied.
    pub inputs: PropertyValue,
    /// Validation failures; empty when the inputs are valid.
    pub failures: Vec<CheckFailure>,
}

/// The result of a function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResult {
    /// The function's return value.
    pub outputs: PropertyValue,
    /// Argument failures; when non-empty the function was not called.
    pub failures: Vec<CheckFailure>,
}

/// The protocol version for the plugin handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake prefix output by plugins.
pub const HANDSHAKE_PREFIX: &str = "BRIDGE_PLUGIN";

/// Environment variable through which the bridge hands plugins the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "BRIDGE_PLUGIN_MAGIC_COOKIE";

/// The magic cookie value. Plugins refuse to start without it.
pub const MAGIC_COOKIE_VALUE: &str = "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Diagnostic;

    #[test]
    fn test_urn_parse() {
        let urn = Urn::parse("urn:pulumi:dev::web::aws:ec2/instance:Instance::server").unwrap();
        assert_eq!(urn.stack, "dev");
        assert_eq!(urn.project, "web");
        assert_eq!(urn.resource_type, "aws:ec2/instance:Instance");
        assert_eq!(urn.name, "server");
    }

    #[test]
    fn test_urn_parse_qualified_type() {
        let urn = Urn::parse(
            "urn:pulumi:dev::web::my:index:Component$aws:s3/bucket:Bucket::logs",
        )
        .unwrap();
        assert_eq!(urn.resource_type, "aws:s3/bucket:Bucket");
        assert_eq!(urn.name, "logs");
    }

    #[test]
    fn test_urn_parse_rejects_garbage() {
        assert!(Urn::parse("aws:ec2/instance:Instance").is_err());
        assert!(Urn::parse("urn:pulumi:dev::web").is_err());
    }

    #[test]
    fn test_diff_result_helpers() {
        let none = DiffResult::default();
        assert!(!none.has_changes());
        assert!(!none.delete_before_replace());

        let replace = DiffResult {
            changes: vec!["ami".into()],
            replaces: vec!["ami".into()],
            stables: vec![],
            replacement_order: ReplacementOrder::DeleteBeforeCreate,
        };
        assert!(replace.requires_replace());
        assert!(replace.delete_before_replace());

        let update = DiffResult {
            replaces: vec![],
            ..replace
        };
        assert!(!update.delete_before_replace());
    }

    #[test]
    fn test_check_failure_from_diagnostic() {
        let failure: CheckFailure = Diagnostic::error("Missing required property 'ami'")
            .with_attribute("ami")
            .into();
        assert_eq!(failure.property, "ami");
        assert_eq!(failure.reason, "Missing required property 'ami'");
    }

    #[test]
    fn test_protocol_constants() {
        assert_eq!(PROTOCOL_VERSION, 1);
        assert_eq!(HANDSHAKE_PREFIX, "BRIDGE_PLUGIN");
    }
}
