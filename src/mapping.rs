//! Translation mapping supplied by the embedding application.
//!
//! A [`ProviderInfo`] tells the bridge how plugin identifiers map to target
//! identifiers. Everything is optional: when an entry is absent the bridge
//! falls back to a deterministic naming transform (see [`property_name`],
//! [`resource_token`], [`data_source_token`]).
//!
//! # Example
//!
//! ```
//! use hemmer_provider_bridge::mapping::ProviderInfo;
//!
//! let info = ProviderInfo::from_json_str(r#"{
//!     "name": "aws",
//!     "resources": {
//!         "aws_instance": {
//!             "tok": "aws:ec2/instance:Instance",
//!             "fields": { "ami": { "name": "imageId" } },
//!             "delete_before_replace": false
//!         }
//!     },
//!     "aliases": { "aws:ec2/legacyInstance:LegacyInstance": "aws:ec2/instance:Instance" }
//! }"#).unwrap();
//!
//! assert_eq!(info.package(), "aws");
//! assert_eq!(info.resources["aws_instance"].fields["ami"].name.as_deref(), Some("imageId"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::BridgeError;
use crate::schema::PropertyShape;
use crate::value::PropertyValue;

/// Mapping information for a whole provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderInfo {
    /// The provider name; plugin resource types are prefixed with `<name>_`.
    pub name: String,
    /// The target package name. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Overrides for provider configuration properties.
    #[serde(default)]
    pub config: BTreeMap<String, PropertyInfo>,
    /// Overrides per plugin resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceInfo>,
    /// Overrides per plugin data source type.
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceInfo>,
    /// Token aliases: an old target token mapped to the token that replaced it.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl ProviderInfo {
    /// Create mapping info for a provider with no overrides.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse mapping info from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The target package name.
    pub fn package(&self) -> &str {
        self.package.as_deref().unwrap_or(&self.name)
    }

    /// Add a resource override.
    pub fn with_resource(mut self, source_type: impl Into<String>, info: ResourceInfo) -> Self {
        self.resources.insert(source_type.into(), info);
        self
    }

    /// Add a data source override.
    pub fn with_data_source(
        mut self,
        source_type: impl Into<String>,
        info: DataSourceInfo,
    ) -> Self {
        self.data_sources.insert(source_type.into(), info);
        self
    }

    /// Add a provider config property override.
    pub fn with_config(mut self, name: impl Into<String>, info: PropertyInfo) -> Self {
        self.config.insert(name.into(), info);
        self
    }

    /// Alias an old token to a newer one.
    pub fn with_alias(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.aliases.insert(old.into(), new.into());
        self
    }
}

/// Mapping information for a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceInfo {
    /// The target token. Derived from the plugin type name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tok: Option<String>,
    /// Per-property overrides keyed by plugin property name.
    #[serde(default)]
    pub fields: BTreeMap<String, PropertyInfo>,
    /// Replacement order override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_before_replace: Option<bool>,
    /// State upgrade steps, applied in `from_version` order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrades: Vec<StateUpgrade>,
}

impl ResourceInfo {
    /// Create resource info with an explicit token.
    pub fn with_token(tok: impl Into<String>) -> Self {
        Self {
            tok: Some(tok.into()),
            ..Default::default()
        }
    }

    /// Add a property override.
    pub fn with_field(mut self, name: impl Into<String>, info: PropertyInfo) -> Self {
        self.fields.insert(name.into(), info);
        self
    }

    /// Set the replacement order.
    pub fn with_delete_before_replace(mut self, delete_first: bool) -> Self {
        self.delete_before_replace = Some(delete_first);
        self
    }

    /// Add a state upgrade step.
    pub fn with_upgrade(mut self, upgrade: StateUpgrade) -> Self {
        self.upgrades.push(upgrade);
        self
    }
}

/// Mapping information for a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataSourceInfo {
    /// The target function token. Derived from the plugin type name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tok: Option<String>,
    /// Per-property overrides keyed by plugin property name.
    #[serde(default)]
    pub fields: BTreeMap<String, PropertyInfo>,
}

impl DataSourceInfo {
    /// Create data source info with an explicit token.
    pub fn with_token(tok: impl Into<String>) -> Self {
        Self {
            tok: Some(tok.into()),
            ..Default::default()
        }
    }
}

/// Mapping information for a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyInfo {
    /// The target property name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Target type for a property the plugin stores as a different primitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coerce: Option<TypeHint>,
    /// Default applied by Check when the property is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultInfo>,
    /// Expose a list/set as its single element (or not, overriding the schema).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_one: Option<bool>,
    /// Always treat the property as secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
    /// Overrides for properties of a nested object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, PropertyInfo>,
}

impl PropertyInfo {
    /// Rename the property.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Set the coercion hint.
    pub fn with_coerce(mut self, hint: TypeHint) -> Self {
        self.coerce = Some(hint);
        self
    }

    /// Set the default.
    pub fn with_default(mut self, default: DefaultInfo) -> Self {
        self.default = Some(default);
        self
    }

    /// Override single-item flattening.
    pub fn with_max_items_one(mut self, flatten: bool) -> Self {
        self.max_items_one = Some(flatten);
        self
    }

    /// Mark the property as secret.
    pub fn secret(mut self) -> Self {
        self.secret = Some(true);
        self
    }

    /// Add a nested property override.
    pub fn with_field(mut self, name: impl Into<String>, info: PropertyInfo) -> Self {
        self.fields.insert(name.into(), info);
        self
    }
}

/// A default value, taken from the environment first and then a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DefaultInfo {
    /// Environment variables consulted in order; the first non-empty one wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// The literal fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyValue>,
}

impl DefaultInfo {
    /// A literal default.
    pub fn value(value: PropertyValue) -> Self {
        Self {
            env: Vec::new(),
            value: Some(value),
        }
    }

    /// A default read from environment variables.
    pub fn env<S: Into<String>>(vars: impl IntoIterator<Item = S>) -> Self {
        Self {
            env: vars.into_iter().map(Into::into).collect(),
            value: None,
        }
    }

    /// Returns true when the default may differ between runs.
    pub fn is_environmental(&self) -> bool {
        !self.env.is_empty()
    }

    /// Resolve the default against the current environment.
    pub fn resolve(&self) -> Option<PropertyValue> {
        self.env
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.is_empty())
            .map(PropertyValue::String)
            .or_else(|| self.value.clone())
    }
}

/// A primitive type used to coerce between the plugin and target types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeHint {
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Bool,
}

/// A declarative step upgrading state written under `from_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpgrade {
    /// The schema version this step upgrades from (to `from_version + 1`).
    pub from_version: u64,
    /// The operations, applied in order.
    pub ops: Vec<UpgradeOp>,
}

impl StateUpgrade {
    /// Create an upgrade step.
    pub fn new(from_version: u64, ops: Vec<UpgradeOp>) -> Self {
        Self { from_version, ops }
    }
}

/// A single state upgrade operation over target property names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpgradeOp {
    /// Move a property to a new name.
    Rename {
        /// The old name.
        from: String,
        /// The new name.
        to: String,
    },
    /// Drop a property.
    Remove {
        /// The property.
        property: String,
    },
    /// Set a property when it is absent.
    SetDefault {
        /// The property.
        property: String,
        /// The value.
        value: PropertyValue,
    },
    /// Convert a primitive property to another primitive type.
    Retype {
        /// The property.
        property: String,
        /// The new type.
        to: TypeHint,
    },
    /// Turn a single value into a one-element list.
    WrapInList {
        /// The property.
        property: String,
    },
}

/// Convert a snake_case name to camelCase.
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, part) in name.split('_').filter(|p| !p.is_empty()).enumerate() {
        if i == 0 {
            out.push_str(part);
        } else {
            out.push_str(&capitalize(part));
        }
    }
    out
}

/// Convert a snake_case name to PascalCase.
pub fn to_pascal_case(name: &str) -> String {
    capitalize(&to_camel_case(name))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Pluralize a name for a collection-valued property.
///
/// Names already ending in `s` are left alone.
pub fn pluralize(name: &str) -> String {
    if name.is_empty() || name.ends_with('s') {
        return name.to_string();
    }
    if let Some(stem) = name.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|c| !"aeiou".contains(c)) {
            return format!("{}ies", stem);
        }
    }
    if name.ends_with('x') || name.ends_with('z') || name.ends_with("ch") || name.ends_with("sh")
    {
        return format!("{}es", name);
    }
    format!("{}s", name)
}

/// Whether a property is exposed as its single element.
pub fn flattens(shape: &PropertyShape, info: Option<&PropertyInfo>) -> bool {
    shape.kind.is_collection()
        && info
            .and_then(|i| i.max_items_one)
            .unwrap_or(shape.max_items == 1)
}

/// The target name of a plugin property.
///
/// An explicit name wins; otherwise the name is camel-cased, and collection
/// properties that are not flattened are pluralized.
pub fn property_name(source_name: &str, shape: &PropertyShape, info: Option<&PropertyInfo>) -> String {
    if let Some(name) = info.and_then(|i| i.name.clone()) {
        return name;
    }
    let camel = to_camel_case(source_name);
    if shape.kind.is_collection() && !flattens(shape, info) {
        pluralize(&camel)
    } else {
        camel
    }
}

fn strip_provider_prefix<'a>(provider: &str, source_type: &'a str) -> &'a str {
    source_type
        .strip_prefix(provider)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(source_type)
}

/// The default target token of a plugin resource type.
///
/// `aws_lb_listener` in package `aws` becomes `aws:index/lbListener:LbListener`.
pub fn resource_token(package: &str, provider: &str, source_type: &str) -> String {
    let rest = strip_provider_prefix(provider, source_type);
    format!(
        "{}:index/{}:{}",
        package,
        to_camel_case(rest),
        to_pascal_case(rest)
    )
}

/// The default target token of a plugin data source.
///
/// `aws_ami` in package `aws` becomes `aws:index/getAmi:getAmi`.
pub fn data_source_token(package: &str, provider: &str, source_type: &str) -> String {
    let rest = strip_provider_prefix(provider, source_type);
    let name = format!("get{}", to_pascal_case(rest));
    format!("{}:index/{}:{}", package, name, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertyShape, ShapeFlags, ShapeKind};

    #[test]
    fn test_camel_case() {
        assert_eq!(to_camel_case("create_before_destroy"), "createBeforeDestroy");
        assert_eq!(to_camel_case("aws_lb_listener"), "awsLbListener");
        assert_eq!(to_camel_case("name"), "name");
        assert_eq!(to_pascal_case("node_pool"), "NodePool");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("ingress"), "ingress");
        assert_eq!(pluralize("policy"), "policies");
        assert_eq!(pluralize("key"), "keys");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("securityGroup"), "securityGroups");
    }

    #[test]
    fn test_property_name() {
        let list = PropertyShape::new(ShapeKind::list(ShapeKind::String), ShapeFlags::optional());
        assert_eq!(property_name("security_group", &list, None), "securityGroups");

        let single = list.clone().with_max_items(1);
        assert_eq!(property_name("root_block_device", &single, None), "rootBlockDevice");

        let info = PropertyInfo::named("sgs");
        assert_eq!(property_name("security_group", &list, Some(&info)), "sgs");

        let not_flattened = PropertyInfo::default().with_max_items_one(false);
        assert_eq!(
            property_name("root_block_device", &single, Some(&not_flattened)),
            "rootBlockDevices"
        );
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            resource_token("aws", "aws", "aws_lb_listener"),
            "aws:index/lbListener:LbListener"
        );
        assert_eq!(
            resource_token("gcp", "google", "google_container_node_pool"),
            "gcp:index/containerNodePool:ContainerNodePool"
        );
        assert_eq!(data_source_token("aws", "aws", "aws_ami"), "aws:index/getAmi:getAmi");
    }

    #[test]
    fn test_default_info_resolution() {
        let literal = DefaultInfo::value("us-east-1".into());
        assert_eq!(literal.resolve(), Some(PropertyValue::from("us-east-1")));
        assert!(!literal.is_environmental());

        let env = DefaultInfo {
            env: vec!["HEMMER_BRIDGE_TEST_UNSET_VARIABLE".into()],
            value: Some("fallback".into()),
        };
        assert!(env.is_environmental());
        assert_eq!(env.resolve(), Some(PropertyValue::from("fallback")));
    }

    #[test]
    fn test_upgrade_op_json() {
        let upgrade: StateUpgrade = serde_json::from_value(serde_json::json!({
            "from_version": 0,
            "ops": [
                {"op": "rename", "from": "image", "to": "ami"},
                {"op": "retype", "property": "count", "to": "number"}
            ]
        }))
        .unwrap();
        assert_eq!(upgrade.ops.len(), 2);
        assert_eq!(
            upgrade.ops[0],
            UpgradeOp::Rename {
                from: "image".into(),
                to: "ami".into()
            }
        );
    }
}
