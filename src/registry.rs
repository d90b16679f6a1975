//! Schema registry: plugin schemas bound to their target identifiers.
//!
//! The registry joins the [`ProviderSchema`] negotiated with the plugin and
//! the embedding application's [`ProviderInfo`]. Every resource, data source,
//! and the provider configuration becomes a [`Binding`] holding both views of
//! the same schema:
//!
//! - `source`: the plugin's schema, keyed by plugin property names.
//! - `target`: the projection seen by the engine, with target names,
//!   flattened single-item collections, coerced primitives, and mapping
//!   secrets/replacement policy applied.
//!
//! Validation and diffing work on the target view; the [`StateCodec`]
//! translates between the two.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::codec::StateCodec;
use crate::error::BridgeError;
use crate::mapping::{
    data_source_token, flattens, property_name, resource_token, to_camel_case, DefaultInfo,
    PropertyInfo, ProviderInfo, StateUpgrade, TypeHint,
};
use crate::schema::{PropertyShape, ProviderSchema, ResourceSchema, ShapeKind};

pub(crate) static NO_FIELDS: BTreeMap<String, PropertyInfo> = BTreeMap::new();

/// What kind of entity an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// A managed resource.
    Resource,
    /// A data source, exposed as an invokable function.
    DataSource,
}

impl EntityKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Resource => "resource type",
            Self::DataSource => "data source",
        }
    }
}

/// A plugin entity bound to its target identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// The entity kind.
    pub kind: EntityKind,
    /// The plugin's type name, e.g. `aws_instance`.
    pub source_type: String,
    /// The target token, e.g. `aws:ec2/instance:Instance`.
    pub token: String,
    /// The plugin-side schema.
    pub source: ResourceSchema,
    /// The engine-side projection of `source`.
    pub target: ResourceSchema,
    /// Mapping overrides keyed by plugin property name.
    pub fields: BTreeMap<String, PropertyInfo>,
    /// Declarative state upgrades.
    pub upgrades: Vec<StateUpgrade>,
    names: BTreeMap<String, String>,
}

impl Binding {
    fn new(
        kind: EntityKind,
        source_type: impl Into<String>,
        token: impl Into<String>,
        source: ResourceSchema,
        fields: BTreeMap<String, PropertyInfo>,
        delete_before_replace: Option<bool>,
        upgrades: Vec<StateUpgrade>,
    ) -> Self {
        let mut binding = Self {
            kind,
            source_type: source_type.into(),
            token: token.into(),
            target: ResourceSchema::default(),
            source,
            fields,
            upgrades,
            names: BTreeMap::new(),
        };
        binding.reproject(delete_before_replace);
        binding
    }

    fn reproject(&mut self, delete_before_replace: Option<bool>) {
        self.names = self
            .source
            .properties
            .iter()
            .map(|(name, shape)| {
                (
                    name.clone(),
                    property_name(name, shape, self.fields.get(name)),
                )
            })
            .collect();
        self.target = project_schema(&self.source, &self.fields);
        if delete_before_replace.is_some() {
            self.target.delete_before_replace = delete_before_replace;
        }
    }

    /// The target name of a top-level plugin property.
    pub fn target_name(&self, source_name: &str) -> Option<&str> {
        self.names.get(source_name).map(String::as_str)
    }

    /// The plugin name of a top-level target property.
    pub fn source_name(&self, target_name: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, target)| target.as_str() == target_name)
            .map(|(source, _)| source.as_str())
    }

    /// Mapping defaults, keyed by target property name.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, &DefaultInfo)> + '_ {
        self.fields.iter().filter_map(|(source, info)| {
            let default = info.default.as_ref()?;
            Some((self.target_name(source)?, default))
        })
    }

    /// A codec translating state for this entity.
    pub fn codec(&self) -> StateCodec<'_> {
        StateCodec::new(&self.source, &self.fields)
    }
}

/// Resolves plugin schemas and target identifiers.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    info: ProviderInfo,
    config: Binding,
    resources: BTreeMap<String, Binding>,
    functions: BTreeMap<String, Binding>,
    by_source: BTreeMap<(EntityKind, String), String>,
}

impl SchemaRegistry {
    /// Bind every entity of `schema` using the overrides in `info`.
    pub fn new(info: ProviderInfo, schema: ProviderSchema) -> Self {
        let package = info.package().to_string();
        let config = Binding::new(
            EntityKind::Resource,
            info.name.clone(),
            package.clone(),
            schema.provider,
            info.config.clone(),
            None,
            Vec::new(),
        );

        let mut registry = Self {
            config,
            resources: BTreeMap::new(),
            functions: BTreeMap::new(),
            by_source: BTreeMap::new(),
            info,
        };

        for (source_type, source) in schema.resources {
            let token = registry.map(EntityKind::Resource, &source_type);
            let overrides = registry.info.resources.get(&source_type);
            let binding = Binding::new(
                EntityKind::Resource,
                source_type.clone(),
                token.clone(),
                source,
                overrides.map(|r| r.fields.clone()).unwrap_or_default(),
                overrides.and_then(|r| r.delete_before_replace),
                overrides.map(|r| r.upgrades.clone()).unwrap_or_default(),
            );
            registry
                .by_source
                .insert((EntityKind::Resource, source_type), token.clone());
            registry.resources.insert(token, binding);
        }

        for (source_type, source) in schema.data_sources {
            let token = registry.map(EntityKind::DataSource, &source_type);
            let fields = registry
                .info
                .data_sources
                .get(&source_type)
                .map(|d| d.fields.clone())
                .unwrap_or_default();
            let binding = Binding::new(
                EntityKind::DataSource,
                source_type.clone(),
                token.clone(),
                source,
                fields,
                None,
                Vec::new(),
            );
            registry
                .by_source
                .insert((EntityKind::DataSource, source_type), token.clone());
            registry.functions.insert(token, binding);
        }

        registry
    }

    /// The mapping the registry was built from.
    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    /// The target identifier for a plugin identifier: the explicit mapping
    /// entry when present, the default naming transform otherwise.
    pub fn map(&self, kind: EntityKind, source_type: &str) -> String {
        let explicit = match kind {
            EntityKind::Resource => self
                .info
                .resources
                .get(source_type)
                .and_then(|r| r.tok.clone()),
            EntityKind::DataSource => self
                .info
                .data_sources
                .get(source_type)
                .and_then(|d| d.tok.clone()),
        };
        explicit.unwrap_or_else(|| match kind {
            EntityKind::Resource => resource_token(self.info.package(), &self.info.name, source_type),
            EntityKind::DataSource => {
                data_source_token(self.info.package(), &self.info.name, source_type)
            },
        })
    }

    /// Follow the alias chain from `token` to a bound token.
    ///
    /// Fails on a cycle or when the chain ends at a token nothing is bound to.
    pub fn resolve_alias(&self, token: &str) -> Result<String, BridgeError> {
        let mut current = token.to_string();
        let mut seen = BTreeSet::from([current.clone()]);
        while let Some(next) = self.info.aliases.get(&current) {
            if !seen.insert(next.clone()) {
                return Err(BridgeError::SchemaMapping(format!(
                    "alias cycle detected while resolving '{}' (at '{}')",
                    token, next
                )));
            }
            current = next.clone();
        }
        if self.resources.contains_key(&current) || self.functions.contains_key(&current) {
            Ok(current)
        } else {
            Err(BridgeError::SchemaMapping(format!(
                "unknown token '{}'",
                current
            )))
        }
    }

    /// The plugin schema for an identifier, given as a plugin type name or a
    /// target token.
    pub fn resolve(&self, kind: EntityKind, identifier: &str) -> Result<&ResourceSchema, BridgeError> {
        self.binding(kind, identifier).map(|b| &b.source)
    }

    /// The binding for an identifier, given as a plugin type name or a target
    /// token.
    pub fn binding(&self, kind: EntityKind, identifier: &str) -> Result<&Binding, BridgeError> {
        let table = match kind {
            EntityKind::Resource => &self.resources,
            EntityKind::DataSource => &self.functions,
        };
        if let Some(token) = self.by_source.get(&(kind, identifier.to_string())) {
            if let Some(binding) = table.get(token) {
                return Ok(binding);
            }
        }
        let token = self.resolve_alias(identifier)?;
        table.get(&token).ok_or_else(|| {
            BridgeError::SchemaMapping(format!("'{}' is not a {}", token, kind.describe()))
        })
    }

    /// The binding for a resource token.
    pub fn resource(&self, token: &str) -> Result<&Binding, BridgeError> {
        self.binding(EntityKind::Resource, token)
    }

    /// The binding for a function token.
    pub fn function(&self, token: &str) -> Result<&Binding, BridgeError> {
        self.binding(EntityKind::DataSource, token)
    }

    /// The provider configuration binding.
    pub fn config(&self) -> &Binding {
        &self.config
    }

    /// Bound resource tokens.
    pub fn resource_tokens(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Bound function tokens.
    pub fn function_tokens(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Overlay documentation onto an entity's schema.
    pub fn apply_docs(
        &mut self,
        kind: EntityKind,
        identifier: &str,
        docs: &EntityDocs,
    ) -> Result<(), BridgeError> {
        let token = self.binding(kind, identifier)?.token.clone();
        let table = match kind {
            EntityKind::Resource => &mut self.resources,
            EntityKind::DataSource => &mut self.functions,
        };
        if let Some(binding) = table.get_mut(&token) {
            overlay_docs(&mut binding.source, docs);
            let delete_before_replace = binding.target.delete_before_replace;
            binding.reproject(delete_before_replace);
        }
        Ok(())
    }
}

/// Documentation for one resource or data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityDocs {
    /// The entity description.
    #[serde(default)]
    pub description: String,
    /// Argument docs keyed by plugin property name.
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgumentDocs>,
    /// Attribute (output) docs keyed by plugin property name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Documentation for one argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArgumentDocs {
    /// The argument description.
    #[serde(default)]
    pub description: String,
    /// Descriptions of the argument's nested properties.
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    /// The argument was documented as a nested property without a parent.
    #[serde(default)]
    pub is_nested: bool,
}

/// Overlay descriptions onto a plugin schema.
///
/// Doc entries overwrite existing descriptions and a nested argument map
/// replaces the nested descriptions wholesale. An argument flagged
/// `is_nested` is attached to the first object property, in name order,
/// declaring a child of that name. That may be a sibling of the block the
/// docs meant.
pub fn overlay_docs(schema: &mut ResourceSchema, docs: &EntityDocs) {
    if !docs.description.is_empty() {
        schema.description = Some(docs.description.clone());
    }

    for (name, text) in &docs.attributes {
        if let Some(prop) = schema.properties.get_mut(name) {
            prop.description = Some(text.clone());
        }
    }

    for (name, arg) in &docs.arguments {
        if arg.is_nested {
            attach_detached(schema, name, arg);
            continue;
        }
        let Some(prop) = schema.properties.get_mut(name) else {
            continue;
        };
        if !arg.description.is_empty() {
            prop.description = Some(arg.description.clone());
        }
        if !arg.arguments.is_empty() {
            if let Some(nested) = object_schema_mut(&mut prop.kind) {
                for (child, shape) in nested.properties.iter_mut() {
                    shape.description = arg.arguments.get(child).cloned();
                }
            }
        }
    }
}

fn attach_detached(schema: &mut ResourceSchema, name: &str, arg: &ArgumentDocs) {
    for prop in schema.properties.values_mut() {
        if let Some(nested) = object_schema_mut(&mut prop.kind) {
            if let Some(child) = nested.properties.get_mut(name) {
                child.description = Some(arg.description.clone());
                return;
            }
        }
    }
}

fn object_schema_mut(kind: &mut ShapeKind) -> Option<&mut ResourceSchema> {
    match kind {
        ShapeKind::Object(schema) => Some(schema),
        ShapeKind::List(inner) | ShapeKind::Set(inner) | ShapeKind::Map(inner) => {
            object_schema_mut(inner)
        },
        _ => None,
    }
}

/// Project a plugin schema to the engine-side view.
pub fn project_schema(
    source: &ResourceSchema,
    fields: &BTreeMap<String, PropertyInfo>,
) -> ResourceSchema {
    let names: BTreeMap<&str, String> = source
        .properties
        .iter()
        .map(|(name, shape)| (name.as_str(), property_name(name, shape, fields.get(name))))
        .collect();
    let rename = |name: &String| {
        names
            .get(name.as_str())
            .cloned()
            .unwrap_or_else(|| to_camel_case(name))
    };

    ResourceSchema {
        version: source.version,
        properties: source
            .properties
            .iter()
            .map(|(name, shape)| (rename(name), project_property(shape, fields.get(name))))
            .collect(),
        dependents: source
            .dependents
            .iter()
            .map(|(name, deps)| (rename(name), deps.iter().map(rename).collect()))
            .collect(),
        delete_before_replace: source.delete_before_replace,
        description: source.description.clone(),
    }
}

fn project_property(shape: &PropertyShape, info: Option<&PropertyInfo>) -> PropertyShape {
    let mut out = shape.clone();
    out.kind = project_kind(&shape.kind, info);
    if flattens(shape, info) {
        out.kind = match out.kind {
            ShapeKind::List(element) | ShapeKind::Set(element) => *element,
            other => other,
        };
        out.min_items = 0;
        out.max_items = 0;
    }
    if info.and_then(|i| i.secret).unwrap_or(false) {
        out.flags.sensitive = true;
    }
    out
}

fn project_kind(kind: &ShapeKind, info: Option<&PropertyInfo>) -> ShapeKind {
    match kind {
        ShapeKind::String | ShapeKind::Number | ShapeKind::Bool => {
            match info.and_then(|i| i.coerce) {
                Some(TypeHint::String) => ShapeKind::String,
                Some(TypeHint::Number) => ShapeKind::Number,
                Some(TypeHint::Bool) => ShapeKind::Bool,
                None => kind.clone(),
            }
        },
        ShapeKind::List(element) => ShapeKind::list(project_kind(element, info)),
        ShapeKind::Set(element) => ShapeKind::set(project_kind(element, info)),
        ShapeKind::Map(element) => ShapeKind::map(project_kind(element, info)),
        ShapeKind::Object(schema) => ShapeKind::object(project_schema(
            schema,
            info.map(|i| &i.fields).unwrap_or(&NO_FIELDS),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mapping::{DataSourceInfo, ResourceInfo};
    use crate::schema::ShapeFlags;

    fn instance_schema() -> ResourceSchema {
        ResourceSchema::v0()
            .with_property("ami", PropertyShape::required_string().with_force_new())
            .with_property(
                "security_group",
                PropertyShape::new(ShapeKind::list(ShapeKind::String), ShapeFlags::optional()),
            )
            .with_property(
                "root_block_device",
                PropertyShape::new(
                    ShapeKind::list(ShapeKind::object(
                        ResourceSchema::v0()
                            .with_property("volume_size", PropertyShape::optional_number()),
                    )),
                    ShapeFlags::optional(),
                )
                .with_max_items(1),
            )
            .with_property("public_ip", PropertyShape::computed_string())
            .with_dependents("ami", ["public_ip"])
    }

    fn registry() -> SchemaRegistry {
        let schema = ProviderSchema::new()
            .with_resource("aws_instance", instance_schema())
            .with_resource("aws_lb_listener", ResourceSchema::v0())
            .with_data_source("aws_ami", ResourceSchema::v0());
        let info = ProviderInfo::new("aws")
            .with_resource(
                "aws_instance",
                ResourceInfo::with_token("aws:ec2/instance:Instance")
                    .with_field("ami", PropertyInfo::named("imageId").secret())
                    .with_delete_before_replace(true),
            )
            .with_data_source("aws_ami", DataSourceInfo::with_token("aws:ec2/getAmi:getAmi"))
            .with_alias("aws:ec2/legacy:Legacy", "aws:ec2/old:Old")
            .with_alias("aws:ec2/old:Old", "aws:ec2/instance:Instance")
            .with_alias("aws:loop/a:A", "aws:loop/b:B")
            .with_alias("aws:loop/b:B", "aws:loop/a:A")
            .with_alias("aws:gone/x:X", "aws:gone/y:Y");
        SchemaRegistry::new(info, schema)
    }

    #[test]
    fn test_map_explicit_then_default() {
        let registry = registry();
        assert_eq!(
            registry.map(EntityKind::Resource, "aws_instance"),
            "aws:ec2/instance:Instance"
        );
        assert_eq!(
            registry.map(EntityKind::Resource, "aws_lb_listener"),
            "aws:index/lbListener:LbListener"
        );
        assert_eq!(
            registry.map(EntityKind::DataSource, "aws_ami"),
            "aws:ec2/getAmi:getAmi"
        );
    }

    #[test]
    fn test_resolve_by_source_or_token() {
        let registry = registry();
        let by_source = registry.resolve(EntityKind::Resource, "aws_instance").unwrap();
        let by_token = registry
            .resolve(EntityKind::Resource, "aws:ec2/instance:Instance")
            .unwrap();
        assert_eq!(by_source, by_token);
        assert!(by_source.properties.contains_key("security_group"));

        let err = registry.resolve(EntityKind::Resource, "aws_nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMapping);

        let err = registry
            .resolve(EntityKind::DataSource, "aws:ec2/instance:Instance")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMapping);
    }

    #[test]
    fn test_resolve_alias_chain() {
        let registry = registry();
        assert_eq!(
            registry.resolve_alias("aws:ec2/legacy:Legacy").unwrap(),
            "aws:ec2/instance:Instance"
        );
        assert_eq!(
            registry.resource("aws:ec2/legacy:Legacy").unwrap().source_type,
            "aws_instance"
        );
    }

    #[test]
    fn test_resolve_alias_cycle_and_dangling() {
        let registry = registry();
        let err = registry.resolve_alias("aws:loop/a:A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMapping);
        assert!(err.message().contains("cycle"));

        let err = registry.resolve_alias("aws:gone/x:X").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMapping);
        assert!(err.message().contains("aws:gone/y:Y"));
    }

    #[test]
    fn test_target_projection() {
        let registry = registry();
        let binding = registry.resource("aws:ec2/instance:Instance").unwrap();
        let target = &binding.target;

        assert!(target.properties["imageId"].flags.sensitive);
        assert!(target.properties["imageId"].force_new);
        assert_eq!(
            target.properties["securityGroups"].kind,
            ShapeKind::list(ShapeKind::String)
        );
        match &target.properties["rootBlockDevice"].kind {
            ShapeKind::Object(nested) => assert!(nested.properties.contains_key("volumeSize")),
            other => panic!("expected flattened object, got {other:?}"),
        }
        assert!(target.dependents["imageId"].contains("publicIp"));
        assert_eq!(target.delete_before_replace, Some(true));

        assert_eq!(binding.target_name("ami"), Some("imageId"));
        assert_eq!(binding.source_name("securityGroups"), Some("security_group"));
    }

    #[test]
    fn test_coerced_projection() {
        let source = ResourceSchema::v0().with_property("port", PropertyShape::optional_string());
        let fields = BTreeMap::from([(
            "port".to_string(),
            PropertyInfo::default().with_coerce(TypeHint::Number),
        )]);
        let target = project_schema(&source, &fields);
        assert_eq!(target.properties["port"].kind, ShapeKind::Number);
    }

    fn block(children: &[&str]) -> PropertyShape {
        let mut nested = ResourceSchema::v0();
        for child in children {
            nested = nested.with_property(*child, PropertyShape::optional_string());
        }
        PropertyShape::new(ShapeKind::list(ShapeKind::object(nested)), ShapeFlags::optional())
    }

    fn nested_description<'a>(schema: &'a ResourceSchema, parent: &str, child: &str) -> Option<&'a str> {
        match &schema.properties[parent].kind {
            ShapeKind::List(inner) => match inner.as_ref() {
                ShapeKind::Object(nested) => nested.properties[child].description.as_deref(),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn test_docs_overlay_overwrites() {
        let mut schema = ResourceSchema::v0()
            .with_property("name", PropertyShape::optional_string().with_description("old"))
            .with_property("ingress", block(&["from_port", "protocol"]));
        let docs = EntityDocs {
            description: "A security group".into(),
            arguments: BTreeMap::from([
                (
                    "name".to_string(),
                    ArgumentDocs {
                        description: "The group name".into(),
                        ..Default::default()
                    },
                ),
                (
                    "ingress".to_string(),
                    ArgumentDocs {
                        description: "Inbound rules".into(),
                        arguments: BTreeMap::from([(
                            "from_port".to_string(),
                            "Start port".to_string(),
                        )]),
                        is_nested: false,
                    },
                ),
            ]),
            attributes: BTreeMap::new(),
        };

        overlay_docs(&mut schema, &docs);
        assert_eq!(schema.description.as_deref(), Some("A security group"));
        assert_eq!(schema.properties["name"].description.as_deref(), Some("The group name"));
        assert_eq!(schema.properties["ingress"].description.as_deref(), Some("Inbound rules"));
        assert_eq!(nested_description(&schema, "ingress", "from_port"), Some("Start port"));
        // nested maps replace wholesale
        assert_eq!(nested_description(&schema, "ingress", "protocol"), None);
    }

    #[test]
    fn test_docs_detached_nested_argument_goes_to_first_matching_block() {
        // `from_port` was written for `ingress`, but `egress` sorts first and
        // also declares it, so the description lands on `egress`.
        let mut schema = ResourceSchema::v0()
            .with_property("egress", block(&["from_port"]))
            .with_property("ingress", block(&["from_port", "cidr_blocks"]));
        let docs = EntityDocs {
            arguments: BTreeMap::from([(
                "from_port".to_string(),
                ArgumentDocs {
                    description: "The start port".into(),
                    is_nested: true,
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };

        overlay_docs(&mut schema, &docs);
        assert_eq!(nested_description(&schema, "egress", "from_port"), Some("The start port"));
        assert_eq!(nested_description(&schema, "ingress", "from_port"), None);
    }

    #[test]
    fn test_apply_docs_updates_target_view() {
        let mut registry = registry();
        let docs = EntityDocs {
            arguments: BTreeMap::from([(
                "ami".to_string(),
                ArgumentDocs {
                    description: "The machine image".into(),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        registry
            .apply_docs(EntityKind::Resource, "aws_instance", &docs)
            .unwrap();
        let binding = registry.resource("aws:ec2/instance:Instance").unwrap();
        assert_eq!(
            binding.target.properties["imageId"].description.as_deref(),
            Some("The machine image")
        );
        assert_eq!(binding.target.delete_before_replace, Some(true));
    }
}
