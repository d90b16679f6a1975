//! Translation between structured values and the plugin's flat attribute bag.
//!
//! The plugin stores state as a flat `key -> string` map ("flatmap"):
//!
//! ```text
//! name                  primitive
//! name.#  name.<i>      list/set count and elements
//! name.%  name.<key>    map/object count and entries
//! ```
//!
//! Absent keys mean Null. Unknown values use [`FLAT_UNKNOWN`], stored in the
//! count key for containers. Sets are always written in canonical order so
//! repeated encodes are byte-identical.
//!
//! Structured values use target property names, the flatmap uses plugin
//! names. A [`StateCodec`] holds the plugin schema plus the mapping overrides
//! and walks both trees with a single recursive transformer.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::BridgeError;
use crate::mapping::{flattens, property_name, PropertyInfo, StateUpgrade, TypeHint, UpgradeOp};
use crate::registry::NO_FIELDS;
use crate::schema::{PropertyShape, ResourceSchema, ShapeKind};
use crate::value::{PropertyMap, PropertyValue};

/// The flatmap value standing for an unknown.
pub const FLAT_UNKNOWN: &str = "74D93920-ED26-11E3-AC10-0800200C9A66";

/// A flat attribute bag.
pub type Attributes = BTreeMap<String, String>;

/// The result of encoding a structured value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoded {
    /// The flat attributes.
    pub attributes: Attributes,
    /// Flat paths whose values were secret, to be re-tagged on decode.
    pub secrets: BTreeSet<String>,
}

/// Encodes and decodes state for one plugin schema.
#[derive(Debug, Clone, Copy)]
pub struct StateCodec<'a> {
    schema: &'a ResourceSchema,
    fields: &'a BTreeMap<String, PropertyInfo>,
}

impl<'a> StateCodec<'a> {
    /// Create a codec for a plugin schema and its mapping overrides.
    pub fn new(schema: &'a ResourceSchema, fields: &'a BTreeMap<String, PropertyInfo>) -> Self {
        Self { schema, fields }
    }

    /// Create a codec with no mapping overrides.
    pub fn plain(schema: &'a ResourceSchema) -> Self {
        Self::new(schema, &NO_FIELDS)
    }

    /// Flatten a structured property map into plugin attributes.
    pub fn encode(&self, value: &PropertyValue) -> Result<Encoded, BridgeError> {
        let mut out = Encoded::default();
        match value.reveal() {
            PropertyValue::Null => {},
            PropertyValue::Map(map) => encode_object(self.schema, self.fields, map, "", &mut out)?,
            other => {
                return Err(BridgeError::translation(
                    "",
                    format!("expected a property map, got {}", other.kind_name()),
                ))
            },
        }
        Ok(out)
    }

    /// Rebuild a structured property map from plugin attributes.
    pub fn decode(
        &self,
        attributes: &Attributes,
        secrets: &BTreeSet<String>,
    ) -> Result<PropertyValue, BridgeError> {
        let ctx = DecodeCtx {
            attributes,
            secrets,
        };
        decode_object(&ctx, self.schema, self.fields, "").map(PropertyValue::Map)
    }

    /// The canonical form of a value: what a plugin round trip would return.
    pub fn normalize(&self, value: &PropertyValue) -> Result<PropertyValue, BridgeError> {
        let encoded = self.encode(value)?;
        self.decode(&encoded.attributes, &encoded.secrets)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn nested_fields(info: Option<&PropertyInfo>) -> &BTreeMap<String, PropertyInfo> {
    info.map(|i| &i.fields).unwrap_or(&NO_FIELDS)
}

fn encode_object(
    schema: &ResourceSchema,
    fields: &BTreeMap<String, PropertyInfo>,
    map: &PropertyMap,
    prefix: &str,
    out: &mut Encoded,
) -> Result<(), BridgeError> {
    let mut consumed = 0;
    for (name, shape) in &schema.properties {
        let info = fields.get(name);
        let Some(value) = map.get(&property_name(name, shape, info)) else {
            continue;
        };
        consumed += 1;
        encode_property(shape, info, value, &join(prefix, name), out)?;
    }
    if consumed < map.len() {
        let known: BTreeSet<String> = schema
            .properties
            .iter()
            .map(|(name, shape)| property_name(name, shape, fields.get(name)))
            .collect();
        if let Some(unknown) = map.keys().find(|k| !known.contains(*k)) {
            return Err(BridgeError::translation(
                join(prefix, unknown),
                "property is not declared by the schema",
            ));
        }
    }
    Ok(())
}

fn encode_property(
    shape: &PropertyShape,
    info: Option<&PropertyInfo>,
    value: &PropertyValue,
    path: &str,
    out: &mut Encoded,
) -> Result<(), BridgeError> {
    if !flattens(shape, info) {
        return encode_value(&shape.kind, info, value, path, out);
    }

    if value.is_secret() {
        out.secrets.insert(path.to_string());
    }
    let wrapped = match value.reveal() {
        PropertyValue::Null => return Ok(()),
        PropertyValue::Unknown => PropertyValue::Unknown,
        single => match shape.kind {
            ShapeKind::Set(_) => PropertyValue::set([single.clone()]),
            _ => PropertyValue::list([single.clone()]),
        },
    };
    encode_value(&shape.kind, info, &wrapped, path, out)
}

fn encode_value(
    kind: &ShapeKind,
    info: Option<&PropertyInfo>,
    value: &PropertyValue,
    path: &str,
    out: &mut Encoded,
) -> Result<(), BridgeError> {
    if value.is_secret() {
        out.secrets.insert(path.to_string());
    }
    let value = value.reveal();
    if value.is_null() {
        return Ok(());
    }

    match kind {
        ShapeKind::String | ShapeKind::Number | ShapeKind::Bool => {
            let flat = if value.is_unknown() {
                FLAT_UNKNOWN.to_string()
            } else {
                encode_primitive(kind, value, path)?
            };
            out.attributes.insert(path.to_string(), flat);
        },
        ShapeKind::List(element) | ShapeKind::Set(element) => {
            let count_key = join(path, "#");
            let items = match value {
                PropertyValue::Unknown => {
                    out.attributes.insert(count_key, FLAT_UNKNOWN.to_string());
                    return Ok(());
                },
                PropertyValue::List(items) | PropertyValue::Set(items) => items,
                other => return Err(mismatch(path, kind, other)),
            };
            let ordered = match kind {
                ShapeKind::Set(_) => PropertyValue::set(items.iter().cloned()),
                _ => PropertyValue::List(items.clone()),
            };
            let (PropertyValue::List(items) | PropertyValue::Set(items)) = &ordered else {
                return Ok(());
            };
            out.attributes.insert(count_key, items.len().to_string());
            for (i, item) in items.iter().enumerate() {
                if item.is_null() {
                    return Err(BridgeError::translation(
                        join(path, &i.to_string()),
                        "null collection elements cannot be represented",
                    ));
                }
                encode_value(element, info, item, &join(path, &i.to_string()), out)?;
            }
        },
        ShapeKind::Map(element) => {
            let count_key = join(path, "%");
            let entries = match value {
                PropertyValue::Unknown => {
                    out.attributes.insert(count_key, FLAT_UNKNOWN.to_string());
                    return Ok(());
                },
                PropertyValue::Map(entries) => entries,
                other => return Err(mismatch(path, kind, other)),
            };
            out.attributes.insert(count_key, entries.len().to_string());
            for (key, item) in entries {
                let item_path = join(path, key);
                if key.is_empty() || key == "%" || key == "#" {
                    return Err(BridgeError::translation(item_path, "reserved map key"));
                }
                if key.contains('.') && !element.is_primitive() {
                    return Err(BridgeError::translation(
                        item_path,
                        "map keys containing '.' are only supported for primitive elements",
                    ));
                }
                if item.is_null() {
                    return Err(BridgeError::translation(
                        item_path,
                        "null map entries cannot be represented",
                    ));
                }
                encode_value(element, info, item, &item_path, out)?;
            }
        },
        ShapeKind::Object(schema) => {
            let count_key = join(path, "%");
            let map = match value {
                PropertyValue::Unknown => {
                    out.attributes.insert(count_key, FLAT_UNKNOWN.to_string());
                    return Ok(());
                },
                PropertyValue::Map(map) => map,
                other => return Err(mismatch(path, kind, other)),
            };
            let present = map.values().filter(|v| !v.is_null()).count();
            out.attributes.insert(count_key, present.to_string());
            encode_object(schema, nested_fields(info), map, path, out)?;
        },
    }
    Ok(())
}

fn encode_primitive(kind: &ShapeKind, value: &PropertyValue, path: &str) -> Result<String, BridgeError> {
    let flat = match value {
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::Number(n) => format_number(*n, path)?,
        PropertyValue::String(s) => s.clone(),
        other => return Err(mismatch(path, kind, other)),
    };
    // The flat string must parse back as the plugin's own type.
    match kind {
        ShapeKind::Number => {
            parse_number(&flat, path)?;
        },
        ShapeKind::Bool => {
            return parse_bool(&flat, path).map(|b| b.to_string());
        },
        _ => {},
    }
    Ok(flat)
}

/// Format a number the way the plugin writes it: integral values without a
/// fraction.
pub fn format_number(n: f64, path: &str) -> Result<String, BridgeError> {
    if !n.is_finite() {
        return Err(BridgeError::translation(
            path,
            format!("non-finite number {} cannot be represented", n),
        ));
    }
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Ok(format!("{}", n as i64))
    } else {
        Ok(format!("{}", n))
    }
}

fn parse_number(s: &str, path: &str) -> Result<f64, BridgeError> {
    match s.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(BridgeError::translation(
            path,
            format!("'{}' is not a number", s),
        )),
    }
}

fn parse_bool(s: &str, path: &str) -> Result<bool, BridgeError> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(BridgeError::translation(
            path,
            format!("'{}' is not a bool", s),
        )),
    }
}

fn mismatch(path: &str, kind: &ShapeKind, got: &PropertyValue) -> BridgeError {
    BridgeError::translation(
        path,
        format!("expected {}, got {}", kind.name(), got.kind_name()),
    )
}

struct DecodeCtx<'a> {
    attributes: &'a Attributes,
    secrets: &'a BTreeSet<String>,
}

impl DecodeCtx<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Keys below `path.`, with the prefix stripped.
    fn children<'s>(&'s self, path: &str) -> impl Iterator<Item = &'s str> + 's {
        let prefix = format!("{}.", path);
        let skip = prefix.len();
        self.attributes
            .range(prefix.clone()..)
            .map(|(k, _)| k.as_str())
            .take_while(move |k| k.starts_with(&prefix))
            .map(move |k| &k[skip..])
    }

    fn tag(&self, path: &str, value: PropertyValue) -> PropertyValue {
        if !value.is_null() && self.secrets.contains(path) {
            PropertyValue::secret(value)
        } else {
            value
        }
    }
}

fn decode_object(
    ctx: &DecodeCtx<'_>,
    schema: &ResourceSchema,
    fields: &BTreeMap<String, PropertyInfo>,
    prefix: &str,
) -> Result<PropertyMap, BridgeError> {
    let mut map = PropertyMap::new();
    for (name, shape) in &schema.properties {
        let info = fields.get(name);
        let value = decode_property(ctx, shape, info, &join(prefix, name))?;
        if !value.is_null() {
            map.insert(property_name(name, shape, info), value);
        }
    }
    Ok(map)
}

fn decode_property(
    ctx: &DecodeCtx<'_>,
    shape: &PropertyShape,
    info: Option<&PropertyInfo>,
    path: &str,
) -> Result<PropertyValue, BridgeError> {
    let mut value = decode_value(ctx, &shape.kind, info, path)?;

    if flattens(shape, info) {
        let secret = value.is_secret();
        value = match value.into_revealed() {
            PropertyValue::List(items) | PropertyValue::Set(items) => {
                if items.len() > 1 {
                    return Err(BridgeError::translation(
                        path,
                        format!("expected at most one item, found {}", items.len()),
                    ));
                }
                items.into_iter().next().unwrap_or_default()
            },
            other => other,
        };
        if secret && !value.is_null() {
            value = PropertyValue::secret(value);
        }
    }

    let forced = shape.flags.sensitive || info.and_then(|i| i.secret).unwrap_or(false);
    if forced && !value.is_null() {
        value = PropertyValue::secret(value);
    }
    Ok(value)
}

fn decode_value(
    ctx: &DecodeCtx<'_>,
    kind: &ShapeKind,
    info: Option<&PropertyInfo>,
    path: &str,
) -> Result<PropertyValue, BridgeError> {
    let value = match kind {
        ShapeKind::String | ShapeKind::Number | ShapeKind::Bool => match ctx.get(path) {
            None => PropertyValue::Null,
            Some(FLAT_UNKNOWN) => PropertyValue::Unknown,
            Some(flat) => decode_primitive(kind, info.and_then(|i| i.coerce), flat, path)?,
        },
        ShapeKind::List(element) | ShapeKind::Set(element) => {
            match ctx.get(&join(path, "#")) {
                None => PropertyValue::Null,
                Some(FLAT_UNKNOWN) => PropertyValue::Unknown,
                Some(count) => {
                    let count = parse_count(count, path)?;
                    let mut items = Vec::with_capacity(count);
                    for i in 0..count {
                        let item_path = join(path, &i.to_string());
                        items.push(decode_value(ctx, element, info, &item_path)?);
                    }
                    match kind {
                        ShapeKind::Set(_) => PropertyValue::set(items),
                        _ => PropertyValue::List(items),
                    }
                },
            }
        },
        ShapeKind::Map(element) => match ctx.get(&join(path, "%")) {
            None => PropertyValue::Null,
            Some(FLAT_UNKNOWN) => PropertyValue::Unknown,
            Some(count) => {
                let count = parse_count(count, path)?;
                let keys: BTreeSet<&str> = ctx
                    .children(path)
                    .filter(|rest| *rest != "%")
                    .map(|rest| {
                        if element.is_primitive() {
                            rest
                        } else {
                            rest.split('.').next().unwrap_or(rest)
                        }
                    })
                    .collect();
                if keys.len() != count {
                    return Err(BridgeError::translation(
                        path,
                        format!("map count {} does not match {} entries", count, keys.len()),
                    ));
                }
                let mut entries = PropertyMap::new();
                for key in keys {
                    let item = decode_value(ctx, element, info, &join(path, key))?;
                    entries.insert(key.to_string(), item);
                }
                PropertyValue::Map(entries)
            },
        },
        ShapeKind::Object(schema) => match ctx.get(&join(path, "%")) {
            None => PropertyValue::Null,
            Some(FLAT_UNKNOWN) => PropertyValue::Unknown,
            Some(count) => {
                parse_count(count, path)?;
                PropertyValue::Map(decode_object(ctx, schema, nested_fields(info), path)?)
            },
        },
    };
    Ok(ctx.tag(path, value))
}

fn decode_primitive(
    kind: &ShapeKind,
    coerce: Option<TypeHint>,
    flat: &str,
    path: &str,
) -> Result<PropertyValue, BridgeError> {
    let target = coerce.unwrap_or(match kind {
        ShapeKind::Number => TypeHint::Number,
        ShapeKind::Bool => TypeHint::Bool,
        _ => TypeHint::String,
    });
    Ok(match target {
        TypeHint::String => PropertyValue::String(flat.to_string()),
        TypeHint::Number => PropertyValue::Number(parse_number(flat, path)?),
        TypeHint::Bool => PropertyValue::Bool(parse_bool(flat, path)?),
    })
}

fn parse_count(count: &str, path: &str) -> Result<usize, BridgeError> {
    count.parse().map_err(|_| {
        BridgeError::translation(path, format!("malformed count '{}'", count))
    })
}

/// Mark computed-only properties unknown where an unknown input feeds them.
///
/// Works on the engine-side schema. An unknown input invalidates the
/// properties the schema lists as its dependents; an unknown input without
/// declared dependents invalidates every computed-only property.
pub fn mark_unknown_computed(
    schema: &ResourceSchema,
    inputs: &PropertyValue,
    state: PropertyValue,
) -> PropertyValue {
    let PropertyValue::Map(mut state) = state.into_revealed() else {
        return state_or_empty(inputs);
    };
    let Some(inputs) = inputs.as_map() else {
        return PropertyValue::Map(state);
    };

    let mut invalidated: BTreeSet<&str> = BTreeSet::new();
    for (name, value) in inputs {
        if !value.contains_unknown() {
            continue;
        }
        match schema.dependents.get(name) {
            Some(deps) => invalidated.extend(deps.iter().map(String::as_str)),
            None => invalidated.extend(computed_only(schema)),
        }
    }
    for name in invalidated {
        if schema.property(name).is_some_and(PropertyShape::is_computed_only) {
            state.insert(name.to_string(), PropertyValue::Unknown);
        }
    }
    PropertyValue::Map(state)
}

fn state_or_empty(inputs: &PropertyValue) -> PropertyValue {
    match inputs {
        PropertyValue::Map(map) => PropertyValue::Map(map.clone()),
        _ => PropertyValue::Map(PropertyMap::new()),
    }
}

fn computed_only(schema: &ResourceSchema) -> impl Iterator<Item = &str> {
    schema
        .properties
        .iter()
        .filter(|(_, shape)| shape.is_computed_only())
        .map(|(name, _)| name.as_str())
}

/// The preview state of a resource about to be created: the inputs plus
/// every computed property the inputs leave unset as unknown. That covers
/// optional+computed properties, which the plugin fills in when omitted.
pub fn preview_create(schema: &ResourceSchema, inputs: &PropertyValue) -> PropertyValue {
    let mut state = match inputs.as_map() {
        Some(map) => map.clone(),
        None => PropertyMap::new(),
    };
    for (name, shape) in &schema.properties {
        if !shape.flags.computed || shape.flags.required {
            continue;
        }
        match state.get(name) {
            None | Some(PropertyValue::Null) => {
                state.insert(name.clone(), PropertyValue::Unknown);
            },
            Some(_) => {},
        }
    }
    PropertyValue::Map(state)
}

/// Upgrade state written under `from_version` to `current_version`.
pub fn upgrade(
    state: PropertyValue,
    from_version: u64,
    current_version: u64,
    upgrades: &[StateUpgrade],
) -> Result<PropertyValue, BridgeError> {
    if from_version > current_version {
        return Err(BridgeError::translation(
            "",
            format!(
                "state version {} is newer than schema version {}",
                from_version, current_version
            ),
        ));
    }
    if from_version == current_version {
        return Ok(state);
    }

    let kind = state.kind_name();
    let PropertyValue::Map(mut map) = state else {
        return Err(BridgeError::translation(
            "",
            format!("cannot upgrade {} state", kind),
        ));
    };
    for version in from_version..current_version {
        let step = upgrades
            .iter()
            .find(|u| u.from_version == version)
            .ok_or_else(|| {
                BridgeError::translation(
                    "",
                    format!("no upgrade from schema version {}", version),
                )
            })?;
        for op in &step.ops {
            apply_op(&mut map, op)?;
        }
    }
    Ok(PropertyValue::Map(map))
}

fn apply_op(map: &mut PropertyMap, op: &UpgradeOp) -> Result<(), BridgeError> {
    match op {
        UpgradeOp::Rename { from, to } => {
            if let Some(value) = map.remove(from) {
                map.insert(to.clone(), value);
            }
        },
        UpgradeOp::Remove { property } => {
            map.remove(property);
        },
        UpgradeOp::SetDefault { property, value } => {
            map.entry(property.clone()).or_insert_with(|| value.clone());
        },
        UpgradeOp::Retype { property, to } => {
            if let Some(value) = map.remove(property) {
                map.insert(property.clone(), retype(value, *to, property)?);
            }
        },
        UpgradeOp::WrapInList { property } => {
            if let Some(value) = map.remove(property) {
                let wrapped = match value {
                    PropertyValue::Null | PropertyValue::List(_) => value,
                    other => PropertyValue::List(vec![other]),
                };
                map.insert(property.clone(), wrapped);
            }
        },
    }
    Ok(())
}

fn retype(value: PropertyValue, to: TypeHint, path: &str) -> Result<PropertyValue, BridgeError> {
    if let PropertyValue::Secret(inner) = value {
        return retype(*inner, to, path).map(PropertyValue::secret);
    }
    Ok(match (value, to) {
        (v @ (PropertyValue::Null | PropertyValue::Unknown), _) => v,
        (v @ PropertyValue::String(_), TypeHint::String)
        | (v @ PropertyValue::Number(_), TypeHint::Number)
        | (v @ PropertyValue::Bool(_), TypeHint::Bool) => v,
        (PropertyValue::Number(n), TypeHint::String) => PropertyValue::String(format_number(n, path)?),
        (PropertyValue::Bool(b), TypeHint::String) => PropertyValue::String(b.to_string()),
        (PropertyValue::String(s), TypeHint::Number) => PropertyValue::Number(parse_number(&s, path)?),
        (PropertyValue::String(s), TypeHint::Bool) => PropertyValue::Bool(parse_bool(&s, path)?),
        (PropertyValue::Bool(b), TypeHint::Number) => PropertyValue::Number(if b { 1.0 } else { 0.0 }),
        (PropertyValue::Number(n), TypeHint::Bool) if n == 0.0 || n == 1.0 => {
            PropertyValue::Bool(n == 1.0)
        },
        (other, _) => {
            return Err(BridgeError::translation(
                path,
                format!("cannot retype {} to {:?}", other.kind_name(), to),
            ))
        },
    })
}
