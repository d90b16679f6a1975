//! Per-property change classification.
//!
//! The [`DiffEngine`] compares the engine-side view of a resource's old state
//! with its new inputs. It is pure: given the same values and schema it always
//! produces the same, sorted, [`DiffResult`].

use std::collections::BTreeSet;

use crate::schema::{PropertyShape, ResourceSchema, ShapeKind};
use crate::types::{DiffResult, ReplacementOrder};
use crate::value::PropertyValue;

/// Computes diffs between old state and new inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine {
    default_order: ReplacementOrder,
}

#[derive(Default)]
struct Accumulator {
    changes: BTreeSet<String>,
    replaces: BTreeSet<String>,
    stables: BTreeSet<String>,
}

impl DiffEngine {
    /// Create an engine using `default_order` for schemas that declare no
    /// replacement order.
    pub fn new(default_order: ReplacementOrder) -> Self {
        Self { default_order }
    }

    /// Compare `old` state with `new` inputs under `schema`.
    ///
    /// - Lists compare in order, sets by content, maps and objects deeply.
    /// - An unknown new value is always a change.
    /// - Computed-only properties, and optional+computed properties absent
    ///   from the new inputs, are not compared.
    /// - A changed `force_new` property requires replacement, as do the
    ///   properties the schema declares as its dependents.
    pub fn compute(
        &self,
        old: &PropertyValue,
        new: &PropertyValue,
        schema: &ResourceSchema,
    ) -> DiffResult {
        let mut acc = Accumulator::default();
        walk(schema, old, new, "", &mut acc);

        let replaced: Vec<String> = acc.replaces.iter().cloned().collect();
        for name in replaced {
            if let Some(deps) = schema.dependents.get(&name) {
                for dep in deps {
                    acc.changes.insert(dep.clone());
                    acc.replaces.insert(dep.clone());
                    acc.stables.remove(dep);
                }
            }
        }

        let replacement_order = match schema.delete_before_replace {
            Some(true) => ReplacementOrder::DeleteBeforeCreate,
            Some(false) => ReplacementOrder::CreateBeforeDelete,
            None => self.default_order,
        };

        DiffResult {
            changes: acc.changes.into_iter().collect(),
            replaces: acc.replaces.into_iter().collect(),
            stables: acc.stables.into_iter().collect(),
            replacement_order,
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn walk(
    schema: &ResourceSchema,
    old: &PropertyValue,
    new: &PropertyValue,
    prefix: &str,
    acc: &mut Accumulator,
) -> bool {
    let mut changed = false;
    for (name, shape) in &schema.properties {
        if shape.is_computed_only() {
            continue;
        }
        let old_value = old.reveal().get(name).map(PropertyValue::reveal);
        let new_value = new.reveal().get(name).map(PropertyValue::reveal);
        let absent = new_value.map_or(true, PropertyValue::is_null);
        if shape.flags.optional && shape.flags.computed && absent {
            continue;
        }

        let path = join(prefix, name);
        let null = PropertyValue::Null;
        let old_value = old_value.unwrap_or(&null);
        let new_value = new_value.unwrap_or(&null);

        if compare(shape, old_value, new_value, &path, acc) {
            changed = true;
            acc.changes.insert(path.clone());
            if shape.force_new {
                acc.replaces.insert(path);
            }
        } else if prefix.is_empty() && !shape.flags.computed && !absent {
            acc.stables.insert(path);
        }
    }
    changed
}

/// Returns true if the property changed.
fn compare(
    shape: &PropertyShape,
    old: &PropertyValue,
    new: &PropertyValue,
    path: &str,
    acc: &mut Accumulator,
) -> bool {
    if let (ShapeKind::Object(nested), PropertyValue::Map(_), PropertyValue::Map(_)) =
        (&shape.kind, old, new)
    {
        return walk(nested, old, new, path, acc);
    }
    if new.contains_unknown() {
        return true;
    }
    !plain(&shape.kind, old).semantically_eq(&plain(&shape.kind, new))
}

/// Strip secret tags and read collections the way the shape orders them.
fn plain(kind: &ShapeKind, value: &PropertyValue) -> PropertyValue {
    match (kind, value.reveal()) {
        (ShapeKind::Set(element), PropertyValue::List(items) | PropertyValue::Set(items)) => {
            PropertyValue::set(items.iter().map(|i| plain(element, i)))
        },
        (ShapeKind::List(element), PropertyValue::List(items) | PropertyValue::Set(items)) => {
            PropertyValue::List(items.iter().map(|i| plain(element, i)).collect())
        },
        (ShapeKind::Map(element), PropertyValue::Map(entries)) => PropertyValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), plain(element, v)))
                .collect(),
        ),
        (ShapeKind::Object(schema), PropertyValue::Map(entries)) => PropertyValue::Map(
            entries
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| {
                    let value = match schema.property(k) {
                        Some(shape) => plain(&shape.kind, v),
                        None => v.reveal().clone(),
                    };
                    (k.clone(), value)
                })
                .collect(),
        ),
        (_, other) => other.clone(),
    }
}
