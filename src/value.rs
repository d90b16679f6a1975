//! Structured property values exchanged with the orchestration engine.
//!
//! A [`PropertyValue`] is the target-side representation of resource inputs,
//! outputs, and function arguments. Besides the JSON-like primitives it carries
//! three tags that must survive every translation step:
//!
//! - [`PropertyValue::Set`]: an unordered collection, always kept in canonical
//!   order and free of duplicates.
//! - [`PropertyValue::Unknown`]: a value that is not yet determined (preview).
//! - [`PropertyValue::Secret`]: a value that must be redacted in output.
//!
//! # Wire form
//!
//! On the wire a value is plain JSON. The tags are encoded with reserved
//! markers so that a value always decodes to exactly what was encoded:
//!
//! ```text
//! "04da6b54-80e4-46f7-96ec-b56ff0331ba9"                      Unknown
//! {"4dabf18193072939515e22adb298388d": "1b47061264138c4ac30d75fd1eb44270",
//!  "value": ...}                                             Secret
//! {"4dabf18193072939515e22adb298388d": "c8a5a1c9e4bb40d3b2cb5b0b6a4c1f2e",
//!  "elements": [...]}                                         Set
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// The string used on the wire to denote an unknown value.
pub const UNKNOWN_SENTINEL: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

/// Key marking an object as a specially tagged value on the wire.
pub const SIG_KEY: &str = "4dabf18193072939515e22adb298388d";

/// Signature value for secrets.
pub const SECRET_SIG: &str = "1b47061264138c4ac30d75fd1eb44270";

/// Signature value for sets.
pub const SET_SIG: &str = "c8a5a1c9e4bb40d3b2cb5b0b6a4c1f2e";

/// A tagged, structured property value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyValue {
    /// The absence of a value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. All numbers are carried as 64-bit floats.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered sequence.
    List(Vec<PropertyValue>),
    /// An unordered, deduplicated collection kept in canonical order.
    /// Construct with [`PropertyValue::set`] to uphold the ordering.
    Set(Vec<PropertyValue>),
    /// A map with unique string keys.
    Map(BTreeMap<String, PropertyValue>),
    /// A value not yet known (preview only).
    Unknown,
    /// A value requiring redaction.
    Secret(Box<PropertyValue>),
}

/// Ordered property bag, keyed by property name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

impl PropertyValue {
    /// Create a set, sorting and deduplicating the elements.
    pub fn set(elements: impl IntoIterator<Item = PropertyValue>) -> Self {
        let mut elements: Vec<_> = elements.into_iter().collect();
        canonicalize_set(&mut elements);
        Self::Set(elements)
    }

    /// Create a list.
    pub fn list(elements: impl IntoIterator<Item = PropertyValue>) -> Self {
        Self::List(elements.into_iter().collect())
    }

    /// Create a map from name/value pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, PropertyValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a value as a secret. Secrets are never nested.
    pub fn secret(value: PropertyValue) -> Self {
        match value {
            Self::Secret(inner) => Self::Secret(inner),
            other => Self::Secret(Box::new(other)),
        }
    }

    /// Returns true for [`PropertyValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if this value, ignoring a secret wrapper, is unknown.
    pub fn is_unknown(&self) -> bool {
        match self {
            Self::Unknown => true,
            Self::Secret(inner) => inner.is_unknown(),
            _ => false,
        }
    }

    /// Returns true if this value is a secret.
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }

    /// Returns true if an unknown appears anywhere inside this value.
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown => true,
            Self::Secret(inner) => inner.contains_unknown(),
            Self::List(items) | Self::Set(items) => items.iter().any(Self::contains_unknown),
            Self::Map(map) => map.values().any(Self::contains_unknown),
            _ => false,
        }
    }

    /// Peel off a secret wrapper, if any.
    pub fn reveal(&self) -> &PropertyValue {
        match self {
            Self::Secret(inner) => inner.reveal(),
            other => other,
        }
    }

    /// Consume the value, peeling off a secret wrapper.
    pub fn into_revealed(self) -> PropertyValue {
        match self {
            Self::Secret(inner) => inner.into_revealed(),
            other => other,
        }
    }

    /// Borrow the string, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the map, if this is a map.
    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// A short name for the value's kind, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Unknown => "unknown",
            Self::Secret(_) => "secret",
        }
    }

    /// Structural equality that treats sets by content, regardless of how
    /// they were constructed.
    pub fn semantically_eq(&self, other: &PropertyValue) -> bool {
        canonical_cmp(&self.canonical(), &other.canonical()) == Ordering::Equal
    }

    /// Return a copy with every nested set in canonical order.
    pub fn canonical(&self) -> PropertyValue {
        match self {
            Self::List(items) => Self::List(items.iter().map(Self::canonical).collect()),
            Self::Set(items) => Self::set(items.iter().map(Self::canonical)),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.canonical()))
                    .collect(),
            ),
            Self::Secret(inner) => Self::secret(inner.canonical()),
            other => other.clone(),
        }
    }

    /// Returns true if a NaN or infinite number appears anywhere in the value.
    pub fn has_non_finite(&self) -> bool {
        match self {
            Self::Number(n) => !n.is_finite(),
            Self::List(items) | Self::Set(items) => items.iter().any(Self::has_non_finite),
            Self::Map(map) => map.values().any(Self::has_non_finite),
            Self::Secret(inner) => inner.has_non_finite(),
            _ => false,
        }
    }

    /// Convert to the JSON wire form.
    ///
    /// JSON has no NaN or infinity; such numbers come out as null here.
    /// Serializing a value rejects them instead, so they never reach the wire.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Set(items) => {
                let mut obj = serde_json::Map::new();
                obj.insert(SIG_KEY.to_string(), Value::String(SET_SIG.to_string()));
                obj.insert(
                    "elements".to_string(),
                    Value::Array(items.iter().map(Self::to_json).collect()),
                );
                Value::Object(obj)
            }
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Unknown => Value::String(UNKNOWN_SENTINEL.to_string()),
            Self::Secret(inner) => {
                let mut obj = serde_json::Map::new();
                obj.insert(SIG_KEY.to_string(), Value::String(SECRET_SIG.to_string()));
                obj.insert("value".to_string(), inner.to_json());
                Value::Object(obj)
            }
        }
    }

    /// Convert from the JSON wire form.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            Value::String(s) if s == UNKNOWN_SENTINEL => Self::Unknown,
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(mut obj) => match obj.get(SIG_KEY).and_then(Value::as_str) {
                Some(SECRET_SIG) => {
                    let inner = obj.remove("value").unwrap_or(Value::Null);
                    Self::secret(Self::from_json(inner))
                }
                Some(SET_SIG) => match obj.remove("elements") {
                    Some(Value::Array(items)) => {
                        Self::set(items.into_iter().map(Self::from_json))
                    }
                    _ => Self::set(Vec::new()),
                },
                _ => Self::Map(
                    obj.into_iter()
                        .map(|(k, v)| (k, Self::from_json(v)))
                        .collect(),
                ),
            },
        }
    }
}

/// Sort and deduplicate set elements in canonical order.
pub fn canonicalize_set(elements: &mut Vec<PropertyValue>) {
    elements.sort_by(canonical_cmp);
    elements.dedup_by(|a, b| canonical_cmp(a, b) == Ordering::Equal);
}

fn rank(value: &PropertyValue) -> u8 {
    match value {
        PropertyValue::Null => 0,
        PropertyValue::Bool(_) => 1,
        PropertyValue::Number(_) => 2,
        PropertyValue::String(_) => 3,
        PropertyValue::List(_) => 4,
        PropertyValue::Set(_) => 5,
        PropertyValue::Map(_) => 6,
        PropertyValue::Unknown => 7,
        PropertyValue::Secret(_) => 8,
    }
}

/// Total order over property values used to canonicalize sets.
///
/// Values of different kinds order by kind; numbers use IEEE total ordering.
pub fn canonical_cmp(a: &PropertyValue, b: &PropertyValue) -> Ordering {
    use PropertyValue::*;
    match (a, b) {
        (Bool(x), Bool(y)) => x.cmp(y),
        (Number(x), Number(y)) => x.total_cmp(y),
        (String(x), String(y)) => x.cmp(y),
        (List(x), List(y)) | (Set(x), Set(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = canonical_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Map(x), Map(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| canonical_cmp(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Secret(x), Secret(y)) => canonical_cmp(x, y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("[secret]"),
            Self::Unknown => f.write_str("[unknown]"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.has_non_finite() {
            return Err(serde::ser::Error::custom(
                "non-finite number cannot be represented in JSON",
            ));
        }
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(map: PropertyMap) -> Self {
        Self::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_is_canonical() {
        let a = PropertyValue::set(vec!["b".into(), "a".into(), "b".into()]);
        let b = PropertyValue::set(vec!["a".into(), "b".into()]);
        assert_eq!(a, b);
        assert_eq!(
            a,
            PropertyValue::Set(vec![
                PropertyValue::String("a".into()),
                PropertyValue::String("b".into())
            ])
        );
    }

    #[test]
    fn test_semantic_eq_for_raw_sets() {
        let raw = PropertyValue::Set(vec!["b".into(), "a".into()]);
        let canonical = PropertyValue::set(vec!["a".into(), "b".into()]);
        assert_ne!(raw, canonical);
        assert!(raw.semantically_eq(&canonical));

        let list_ab = PropertyValue::list(vec!["a".into(), "b".into()]);
        let list_ba = PropertyValue::list(vec!["b".into(), "a".into()]);
        assert!(!list_ab.semantically_eq(&list_ba));
    }

    #[test]
    fn test_wire_form_preserves_tags() {
        let value = PropertyValue::map(vec![
            ("name", PropertyValue::from("web")),
            ("password", PropertyValue::secret("hunter2".into())),
            ("ip", PropertyValue::Unknown),
            ("tags", PropertyValue::set(vec!["b".into(), "a".into()])),
            ("ports", PropertyValue::list(vec![80i64.into(), 443i64.into()])),
        ]);

        let bytes = serde_json::to_vec(&value).unwrap();
        let back: PropertyValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_from_plain_json() {
        let value = PropertyValue::from(json!({
            "count": 3,
            "enabled": true,
            "zone": UNKNOWN_SENTINEL,
        }));
        assert_eq!(value.get("count"), Some(&PropertyValue::Number(3.0)));
        assert_eq!(value.get("enabled"), Some(&PropertyValue::Bool(true)));
        assert!(value.get("zone").is_some_and(PropertyValue::is_unknown));
    }

    #[test]
    fn test_secret_never_nests() {
        let twice = PropertyValue::secret(PropertyValue::secret("x".into()));
        assert_eq!(twice, PropertyValue::Secret(Box::new("x".into())));
        assert_eq!(twice.reveal(), &PropertyValue::from("x"));
    }

    #[test]
    fn test_contains_unknown() {
        let nested = PropertyValue::list(vec![PropertyValue::map(vec![(
            "a",
            PropertyValue::Unknown,
        )])]);
        assert!(nested.contains_unknown());
        assert!(!nested.is_unknown());
        assert!(PropertyValue::secret(PropertyValue::Unknown).is_unknown());
    }

    #[test]
    fn test_display_redacts_secrets() {
        let value = PropertyValue::secret("hunter2".into());
        assert_eq!(value.to_string(), "[secret]");
    }

    #[test]
    fn test_non_finite_numbers_fail_to_serialize() {
        let value = PropertyValue::map(vec![(
            "limits",
            PropertyValue::list(vec![PropertyValue::secret(PropertyValue::Number(f64::NAN))]),
        )]);
        assert!(value.has_non_finite());
        let err = serde_json::to_string(&value).unwrap_err();
        assert!(err.to_string().contains("non-finite"));

        assert!(serde_json::to_string(&PropertyValue::Number(f64::INFINITY)).is_err());
        let finite = PropertyValue::map(vec![("count", PropertyValue::Number(2.5))]);
        assert!(!finite.has_non_finite());
        assert_eq!(serde_json::to_string(&finite).unwrap(), r#"{"count":2.5}"#);
    }
}
