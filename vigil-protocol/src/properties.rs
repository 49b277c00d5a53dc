use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Keys under this namespace are owned by the engine and may not be set by providers.
pub const RESERVED_PREFIX: &str = "internal.";

const TYPE_KEY: &str = "type";
const VALUE_KEY: &str = "value";
const INT64_TAG: &str = "int64";
const UINT64_TAG: &str = "uint64";
const DOUBLE_TAG: &str = "double";
const STRUCT_TAG: &str = "struct";
const TAGS: [&str; 4] = [INT64_TAG, UINT64_TAG, DOUBLE_TAG, STRUCT_TAG];

/// Errors raised when building or reading a property bag.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PropertyError {
    #[error("property key {0} uses the reserved prefix")]
    ReservedKey(String),
    #[error("property {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("property {key}: value {value} does not fit in {target}")]
    OutOfRange {
        key: String,
        value: String,
        target: &'static str,
    },
    #[error("property {key}: invalid wire value: {reason}")]
    InvalidWire { key: String, reason: String },
    #[error("property {key}: {value} is not a finite number")]
    NotFinite { key: String, value: f64 },
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    String(String),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Struct(BTreeMap<String, PropertyValue>),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::String(_) => "string",
            PropertyValue::Int64(_) => INT64_TAG,
            PropertyValue::Uint64(_) => UINT64_TAG,
            PropertyValue::Double(_) => "double",
            PropertyValue::Struct(_) => "struct",
            PropertyValue::List(_) => "list",
        }
    }

    /// Encodes the value into the generic wire structure. 64-bit integers are
    /// stored as decimal strings under a type tag so that they survive a
    /// double-backed transport. Non-finite doubles are tagged the same way, and a
    /// struct whose own fields look like a tag is wrapped in a `struct` tag.
    pub fn to_wire(&self) -> Value {
        match self {
            PropertyValue::Bool(value) => Value::Bool(*value),
            PropertyValue::String(value) => Value::String(value.clone()),
            PropertyValue::Int64(value) => tagged(INT64_TAG, Value::String(value.to_string())),
            PropertyValue::Uint64(value) => tagged(UINT64_TAG, Value::String(value.to_string())),
            PropertyValue::Double(value) => match Number::from_f64(*value) {
                Some(number) => Value::Number(number),
                None => tagged(DOUBLE_TAG, Value::String(value.to_string())),
            },
            PropertyValue::Struct(fields) => {
                let object = Value::Object(
                    fields
                        .iter()
                        .map(|(key, value)| (key.clone(), value.to_wire()))
                        .collect(),
                );
                if looks_tagged(fields) {
                    tagged(STRUCT_TAG, object)
                } else {
                    object
                }
            }
            PropertyValue::List(items) => {
                Value::Array(items.iter().map(PropertyValue::to_wire).collect())
            }
        }
    }

    /// Decodes a value produced by [`PropertyValue::to_wire`]. Untagged JSON
    /// numbers are accepted as well, keeping integers exact when the number has
    /// no fractional part.
    pub fn from_wire(key: &str, value: &Value) -> Result<Self, PropertyError> {
        match value {
            Value::Bool(value) => Ok(PropertyValue::Bool(*value)),
            Value::String(value) => Ok(PropertyValue::String(value.clone())),
            Value::Number(number) => Ok(number_to_value(number)),
            Value::Array(items) => items
                .iter()
                .map(|item| PropertyValue::from_wire(key, item))
                .collect::<Result<Vec<_>, _>>()
                .map(PropertyValue::List),
            Value::Object(map) => match parse_tagged(key, map)? {
                Some(parsed) => Ok(parsed),
                None => struct_from_wire(key, map),
            },
            Value::Null => Err(PropertyError::InvalidWire {
                key: key.to_string(),
                reason: "null values are not representable".into(),
            }),
        }
    }

    /// Plain JSON view used by selectors and evaluators. Integers become JSON
    /// numbers, which is lossless inside serde_json.
    pub fn to_plain_json(&self) -> Value {
        match self {
            PropertyValue::Bool(value) => Value::Bool(*value),
            PropertyValue::String(value) => Value::String(value.clone()),
            PropertyValue::Int64(value) => Value::Number((*value).into()),
            PropertyValue::Uint64(value) => Value::Number((*value).into()),
            PropertyValue::Double(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropertyValue::Struct(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_plain_json()))
                    .collect(),
            ),
            PropertyValue::List(items) => {
                Value::Array(items.iter().map(PropertyValue::to_plain_json).collect())
            }
        }
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_KEY.to_string(), Value::String(tag.to_string()));
    map.insert(VALUE_KEY.to_string(), value);
    Value::Object(map)
}

fn looks_tagged(fields: &BTreeMap<String, PropertyValue>) -> bool {
    fields.len() == 2
        && fields.contains_key(VALUE_KEY)
        && matches!(fields.get(TYPE_KEY), Some(PropertyValue::String(tag)) if TAGS.contains(&tag.as_str()))
}

fn struct_from_wire(key: &str, map: &Map<String, Value>) -> Result<PropertyValue, PropertyError> {
    map.iter()
        .map(|(field, value)| PropertyValue::from_wire(key, value).map(|value| (field.clone(), value)))
        .collect::<Result<BTreeMap<_, _>, _>>()
        .map(PropertyValue::Struct)
}

fn parse_tagged(key: &str, map: &Map<String, Value>) -> Result<Option<PropertyValue>, PropertyError> {
    if map.len() != 2 {
        return Ok(None);
    }
    let (Some(Value::String(tag)), Some(raw)) = (map.get(TYPE_KEY), map.get(VALUE_KEY)) else {
        return Ok(None);
    };
    let invalid = |target: &str| PropertyError::InvalidWire {
        key: key.to_string(),
        reason: format!("{raw} is not a valid {target}"),
    };

    match (tag.as_str(), raw) {
        (INT64_TAG, Value::String(raw)) => raw
            .parse::<i64>()
            .map(|value| Some(PropertyValue::Int64(value)))
            .map_err(|_| invalid(INT64_TAG)),
        (UINT64_TAG, Value::String(raw)) => raw
            .parse::<u64>()
            .map(|value| Some(PropertyValue::Uint64(value)))
            .map_err(|_| invalid(UINT64_TAG)),
        (DOUBLE_TAG, Value::String(raw)) => raw
            .parse::<f64>()
            .map(|value| Some(PropertyValue::Double(value)))
            .map_err(|_| invalid(DOUBLE_TAG)),
        (STRUCT_TAG, Value::Object(fields)) => struct_from_wire(key, fields).map(Some),
        (INT64_TAG | UINT64_TAG | DOUBLE_TAG | STRUCT_TAG, _) => Err(invalid(tag.as_str())),
        _ => Ok(None),
    }
}

/// Rejects non-finite doubles anywhere inside a value.
fn check_finite(key: &str, value: &PropertyValue) -> Result<(), PropertyError> {
    match value {
        PropertyValue::Double(number) if !number.is_finite() => Err(PropertyError::NotFinite {
            key: key.to_string(),
            value: *number,
        }),
        PropertyValue::Struct(fields) => fields.values().try_for_each(|field| check_finite(key, field)),
        PropertyValue::List(items) => items.iter().try_for_each(|item| check_finite(key, item)),
        _ => Ok(()),
    }
}

fn number_to_value(number: &Number) -> PropertyValue {
    if let Some(value) = number.as_i64() {
        PropertyValue::Int64(value)
    } else if let Some(value) = number.as_u64() {
        PropertyValue::Uint64(value)
    } else {
        PropertyValue::Double(number.as_f64().unwrap_or_default())
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int64(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::Uint64(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        PropertyValue::from_wire("", &raw).map_err(D::Error::custom)
    }
}

/// A single named property with typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    key: String,
    value: PropertyValue,
}

impl Property {
    pub fn new(key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    fn mismatch(&self, expected: &'static str) -> PropertyError {
        PropertyError::TypeMismatch {
            key: self.key.clone(),
            expected,
            found: self.value.kind(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, PropertyError> {
        match &self.value {
            PropertyValue::Bool(value) => Ok(*value),
            _ => Err(self.mismatch("bool")),
        }
    }

    pub fn as_string(&self) -> Result<&str, PropertyError> {
        match &self.value {
            PropertyValue::String(value) => Ok(value),
            _ => Err(self.mismatch("string")),
        }
    }

    /// Reads an int64. A uint64 is accepted only when it fits exactly.
    pub fn as_int64(&self) -> Result<i64, PropertyError> {
        match &self.value {
            PropertyValue::Int64(value) => Ok(*value),
            PropertyValue::Uint64(value) => {
                i64::try_from(*value).map_err(|_| PropertyError::OutOfRange {
                    key: self.key.clone(),
                    value: value.to_string(),
                    target: INT64_TAG,
                })
            }
            _ => Err(self.mismatch(INT64_TAG)),
        }
    }

    /// Reads a uint64. A non-negative int64 is accepted.
    pub fn as_uint64(&self) -> Result<u64, PropertyError> {
        match &self.value {
            PropertyValue::Uint64(value) => Ok(*value),
            PropertyValue::Int64(value) => {
                u64::try_from(*value).map_err(|_| PropertyError::OutOfRange {
                    key: self.key.clone(),
                    value: value.to_string(),
                    target: UINT64_TAG,
                })
            }
            _ => Err(self.mismatch(UINT64_TAG)),
        }
    }

    pub fn as_double(&self) -> Result<f64, PropertyError> {
        match &self.value {
            PropertyValue::Double(value) => Ok(*value),
            _ => Err(self.mismatch("double")),
        }
    }

    pub fn as_struct(&self) -> Result<&BTreeMap<String, PropertyValue>, PropertyError> {
        match &self.value {
            PropertyValue::Struct(fields) => Ok(fields),
            _ => Err(self.mismatch("struct")),
        }
    }

    pub fn as_list(&self) -> Result<&[PropertyValue], PropertyError> {
        match &self.value {
            PropertyValue::List(items) => Ok(items),
            _ => Err(self.mismatch("list")),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value.to_plain_json())
    }
}

/// Schemaless property bag describing the upstream-visible state of an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    props: BTreeMap<String, Property>,
}

impl Properties {
    /// Builds a property bag, rejecting keys in the reserved namespace and
    /// non-finite doubles.
    pub fn new<K, V, I>(values: I) -> Result<Self, PropertyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let mut props = BTreeMap::new();
        for (key, value) in values {
            let key = key.into();
            if key.starts_with(RESERVED_PREFIX) {
                return Err(PropertyError::ReservedKey(key));
            }
            let value = value.into();
            check_finite(&key, &value)?;
            props.insert(key.clone(), Property::new(key, value));
        }
        Ok(Self { props })
    }

    /// Builds a property bag without the reserved-prefix check.
    ///
    /// Intended for tests and for the engine's own bookkeeping keys.
    #[doc(hidden)]
    pub fn new_allowing_reserved<K, V, I>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let props = values
            .into_iter()
            .map(|(key, value)| {
                let key = key.into();
                (key.clone(), Property::new(key, value))
            })
            .collect();
        Self { props }
    }

    /// Decodes a property bag from its wire form.
    pub fn from_wire(map: &Map<String, Value>) -> Result<Self, PropertyError> {
        let mut values = Vec::with_capacity(map.len());
        for (key, raw) in map {
            values.push((key.clone(), PropertyValue::from_wire(key, raw)?));
        }
        Self::new(values)
    }

    /// Encodes the bag into the generic wire structure.
    pub fn to_wire(&self) -> Map<String, Value> {
        self.props
            .iter()
            .map(|(key, prop)| (key.clone(), prop.value.to_wire()))
            .collect()
    }

    /// Plain JSON object of all properties.
    pub fn to_plain_json(&self) -> Value {
        Value::Object(
            self.props
                .iter()
                .map(|(key, prop)| (key.clone(), prop.value.to_plain_json()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.props.get(key)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|prop| prop.as_bool().ok())
            .unwrap_or_default()
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get(key)
            .and_then(|prop| prop.as_string().ok())
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub fn get_int64(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|prop| prop.as_int64().ok())
            .unwrap_or_default()
    }

    pub fn get_uint64(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|prop| prop.as_uint64().ok())
            .unwrap_or_default()
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.get(key)
            .and_then(|prop| prop.as_double().ok())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.props.iter().map(|(key, prop)| (key.as_str(), prop))
    }

    /// Returns a new bag with `other`'s keys overriding ours.
    pub fn merge(&self, other: &Properties) -> Properties {
        let mut props = self.props.clone();
        for (key, prop) in &other.props {
            props.insert(key.clone(), prop.clone());
        }
        Properties { props }
    }

    /// Returns a copy containing only the properties accepted by `predicate`.
    pub fn filtered_copy<F>(&self, mut predicate: F) -> Properties
    where
        F: FnMut(&str, &Property) -> bool,
    {
        let props = self
            .props
            .iter()
            .filter(|(key, prop)| predicate(key, prop))
            .map(|(key, prop)| (key.clone(), prop.clone()))
            .collect();
        Properties { props }
    }

    /// Inserts or replaces a single value, keeping the reserved-prefix rule.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<(), PropertyError> {
        let key = key.into();
        if key.starts_with(RESERVED_PREFIX) {
            return Err(PropertyError::ReservedKey(key));
        }
        let value = value.into();
        check_finite(&key, &value)?;
        self.props.insert(key.clone(), Property::new(key, value));
        Ok(())
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::Object(self.to_wire()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Properties::from_wire(&map).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Properties {
        let mut nested = BTreeMap::new();
        nested.insert("enabled".to_string(), PropertyValue::Bool(true));
        nested.insert("limit".to_string(), PropertyValue::Int64(-42));
        Properties::new(vec![
            ("name", PropertyValue::from("test")),
            ("owner", PropertyValue::from("foo")),
            ("repo_id", PropertyValue::Int64(i64::MAX)),
            ("stars", PropertyValue::Uint64(u64::MAX)),
            ("score", PropertyValue::Double(0.25)),
            ("is_private", PropertyValue::Bool(false)),
            ("settings", PropertyValue::Struct(nested)),
            (
                "topics",
                PropertyValue::List(vec!["a".into(), PropertyValue::Int64(1)]),
            ),
        ])
        .expect("valid properties")
    }

    #[test]
    fn rejects_reserved_prefix() {
        let err = Properties::new(vec![("internal.secret", "x")]).unwrap_err();
        assert_eq!(err, PropertyError::ReservedKey("internal.secret".into()));

        let bypass = Properties::new_allowing_reserved(vec![("internal.secret", "x")]);
        assert_eq!(bypass.get_string("internal.secret"), "x");
    }

    #[test]
    fn wire_round_trip_keeps_64_bit_integers_exact() {
        let props = sample();
        let wire = props.to_wire();
        assert_eq!(wire["repo_id"], json!({"type": "int64", "value": "9223372036854775807"}));
        assert_eq!(wire["stars"], json!({"type": "uint64", "value": "18446744073709551615"}));

        let decoded = Properties::from_wire(&wire).expect("decode");
        assert_eq!(decoded, props);
        assert_eq!(decoded.get_uint64("stars"), u64::MAX);
    }

    #[test]
    fn wire_round_trip_survives_text_encoding() {
        let props = sample();
        let text = serde_json::to_string(&props).expect("encode");
        let decoded: Properties = serde_json::from_str(&text).expect("decode");
        assert_eq!(decoded, props);
    }

    #[test]
    fn typed_accessors_report_mismatch() {
        let props = sample();
        let name = props.get("name").expect("name");
        assert_eq!(name.as_string().unwrap(), "test");
        assert!(matches!(
            name.as_int64(),
            Err(PropertyError::TypeMismatch { expected: "int64", .. })
        ));

        let stars = props.get("stars").expect("stars");
        assert!(matches!(stars.as_int64(), Err(PropertyError::OutOfRange { .. })));
    }

    #[test]
    fn zero_values_for_missing_or_mistyped_keys() {
        let props = sample();
        assert_eq!(props.get_string("does-not-exist"), "");
        assert!(!props.get_bool("name"));
        assert_eq!(props.get_int64("name"), 0);
        assert_eq!(props.get_double("missing"), 0.0);
    }

    #[test]
    fn merge_prefers_other_keys() {
        let base = Properties::new(vec![("a", "1"), ("b", "2")]).unwrap();
        let other = Properties::new(vec![("b", "3"), ("c", "4")]).unwrap();
        let merged = base.merge(&other);
        assert_eq!(merged.get_string("a"), "1");
        assert_eq!(merged.get_string("b"), "3");
        assert_eq!(merged.get_string("c"), "4");
    }

    #[test]
    fn filtered_copy_keeps_matching_keys() {
        let props = sample();
        let only_strings = props.filtered_copy(|_, prop| prop.as_string().is_ok());
        let keys: Vec<&str> = only_strings.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["name", "owner"]);
    }

    #[test]
    fn structs_shaped_like_tags_round_trip() {
        for tag in ["int64", "uint64", "double", "struct"] {
            let mut fields = BTreeMap::new();
            fields.insert("type".to_string(), PropertyValue::from(tag));
            fields.insert("value".to_string(), PropertyValue::from("5"));
            let props = Properties::new(vec![("shape", PropertyValue::Struct(fields))]).unwrap();

            let wire = props.to_wire();
            assert_eq!(wire["shape"]["type"], "struct");
            assert_eq!(Properties::from_wire(&wire).unwrap(), props);
        }

        let mut plain = BTreeMap::new();
        plain.insert("type".to_string(), PropertyValue::from("fork"));
        plain.insert("value".to_string(), PropertyValue::Int64(1));
        let props = Properties::new(vec![("kind", PropertyValue::Struct(plain))]).unwrap();
        assert_eq!(props.to_wire()["kind"]["type"], "fork");
        assert_eq!(Properties::from_wire(&props.to_wire()).unwrap(), props);
    }

    #[test]
    fn non_finite_doubles_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                Properties::new(vec![("score", value)]),
                Err(PropertyError::NotFinite { .. })
            ));
            let nested = PropertyValue::List(vec![PropertyValue::Double(value)]);
            assert!(Properties::new(vec![("scores", nested)]).is_err());
            let mut props = Properties::default();
            assert!(props.set("score", value).is_err());
        }
    }

    #[test]
    fn non_finite_doubles_keep_their_value_on_the_wire() {
        let wire = PropertyValue::Double(f64::NEG_INFINITY).to_wire();
        assert_eq!(wire, json!({"type": "double", "value": "-inf"}));
        assert_eq!(
            PropertyValue::from_wire("score", &wire).unwrap(),
            PropertyValue::Double(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn malformed_tags_are_errors() {
        let wire = json!({"id": {"type": "int64", "value": 5}});
        assert!(matches!(
            Properties::from_wire(wire.as_object().unwrap()),
            Err(PropertyError::InvalidWire { .. })
        ));
    }

    #[test]
    fn untagged_numbers_decode_exactly() {
        let wire = json!({"repo_id": 123, "ratio": 1.5});
        let props = Properties::from_wire(wire.as_object().unwrap()).unwrap();
        assert_eq!(props.get_int64("repo_id"), 123);
        assert_eq!(props.get_double("ratio"), 1.5);
    }
}
