//! JSON-compatible dynamic value used for request and response payloads.
//!
//! # Design
//! `Bundle` is a plain tagged enum. Lookups never fail: a missing key or
//! index yields the shared `Bundle::empty()` sentinel, so chains like
//! `event.get("from").get("profile").get("displayName")` are always safe.
//! Typed accessors take an explicit default instead of coercing silently to a
//! hidden one. Mutations return `BundleError` when applied to the wrong kind
//! of value, `Null` included.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::BundleError;

static EMPTY: Bundle = Bundle::Null;

/// A JSON-like tree value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Bundle {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Bundle>),
    Object(BTreeMap<String, Bundle>),
}

impl Bundle {
    /// The immutable absent sentinel.
    pub fn empty() -> &'static Bundle {
        &EMPTY
    }

    pub fn object() -> Self {
        Bundle::Object(BTreeMap::new())
    }

    pub fn array() -> Self {
        Bundle::Array(Vec::new())
    }

    pub fn from_json(text: &str) -> Result<Self, BundleError> {
        serde_json::from_str::<Value>(text)
            .map(Bundle::from)
            .map_err(|e| BundleError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        Value::from(self).to_string()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Bundle::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Bundle::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Bundle::Array(_))
    }

    /// Look up `key` in an object. Anything else, or a missing key, yields
    /// the empty sentinel.
    pub fn get(&self, key: &str) -> &Bundle {
        match self {
            Bundle::Object(map) => map.get(key).unwrap_or(&EMPTY),
            _ => &EMPTY,
        }
    }

    /// Look up `index` in an array, with the same absent rule as `get`.
    pub fn at(&self, index: usize) -> &Bundle {
        match self {
            Bundle::Array(items) => items.get(index).unwrap_or(&EMPTY),
            _ => &EMPTY,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        match self {
            Bundle::Object(map) => map.contains_key(key),
            _ => false,
        }
    }

    /// Number of entries of an object or array; zero for leaves.
    pub fn len(&self) -> usize {
        match self {
            Bundle::Object(map) => map.len(),
            Bundle::Array(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let map = match self {
            Bundle::Object(map) => Some(map),
            _ => None,
        };
        map.into_iter().flat_map(|m| m.keys().map(String::as_str))
    }

    pub fn items(&self) -> &[Bundle] {
        match self {
            Bundle::Array(items) => items,
            _ => &[],
        }
    }

    pub fn as_bool(&self, default: bool) -> bool {
        match self {
            Bundle::Bool(b) => *b,
            Bundle::Int(i) => *i != 0,
            Bundle::Double(d) => *d != 0.0,
            Bundle::String(s) => match s.as_str() {
                "true" => true,
                "false" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn as_int(&self, default: i64) -> i64 {
        match self {
            Bundle::Int(i) => *i,
            Bundle::Double(d) => *d as i64,
            Bundle::Bool(b) => i64::from(*b),
            Bundle::String(s) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn as_double(&self, default: f64) -> f64 {
        match self {
            Bundle::Double(d) => *d,
            Bundle::Int(i) => *i as f64,
            Bundle::Bool(b) => f64::from(u8::from(*b)),
            Bundle::String(s) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Borrow a string leaf. Non-string values yield `default`.
    pub fn as_str<'a>(&'a self, default: &'a str) -> &'a str {
        match self {
            Bundle::String(s) => s,
            _ => default,
        }
    }

    /// Render any leaf as text; containers and `Null` yield `default`.
    pub fn as_string(&self, default: &str) -> String {
        match self {
            Bundle::String(s) => s.clone(),
            Bundle::Int(i) => i.to_string(),
            Bundle::Double(d) => d.to_string(),
            Bundle::Bool(b) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Insert into an object, returning the previous value for `key`.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bundle>,
    ) -> Result<Option<Bundle>, BundleError> {
        match self {
            Bundle::Object(map) => Ok(map.insert(key.into(), value.into())),
            _ => Err(BundleError::NotAnObject),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Bundle>, BundleError> {
        match self {
            Bundle::Object(map) => Ok(map.remove(key)),
            _ => Err(BundleError::NotAnObject),
        }
    }

    pub fn push(&mut self, value: impl Into<Bundle>) -> Result<(), BundleError> {
        match self {
            Bundle::Array(items) => {
                items.push(value.into());
                Ok(())
            }
            _ => Err(BundleError::NotAnArray),
        }
    }

    pub fn replace_at(
        &mut self,
        index: usize,
        value: impl Into<Bundle>,
    ) -> Result<Bundle, BundleError> {
        match self {
            Bundle::Array(items) => {
                let len = items.len();
                let slot = items
                    .get_mut(index)
                    .ok_or(BundleError::IndexOutOfRange { index, len })?;
                Ok(std::mem::replace(slot, value.into()))
            }
            _ => Err(BundleError::NotAnArray),
        }
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl From<Value> for Bundle {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Bundle::Null,
            Value::Bool(b) => Bundle::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Bundle::Int(i),
                None => Bundle::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Bundle::String(s),
            Value::Array(items) => Bundle::Array(items.into_iter().map(Bundle::from).collect()),
            Value::Object(map) => {
                Bundle::Object(map.into_iter().map(|(k, v)| (k, Bundle::from(v))).collect())
            }
        }
    }
}

impl From<&Bundle> for Value {
    fn from(bundle: &Bundle) -> Self {
        match bundle {
            Bundle::Null => Value::Null,
            Bundle::Bool(b) => Value::Bool(*b),
            Bundle::Int(i) => Value::Number((*i).into()),
            // NaN and infinities have no JSON form.
            Bundle::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
            Bundle::String(s) => Value::String(s.clone()),
            Bundle::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            Bundle::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Bundle {
    fn from(b: bool) -> Self {
        Bundle::Bool(b)
    }
}

impl From<i64> for Bundle {
    fn from(i: i64) -> Self {
        Bundle::Int(i)
    }
}

impl From<i32> for Bundle {
    fn from(i: i32) -> Self {
        Bundle::Int(i64::from(i))
    }
}

impl From<f64> for Bundle {
    fn from(d: f64) -> Self {
        Bundle::Double(d)
    }
}

impl From<&str> for Bundle {
    fn from(s: &str) -> Self {
        Bundle::String(s.to_string())
    }
}

impl From<String> for Bundle {
    fn from(s: String) -> Self {
        Bundle::String(s)
    }
}

impl From<Vec<Bundle>> for Bundle {
    fn from(items: Vec<Bundle>) -> Self {
        Bundle::Array(items)
    }
}

impl Serialize for Bundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Bundle::from)
    }
}
