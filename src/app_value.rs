//! Application-side dynamic values.
//!
//! [`AppValue`] is what callers hand to the marshaller and what they get
//! back from a reply: a closed set of loosely-typed values, close to what
//! a scripting host or a JSON document would carry. Only [`Wrapped`]
//! values name an exact wire type; everything else takes its wire type
//! from the signature it is encoded against (see [`crate::adapter`]).
//!
//! Any `Serialize` type can be turned into an `AppValue` with
//! [`to_app_value`], and back with [`from_app_value`]. How named structs
//! are shaped is decided by a [`SerializerPolicy`].
//!
//! [`SerializerPolicy`]: serializer_policy::SerializerPolicy

use crate::signature::TypeDescriptor;

use serde::de::{Error as DeError, MapAccess, SeqAccess, Visitor};
use serde::ser::{Error as SerError, SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

mod de;
mod ser;
pub mod serializer_policy;

pub use self::de::from_app_value;
pub use self::ser::{to_app_value, to_app_value_with_policy};

#[derive(Clone, Debug, PartialEq, Default)]
pub enum AppValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<AppValue>),
    Mapping(Mapping),
    Wrapped(Wrapped),
    /// A host object with no wire representation, named by its class.
    Object(String),
}

/// A value that carries its exact wire type with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wrapped {
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    ObjectPath(String),
    Signature(String),
}

impl Wrapped {
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Wrapped::Byte(_) => TypeDescriptor::Byte,
            Wrapped::Int16(_) => TypeDescriptor::Int16,
            Wrapped::UInt16(_) => TypeDescriptor::UInt16,
            Wrapped::UInt32(_) => TypeDescriptor::UInt32,
            Wrapped::Int64(_) => TypeDescriptor::Int64,
            Wrapped::UInt64(_) => TypeDescriptor::UInt64,
            Wrapped::ObjectPath(_) => TypeDescriptor::ObjectPath,
            Wrapped::Signature(_) => TypeDescriptor::Signature,
        }
    }

    /// The integer held, for the integer kinds.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Wrapped::Byte(v) => Some(*v as i128),
            Wrapped::Int16(v) => Some(*v as i128),
            Wrapped::UInt16(v) => Some(*v as i128),
            Wrapped::UInt32(v) => Some(*v as i128),
            Wrapped::Int64(v) => Some(*v as i128),
            Wrapped::UInt64(v) => Some(*v as i128),
            Wrapped::ObjectPath(_) | Wrapped::Signature(_) => None,
        }
    }
}

/// Key/value pairs in insertion order.
///
/// Two mappings are equal when they hold the same pairs, in any order.
#[derive(Clone, Debug, Default)]
pub struct Mapping(Vec<(AppValue, AppValue)>);

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, keeping the key's original position if it
    /// was already present.
    pub fn insert(&mut self, key: AppValue, value: AppValue) -> Option<AppValue> {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &AppValue) -> Option<&AppValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&AppValue> {
        self.0
            .iter()
            .find(|(k, _)| matches!(k, AppValue::Str(s) if s == key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (AppValue, AppValue)> {
        self.0.iter()
    }
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl FromIterator<(AppValue, AppValue)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (AppValue, AppValue)>>(iter: I) -> Self {
        let mut mapping = Mapping::new();
        for (k, v) in iter {
            mapping.insert(k, v);
        }
        mapping
    }
}

impl IntoIterator for Mapping {
    type Item = (AppValue, AppValue);
    type IntoIter = std::vec::IntoIter<(AppValue, AppValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Mapping {
    type Item = &'a (AppValue, AppValue);
    type IntoIter = std::slice::Iter<'a, (AppValue, AppValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl AppValue {
    pub fn uint32(value: u32) -> Self {
        AppValue::Wrapped(Wrapped::UInt32(value))
    }

    pub fn object_path(path: impl Into<String>) -> Self {
        AppValue::Wrapped(Wrapped::ObjectPath(path.into()))
    }

    pub fn signature(signature: impl Into<String>) -> Self {
        AppValue::Wrapped(Wrapped::Signature(signature.into()))
    }

    /// Name of the value's kind, for error messages.
    pub fn kind_name(&self) -> &str {
        match self {
            AppValue::Nil => "nil",
            AppValue::Bool(_) => "bool",
            AppValue::Int(_) => "int",
            AppValue::Float(_) => "float",
            AppValue::Str(_) => "string",
            AppValue::Array(_) => "array",
            AppValue::Mapping(_) => "mapping",
            AppValue::Wrapped(Wrapped::Byte(_)) => "byte wrapper",
            AppValue::Wrapped(Wrapped::Int16(_)) => "int16 wrapper",
            AppValue::Wrapped(Wrapped::UInt16(_)) => "uint16 wrapper",
            AppValue::Wrapped(Wrapped::UInt32(_)) => "uint32 wrapper",
            AppValue::Wrapped(Wrapped::Int64(_)) => "int64 wrapper",
            AppValue::Wrapped(Wrapped::UInt64(_)) => "uint64 wrapper",
            AppValue::Wrapped(Wrapped::ObjectPath(_)) => "object path wrapper",
            AppValue::Wrapped(Wrapped::Signature(_)) => "signature wrapper",
            AppValue::Object(class) => class,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AppValue::Str(s) => Some(s),
            AppValue::Wrapped(Wrapped::ObjectPath(s)) | AppValue::Wrapped(Wrapped::Signature(s)) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AppValue::Int(i) => Some(*i),
            AppValue::Wrapped(wrapped) => wrapped.as_i128().and_then(|i| i.try_into().ok()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AppValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for AppValue {
    fn from(b: bool) -> Self {
        AppValue::Bool(b)
    }
}

impl From<i32> for AppValue {
    fn from(i: i32) -> Self {
        AppValue::Int(i as i64)
    }
}

impl From<i64> for AppValue {
    fn from(i: i64) -> Self {
        AppValue::Int(i)
    }
}

impl From<f64> for AppValue {
    fn from(f: f64) -> Self {
        AppValue::Float(f)
    }
}

impl From<&str> for AppValue {
    fn from(s: &str) -> Self {
        AppValue::Str(s.to_owned())
    }
}

impl From<String> for AppValue {
    fn from(s: String) -> Self {
        AppValue::Str(s)
    }
}

impl From<Vec<AppValue>> for AppValue {
    fn from(items: Vec<AppValue>) -> Self {
        AppValue::Array(items)
    }
}

impl From<Mapping> for AppValue {
    fn from(mapping: Mapping) -> Self {
        AppValue::Mapping(mapping)
    }
}

impl From<Wrapped> for AppValue {
    fn from(wrapped: Wrapped) -> Self {
        AppValue::Wrapped(wrapped)
    }
}

impl Serialize for AppValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AppValue::Nil => serializer.serialize_unit(),
            AppValue::Bool(b) => serializer.serialize_bool(*b),
            AppValue::Int(i) => serializer.serialize_i64(*i),
            AppValue::Float(f) => serializer.serialize_f64(*f),
            AppValue::Str(s) => serializer.serialize_str(s),
            AppValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            AppValue::Mapping(mapping) => {
                let mut map = serializer.serialize_map(Some(mapping.len()))?;
                for (k, v) in mapping {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            AppValue::Wrapped(wrapped) => match wrapped {
                Wrapped::Byte(v) => serializer.serialize_u8(*v),
                Wrapped::Int16(v) => serializer.serialize_i16(*v),
                Wrapped::UInt16(v) => serializer.serialize_u16(*v),
                Wrapped::UInt32(v) => serializer.serialize_u32(*v),
                Wrapped::Int64(v) => serializer.serialize_i64(*v),
                Wrapped::UInt64(v) => serializer.serialize_u64(*v),
                Wrapped::ObjectPath(s) | Wrapped::Signature(s) => serializer.serialize_str(s),
            },
            AppValue::Object(class) => Err(SerError::custom(format!(
                "{} has no serialized form",
                class
            ))),
        }
    }
}

struct AppValueVisitor;

impl<'de> Visitor<'de> for AppValueVisitor {
    type Value = AppValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("any value")
    }

    fn visit_bool<E: DeError>(self, v: bool) -> Result<AppValue, E> {
        Ok(AppValue::Bool(v))
    }

    fn visit_i64<E: DeError>(self, v: i64) -> Result<AppValue, E> {
        Ok(AppValue::Int(v))
    }

    fn visit_u64<E: DeError>(self, v: u64) -> Result<AppValue, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => AppValue::Int(i),
            Err(_) => AppValue::Wrapped(Wrapped::UInt64(v)),
        })
    }

    fn visit_f64<E: DeError>(self, v: f64) -> Result<AppValue, E> {
        Ok(AppValue::Float(v))
    }

    fn visit_str<E: DeError>(self, v: &str) -> Result<AppValue, E> {
        Ok(AppValue::Str(v.to_owned()))
    }

    fn visit_string<E: DeError>(self, v: String) -> Result<AppValue, E> {
        Ok(AppValue::Str(v))
    }

    fn visit_unit<E: DeError>(self) -> Result<AppValue, E> {
        Ok(AppValue::Nil)
    }

    fn visit_none<E: DeError>(self) -> Result<AppValue, E> {
        Ok(AppValue::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<AppValue, D::Error> {
        AppValue::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<AppValue, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(AppValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<AppValue, A::Error> {
        let mut mapping = Mapping::new();
        while let Some((k, v)) = map.next_entry()? {
            mapping.insert(k, v);
        }
        Ok(AppValue::Mapping(mapping))
    }
}

impl<'de> Deserialize<'de> for AppValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<AppValue, D::Error> {
        deserializer.deserialize_any(AppValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::{AppValue, Mapping, Wrapped};
    use test_log::test;

    fn pairs(entries: &[(&str, i64)]) -> Mapping {
        entries
            .iter()
            .map(|(k, v)| (AppValue::from(*k), AppValue::from(*v)))
            .collect()
    }

    #[test]
    fn mapping_equality_ignores_order() {
        let ab = pairs(&[("a", 1), ("b", 2)]);
        let ba = pairs(&[("b", 2), ("a", 1)]);
        assert_eq!(ab, ba);
        assert_eq!(AppValue::Mapping(ab.clone()), AppValue::Mapping(ba));
        assert_ne!(ab, pairs(&[("a", 1)]));
        assert_ne!(ab, pairs(&[("a", 1), ("b", 3)]));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut mapping = pairs(&[("a", 1), ("b", 2)]);
        assert_eq!(
            mapping.insert("a".into(), 3.into()),
            Some(AppValue::Int(1))
        );
        let keys: Vec<_> = mapping.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![AppValue::from("a"), AppValue::from("b")]);
        assert_eq!(mapping.get_str("a"), Some(&AppValue::Int(3)));
    }

    #[test]
    fn json_conversion() -> serde_json::Result<()> {
        let value: AppValue = serde_json::from_str(r#"[1, "two", {"x": 3.5}, null, true]"#)?;
        let mut inner = Mapping::new();
        inner.insert("x".into(), 3.5.into());
        assert_eq!(
            value,
            AppValue::Array(vec![
                1.into(),
                "two".into(),
                AppValue::Mapping(inner),
                AppValue::Nil,
                true.into(),
            ])
        );
        let big: AppValue = serde_json::from_str("18446744073709551615")?;
        assert_eq!(big, AppValue::Wrapped(Wrapped::UInt64(u64::MAX)));
        assert_eq!(
            serde_json::to_string(&AppValue::object_path("/a"))?,
            r#""/a""#
        );
        assert!(serde_json::to_string(&AppValue::Object("Node".to_owned())).is_err());
        Ok(())
    }
}
