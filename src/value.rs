//! The wire value model: what a message body holds once its types are
//! known.

use crate::signature::TypeDescriptor;

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
}

impl Scalar {
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Scalar::Byte(_) => TypeDescriptor::Byte,
            Scalar::Boolean(_) => TypeDescriptor::Boolean,
            Scalar::Int16(_) => TypeDescriptor::Int16,
            Scalar::UInt16(_) => TypeDescriptor::UInt16,
            Scalar::Int32(_) => TypeDescriptor::Int32,
            Scalar::UInt32(_) => TypeDescriptor::UInt32,
            Scalar::Int64(_) => TypeDescriptor::Int64,
            Scalar::UInt64(_) => TypeDescriptor::UInt64,
            Scalar::Double(_) => TypeDescriptor::Double,
            Scalar::String(_) => TypeDescriptor::String,
            Scalar::ObjectPath(_) => TypeDescriptor::ObjectPath,
            Scalar::Signature(_) => TypeDescriptor::Signature,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    Scalar(Scalar),
    Variant(Box<WireValue>),
    Array {
        element: TypeDescriptor,
        items: Vec<WireValue>,
    },
    /// An `a{kv}` array. Entries keep the order they were inserted or
    /// received in.
    Dict {
        key: TypeDescriptor,
        value: TypeDescriptor,
        entries: Vec<(WireValue, WireValue)>,
    },
    Struct(Vec<WireValue>),
    /// Placeholder for a value whose type code the decoder could not
    /// handle.
    Unrecognized(u8),
}

impl WireValue {
    pub fn variant(inner: WireValue) -> Self {
        WireValue::Variant(Box::new(inner))
    }

    pub fn string(s: impl Into<String>) -> Self {
        WireValue::Scalar(Scalar::String(s.into()))
    }

    /// The exact type of this value, derived from the value alone.
    /// `None` if an unrecognized marker is inside.
    pub fn descriptor(&self) -> Option<TypeDescriptor> {
        match self {
            WireValue::Scalar(scalar) => Some(scalar.descriptor()),
            WireValue::Variant(_) => Some(TypeDescriptor::Variant),
            WireValue::Array { element, .. } => Some(TypeDescriptor::array(element.clone())),
            WireValue::Dict { key, value, .. } => {
                Some(TypeDescriptor::dict(key.clone(), value.clone()))
            }
            WireValue::Struct(fields) => fields
                .iter()
                .map(WireValue::descriptor)
                .collect::<Option<Vec<_>>>()
                .map(TypeDescriptor::Struct),
            WireValue::Unrecognized(_) => None,
        }
    }

    /// Short name of the value's shape, for error messages.
    pub fn kind_name(&self) -> String {
        match self.descriptor() {
            Some(descriptor) => descriptor.signature(),
            None => "unrecognized value".to_owned(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Scalar(Scalar::String(s))
            | WireValue::Scalar(Scalar::ObjectPath(s))
            | WireValue::Scalar(Scalar::Signature(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            WireValue::Scalar(Scalar::UInt32(u)) => Some(*u),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Scalar(Scalar::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// Strips any number of variant wrappers.
    pub fn unwrap_variant(&self) -> &WireValue {
        let mut value = self;
        while let WireValue::Variant(inner) = value {
            value = inner;
        }
        value
    }

    /// Dictionary lookup, ignoring entry order.
    pub fn get(&self, key: &WireValue) -> Option<&WireValue> {
        match self {
            WireValue::Dict { entries, .. } => entries
                .iter()
                .find(|(k, _)| k.same_contents(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Structural equality in which dictionaries compare as mappings:
    /// entry order does not matter, everything else must match exactly.
    pub fn same_contents(&self, other: &WireValue) -> bool {
        match (self, other) {
            (WireValue::Variant(a), WireValue::Variant(b)) => a.same_contents(b),
            (
                WireValue::Array { element, items },
                WireValue::Array {
                    element: other_element,
                    items: other_items,
                },
            ) => {
                element == other_element
                    && items.len() == other_items.len()
                    && items
                        .iter()
                        .zip(other_items)
                        .all(|(a, b)| a.same_contents(b))
            }
            (WireValue::Struct(a), WireValue::Struct(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_contents(b))
            }
            (
                WireValue::Dict {
                    key,
                    value,
                    entries,
                },
                WireValue::Dict {
                    key: other_key,
                    value: other_value,
                    entries: other_entries,
                },
            ) => {
                key == other_key
                    && value == other_value
                    && entries.len() == other_entries.len()
                    && entries.iter().all(|(k, v)| {
                        other
                            .get(k)
                            .map(|other_v| v.same_contents(other_v))
                            .unwrap_or(false)
                    })
            }
            (a, b) => a == b,
        }
    }
}

impl From<Scalar> for WireValue {
    fn from(scalar: Scalar) -> Self {
        WireValue::Scalar(scalar)
    }
}

/// Object paths are `/` or `/`-separated non-empty elements of
/// `[A-Za-z0-9_]`, without a trailing slash.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(|element| {
            !element.is_empty()
                && element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{is_valid_object_path, Scalar, WireValue};
    use crate::signature::TypeDescriptor;
    use test_log::test;

    fn dict(entries: &[(&str, i32)]) -> WireValue {
        WireValue::Dict {
            key: TypeDescriptor::String,
            value: TypeDescriptor::Int32,
            entries: entries
                .iter()
                .map(|(k, v)| (WireValue::string(*k), Scalar::Int32(*v).into()))
                .collect(),
        }
    }

    #[test]
    fn dicts_compare_as_mappings() {
        let ab = dict(&[("a", 1), ("b", 2)]);
        let ba = dict(&[("b", 2), ("a", 1)]);
        assert_ne!(ab, ba);
        assert!(ab.same_contents(&ba));
        assert!(!ab.same_contents(&dict(&[("a", 1), ("b", 3)])));
        assert!(!ab.same_contents(&dict(&[("a", 1)])));
        assert_eq!(ab.get(&WireValue::string("b")), Some(&Scalar::Int32(2).into()));
    }

    #[test]
    fn descriptor_of_values() {
        let value = WireValue::Struct(vec![
            Scalar::Byte(1).into(),
            WireValue::variant(WireValue::string("x")),
            dict(&[]),
        ]);
        assert_eq!(value.descriptor().unwrap().signature(), "(yva{si})");
        assert_eq!(
            WireValue::Struct(vec![WireValue::Unrecognized(b'h')]).descriptor(),
            None
        );
    }

    #[test]
    fn object_paths() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/freedesktop/DBus"));
        assert!(is_valid_object_path("/a_1/B2"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("org"));
        assert!(!is_valid_object_path("/org/"));
        assert!(!is_valid_object_path("/org//x"));
        assert!(!is_valid_object_path("/org-x"));
    }
}
