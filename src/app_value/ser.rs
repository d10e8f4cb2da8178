use crate::error::{Error, Result};

use super::serializer_policy::{DefaultSerializerPolicy, SerializerPolicy, StructSerializationStyle};
use super::{AppValue, Mapping, Wrapped};

use serde::{ser, Serialize};
use std::str::from_utf8;

/// Converts any `Serialize` value into an [`AppValue`], shaping named
/// structs as [`DefaultSerializerPolicy`] says: as mappings from field
/// name to value, which encode naturally as `a{sv}`.
///
/// Tuples, tuple structs and sequences become arrays. Unit variants
/// become their variant index as a `u32`, and variants carrying data
/// become a single-entry mapping from the variant name to the data.
pub fn to_app_value(value: impl Serialize) -> Result<AppValue> {
    to_app_value_with_policy(value, DefaultSerializerPolicy)
}

/// Like [`to_app_value`], with the struct shape chosen by `config`.
///
/// [`SerializerPolicy`]: super::serializer_policy::SerializerPolicy
pub fn to_app_value_with_policy(
    value: impl Serialize,
    config: impl SerializerPolicy,
) -> Result<AppValue> {
    value.serialize(Serializer { config })
}

struct Serializer<T: SerializerPolicy> {
    config: T,
}

impl<C: SerializerPolicy> Serializer<C> {
    fn nested(&self) -> Serializer<C> {
        Serializer {
            config: self.config.clone(),
        }
    }
}

fn variant_entry(variant: &'static str, value: AppValue) -> AppValue {
    let mut mapping = Mapping::new();
    mapping.insert(variant.into(), value);
    AppValue::Mapping(mapping)
}

impl<C: SerializerPolicy> ser::Serializer for Serializer<C> {
    type Ok = AppValue;
    type Error = Error;

    type SerializeSeq = SerializeSeq<C>;
    type SerializeTuple = SerializeSeq<C>;
    type SerializeTupleStruct = SerializeSeq<C>;
    type SerializeTupleVariant = SerializeTupleVariant<C>;
    type SerializeMap = SerializeMap<C>;
    type SerializeStruct = SerializeStruct<C>;
    type SerializeStructVariant = SerializeStructVariant<C>;

    fn serialize_bool(self, val: bool) -> Result<AppValue> {
        Ok(AppValue::Bool(val))
    }

    fn serialize_i8(self, val: i8) -> Result<AppValue> {
        Ok(AppValue::Int(val as i64))
    }

    fn serialize_i16(self, val: i16) -> Result<AppValue> {
        Ok(AppValue::Int(val as i64))
    }

    fn serialize_i32(self, val: i32) -> Result<AppValue> {
        Ok(AppValue::Int(val as i64))
    }

    fn serialize_i64(self, val: i64) -> Result<AppValue> {
        Ok(AppValue::Int(val))
    }

    fn serialize_u8(self, val: u8) -> Result<AppValue> {
        Ok(AppValue::Wrapped(Wrapped::Byte(val)))
    }

    fn serialize_u16(self, val: u16) -> Result<AppValue> {
        Ok(AppValue::Wrapped(Wrapped::UInt16(val)))
    }

    fn serialize_u32(self, val: u32) -> Result<AppValue> {
        Ok(AppValue::Wrapped(Wrapped::UInt32(val)))
    }

    fn serialize_u64(self, val: u64) -> Result<AppValue> {
        Ok(AppValue::Wrapped(Wrapped::UInt64(val)))
    }

    fn serialize_f32(self, val: f32) -> Result<AppValue> {
        Ok(AppValue::Float(val as f64))
    }

    fn serialize_f64(self, val: f64) -> Result<AppValue> {
        Ok(AppValue::Float(val))
    }

    fn serialize_char(self, val: char) -> Result<AppValue> {
        Ok(AppValue::Wrapped(Wrapped::UInt32(val as u32)))
    }

    fn serialize_str(self, val: &str) -> Result<AppValue> {
        Ok(AppValue::Str(val.to_owned()))
    }

    // TODO: This seems like the wrong thing to do. Byte strings should
    // become `ay` once arrays of wrapped bytes have a compact form.
    fn serialize_bytes(self, val: &[u8]) -> Result<AppValue> {
        let s = from_utf8(val).map_err(|e| Error::Serializing(e.to_string()))?;
        Ok(AppValue::Str(s.to_owned()))
    }

    fn serialize_none(self) -> Result<AppValue> {
        self.serialize_unit()
    }

    fn serialize_some<T>(self, val: &T) -> Result<AppValue>
    where
        T: Serialize + ?Sized,
    {
        val.serialize(self)
    }

    fn serialize_unit(self) -> Result<AppValue> {
        Ok(AppValue::Nil)
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<AppValue> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        variant_index: u32,
        _: &'static str,
    ) -> Result<AppValue> {
        variant_index.serialize(self)
    }

    fn serialize_newtype_struct<T>(self, _: &'static str, value: &T) -> Result<AppValue>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<AppValue>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(self.nested())?;
        Ok(variant_entry(variant, item))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(SerializeSeq {
            items: Vec::with_capacity(len.unwrap_or(0)),
            config: self.config,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            inner: SerializeSeq {
                items: Vec::with_capacity(len),
                config: self.config,
            },
            name: variant,
        })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(SerializeMap {
            mapping: Mapping::new(),
            pending_key: None,
            config: self.config,
        })
    }

    fn serialize_struct(self, name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        let internal = match self.config.query_struct_name(name) {
            StructSerializationStyle::Dict => SerializeStructInternal::Dict(Mapping::new()),
            StructSerializationStyle::StronglyTyped => {
                SerializeStructInternal::Struct(Vec::with_capacity(len))
            }
        };
        Ok(SerializeStruct {
            internal,
            config: self.config,
        })
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Ok(SerializeStructVariant {
            fields: Mapping::new(),
            name: variant,
            config: self.config,
        })
    }
}

struct SerializeSeq<T: SerializerPolicy> {
    items: Vec<AppValue>,
    config: T,
}

impl<C: SerializerPolicy> SerializeSeq<C> {
    fn push<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.items.push(item);
        Ok(())
    }
}

impl<C: SerializerPolicy> ser::SerializeSeq for SerializeSeq<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<AppValue> {
        Ok(AppValue::Array(self.items))
    }
}

impl<C: SerializerPolicy> ser::SerializeTuple for SerializeSeq<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<AppValue> {
        Ok(AppValue::Array(self.items))
    }
}

impl<C: SerializerPolicy> ser::SerializeTupleStruct for SerializeSeq<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.push(value)
    }

    fn end(self) -> Result<AppValue> {
        Ok(AppValue::Array(self.items))
    }
}

struct SerializeTupleVariant<T: SerializerPolicy> {
    inner: SerializeSeq<T>,
    name: &'static str,
}

impl<C: SerializerPolicy> ser::SerializeTupleVariant for SerializeTupleVariant<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.inner.push(value)
    }

    fn end(self) -> Result<AppValue> {
        Ok(variant_entry(self.name, AppValue::Array(self.inner.items)))
    }
}

struct SerializeMap<T: SerializerPolicy> {
    mapping: Mapping,
    pending_key: Option<AppValue>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeMap for SerializeMap<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_key<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| Error::Serializing("map value without a key".to_owned()))?;
        let value = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.mapping.insert(key, value);
        Ok(())
    }

    fn end(self) -> Result<AppValue> {
        Ok(AppValue::Mapping(self.mapping))
    }
}

enum SerializeStructInternal {
    Dict(Mapping),
    Struct(Vec<AppValue>),
}

struct SerializeStruct<T: SerializerPolicy> {
    internal: SerializeStructInternal,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStruct for SerializeStruct<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        match &mut self.internal {
            SerializeStructInternal::Dict(fields) => {
                // Absent optional fields are left out of the dictionary.
                if item != AppValue::Nil {
                    fields.insert(name.into(), item);
                }
            }
            SerializeStructInternal::Struct(fields) => fields.push(item),
        }
        Ok(())
    }

    fn end(self) -> Result<AppValue> {
        Ok(match self.internal {
            SerializeStructInternal::Dict(fields) => AppValue::Mapping(fields),
            SerializeStructInternal::Struct(fields) => AppValue::Array(fields),
        })
    }
}

struct SerializeStructVariant<T: SerializerPolicy> {
    fields: Mapping,
    name: &'static str,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStructVariant for SerializeStructVariant<C> {
    type Ok = AppValue;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        if item != AppValue::Nil {
            self.fields.insert(name.into(), item);
        }
        Ok(())
    }

    fn end(self) -> Result<AppValue> {
        Ok(variant_entry(self.name, AppValue::Mapping(self.fields)))
    }
}

#[cfg(test)]
mod tests {
    use crate::app_value::serializer_policy::{StronglyTypedFor, StronglyTypedSerializerPolicy};
    use crate::app_value::{to_app_value, to_app_value_with_policy, AppValue, Mapping, Wrapped};
    use crate::error::Result;
    use crate::ser::encode_body;
    use serde::Serialize;
    use test_log::test;

    #[derive(Clone, Debug, Serialize)]
    struct StructSerialize {
        pub a: String,
        pub b: f64,
        pub c: Option<u32>,
    }

    fn data() -> StructSerialize {
        StructSerialize {
            a: "Hi".to_owned(),
            b: 0.2,
            c: None,
        }
    }

    #[test]
    fn serialize_int() -> Result<()> {
        assert_eq!(to_app_value(37i32)?, AppValue::Int(37));
        assert_eq!(to_app_value(37u32)?, AppValue::uint32(37));
        Ok(())
    }

    #[test]
    fn serialize_tuple() -> Result<()> {
        let value = to_app_value(("Hi", 0.2f64, ("Hello", 8.3f64)))?;
        assert_eq!(
            value,
            AppValue::Array(vec![
                "Hi".into(),
                0.2.into(),
                AppValue::Array(vec!["Hello".into(), 8.3.into()]),
            ])
        );
        Ok(())
    }

    #[test]
    fn serialize_dict() -> Result<()> {
        let value = to_app_value(data())?;
        let mut expected = Mapping::new();
        expected.insert("a".into(), "Hi".into());
        expected.insert("b".into(), 0.2.into());
        assert_eq!(value, AppValue::Mapping(expected));

        // Same bytes as a hand-built a{sv} with "s" and "d" variants.
        let body = encode_body(&[value], "a{sv}")?;
        assert_eq!(
            body.data,
            vec![
                48, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 97, 0, 1, 115, 0, 0, 0, 0, 2, 0, 0, 0, 72,
                105, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 98, 0, 1, 100, 0, 0, 0, 0, 0, 0, 0, 0, 154,
                153, 153, 153, 153, 153, 201, 63,
            ]
        );
        Ok(())
    }

    #[test]
    fn serialize_strongly_typed() -> Result<()> {
        let value = to_app_value_with_policy(data(), StronglyTypedSerializerPolicy)?;
        assert_eq!(
            value,
            AppValue::Array(vec!["Hi".into(), 0.2.into(), AppValue::Nil])
        );
        Ok(())
    }

    #[test]
    fn policy_by_name() -> Result<()> {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }
        #[derive(Serialize)]
        struct Outer {
            point: Point,
        }
        let value = to_app_value_with_policy(
            Outer {
                point: Point { x: 1, y: 2 },
            },
            StronglyTypedFor(vec!["Point"]),
        )?;
        let mut expected = Mapping::new();
        expected.insert("point".into(), AppValue::Array(vec![1.into(), 2.into()]));
        assert_eq!(value, AppValue::Mapping(expected));
        Ok(())
    }

    #[test]
    fn serialize_enums() -> Result<()> {
        #[derive(Serialize)]
        enum Shape {
            Empty,
            Circle(f64),
        }
        assert_eq!(to_app_value(Shape::Empty)?, AppValue::uint32(0));
        let mut expected = Mapping::new();
        expected.insert("Circle".into(), 1.5.into());
        assert_eq!(to_app_value(Shape::Circle(1.5))?, AppValue::Mapping(expected));
        assert_eq!(
            to_app_value(7u8)?,
            AppValue::Wrapped(Wrapped::Byte(7))
        );
        Ok(())
    }
}
