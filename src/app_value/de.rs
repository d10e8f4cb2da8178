use crate::error::{Error, Result};

use super::{AppValue, Wrapped};

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess,
    Visitor,
};
use serde::forward_to_deserialize_any;

/// Builds a `T` out of an [`AppValue`], typically one returned by
/// [`crate::adapter::decode`].
///
/// Structs can be read from either shape [`to_app_value`] produces: a
/// mapping from field names, or an array of fields in order. Numbers
/// convert freely between kinds as long as they fit.
///
/// [`to_app_value`]: super::to_app_value
pub fn from_app_value<T: DeserializeOwned>(value: AppValue) -> Result<T> {
    T::deserialize(Deserializer(value))
}

struct Deserializer(AppValue);

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            AppValue::Nil => visitor.visit_unit(),
            AppValue::Bool(b) => visitor.visit_bool(b),
            AppValue::Int(i) => visitor.visit_i64(i),
            AppValue::Float(f) => visitor.visit_f64(f),
            AppValue::Str(s) => visitor.visit_string(s),
            AppValue::Array(items) => visitor.visit_seq(SeqDeserializer(items.into_iter())),
            AppValue::Mapping(mapping) => visitor.visit_map(MapDeserializer {
                iter: mapping.into_iter(),
                value: None,
            }),
            AppValue::Wrapped(wrapped) => match wrapped {
                Wrapped::Byte(v) => visitor.visit_u8(v),
                Wrapped::Int16(v) => visitor.visit_i16(v),
                Wrapped::UInt16(v) => visitor.visit_u16(v),
                Wrapped::UInt32(v) => visitor.visit_u32(v),
                Wrapped::Int64(v) => visitor.visit_i64(v),
                Wrapped::UInt64(v) => visitor.visit_u64(v),
                Wrapped::ObjectPath(s) | Wrapped::Signature(s) => visitor.visit_string(s),
            },
            AppValue::Object(class) => Err(Error::Deserializing(format!(
                "{} cannot be deserialized",
                class
            ))),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            AppValue::Nil => visitor.visit_none(),
            other => visitor.visit_some(Deserializer(other)),
        }
    }

    fn deserialize_newtype_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let (variant, value) = match self.0 {
            AppValue::Mapping(mapping) if mapping.len() == 1 => {
                let mut iter = mapping.into_iter();
                match iter.next() {
                    Some((variant, value)) => (variant, Some(value)),
                    None => return Err(Error::Deserializing("empty enum mapping".to_owned())),
                }
            }
            other => (other, None),
        };
        // Unit variants arrive as their index.
        let variant = match variant {
            AppValue::Int(i) if i >= 0 => AppValue::Wrapped(Wrapped::UInt64(i as u64)),
            other => other,
        };
        visitor.visit_enum(EnumDeserializer { variant, value })
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct identifier ignored_any
    }
}

struct SeqDeserializer(std::vec::IntoIter<AppValue>);

impl<'de> SeqAccess<'de> for SeqDeserializer {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        match self.0.next() {
            Some(item) => seed.deserialize(Deserializer(item)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

struct MapDeserializer {
    iter: std::vec::IntoIter<(AppValue, AppValue)>,
    value: Option<AppValue>,
}

impl<'de> MapAccess<'de> for MapDeserializer {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(Deserializer(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        let value = self
            .value
            .take()
            .ok_or_else(|| Error::Deserializing("map value without a key".to_owned()))?;
        seed.deserialize(Deserializer(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumDeserializer {
    variant: AppValue,
    value: Option<AppValue>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer {
    type Error = Error;
    type Variant = VariantDeserializer;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: DeserializeSeed<'de>,
    {
        let variant = seed.deserialize(Deserializer(self.variant))?;
        Ok((variant, VariantDeserializer(self.value)))
    }
}

struct VariantDeserializer(Option<AppValue>);

impl VariantDeserializer {
    fn contents(self) -> Result<AppValue> {
        self.0
            .ok_or_else(|| Error::Deserializing("enum variant without contents".to_owned()))
    }
}

impl<'de> VariantAccess<'de> for VariantDeserializer {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(Deserializer(self.contents()?))
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_any(Deserializer(self.contents()?), visitor)
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_any(Deserializer(self.contents()?), visitor)
    }
}
