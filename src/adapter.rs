//! Conversion between application values and wire values.
//!
//! Encoding goes through [`encode_hint`], which uses the descriptor from
//! the signature to decide the exact wire type of each [`AppValue`]. The
//! one place a signature does not say the type is a variant slot; there
//! [`infer_variant_type`] picks it from the value alone, from a fixed
//! table.
//!
//! Decoding through [`decode`] always succeeds, but loses the exact wire
//! types: integers come back as [`AppValue::Int`] and variants are
//! unwrapped.

use crate::app_value::{AppValue, Mapping, Wrapped};
use crate::error::{Error, Result};
use crate::signature::{TypeDescriptor, TypeSignature};
use crate::value::{is_valid_object_path, Scalar, WireValue};

use log::trace;

/// Wire type for a value placed in a variant slot.
///
/// | value | wire type |
/// |---|---|
/// | `Bool` | `b` |
/// | `Int` | `i` |
/// | `Float` | `d` |
/// | `Str` | `s` |
/// | `Wrapped` | the wrapper's own type |
///
/// Anything else fails with [`Error::UnsupportedVariantType`]; there is
/// no fallback guess.
pub fn infer_variant_type(value: &AppValue) -> Result<TypeDescriptor> {
    match value {
        AppValue::Bool(_) => Ok(TypeDescriptor::Boolean),
        AppValue::Int(_) => Ok(TypeDescriptor::Int32),
        AppValue::Float(_) => Ok(TypeDescriptor::Double),
        AppValue::Str(_) => Ok(TypeDescriptor::String),
        AppValue::Wrapped(wrapped) => Ok(wrapped.descriptor()),
        other => Err(Error::UnsupportedVariantType(other.kind_name().to_owned())),
    }
}

/// Shapes `value` as a wire value of type `descriptor`.
pub fn encode_hint(value: &AppValue, descriptor: &TypeDescriptor) -> Result<WireValue> {
    let mismatch = || Error::mismatch(descriptor, value.kind_name());
    let wire = match descriptor {
        TypeDescriptor::Byte
        | TypeDescriptor::Int16
        | TypeDescriptor::UInt16
        | TypeDescriptor::Int32
        | TypeDescriptor::UInt32
        | TypeDescriptor::Int64
        | TypeDescriptor::UInt64 => {
            let i = match value {
                AppValue::Int(i) => *i as i128,
                AppValue::Wrapped(wrapped) => wrapped.as_i128().ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };
            integer(i, descriptor).ok_or_else(|| {
                Error::mismatch(descriptor, format!("{} out of range", i))
            })?
        }
        TypeDescriptor::Boolean => match value {
            AppValue::Bool(b) => Scalar::Boolean(*b).into(),
            _ => return Err(mismatch()),
        },
        TypeDescriptor::Double => match value {
            AppValue::Float(f) => Scalar::Double(*f).into(),
            AppValue::Int(i) => Scalar::Double(*i as f64).into(),
            _ => return Err(mismatch()),
        },
        TypeDescriptor::String => match value {
            AppValue::Str(s) if !s.contains('\0') => WireValue::string(s.clone()),
            _ => return Err(mismatch()),
        },
        TypeDescriptor::ObjectPath => match value {
            AppValue::Str(path) | AppValue::Wrapped(Wrapped::ObjectPath(path))
                if is_valid_object_path(path) =>
            {
                Scalar::ObjectPath(path.clone()).into()
            }
            _ => return Err(mismatch()),
        },
        TypeDescriptor::Signature => match value {
            AppValue::Str(sig) | AppValue::Wrapped(Wrapped::Signature(sig)) => {
                TypeSignature::parse(sig)?;
                Scalar::Signature(sig.clone()).into()
            }
            _ => return Err(mismatch()),
        },
        TypeDescriptor::Variant => {
            let contents = infer_variant_type(value)?;
            trace!("variant of {} holds {}", value.kind_name(), contents);
            WireValue::variant(encode_hint(value, &contents)?)
        }
        TypeDescriptor::Array(element) => match (&**element, value) {
            (TypeDescriptor::DictEntry(key, val), AppValue::Mapping(mapping)) => {
                WireValue::Dict {
                    key: (**key).clone(),
                    value: (**val).clone(),
                    entries: mapping
                        .iter()
                        .map(|(k, v)| -> Result<(WireValue, WireValue)> {
                            Ok((encode_hint(k, key)?, encode_hint(v, val)?))
                        })
                        .collect::<Result<_>>()?,
                }
            }
            (TypeDescriptor::DictEntry(..), _) => return Err(mismatch()),
            (element, AppValue::Array(items)) => WireValue::Array {
                element: element.clone(),
                items: items
                    .iter()
                    .map(|item| encode_hint(item, element))
                    .collect::<Result<_>>()?,
            },
            _ => return Err(mismatch()),
        },
        TypeDescriptor::Struct(fields) => match value {
            AppValue::Array(items) if items.len() == fields.len() => WireValue::Struct(
                items
                    .iter()
                    .zip(fields)
                    .map(|(item, field)| encode_hint(item, field))
                    .collect::<Result<_>>()?,
            ),
            AppValue::Array(items) => {
                return Err(Error::mismatch(
                    descriptor,
                    format!("array of {} values", items.len()),
                ))
            }
            _ => return Err(mismatch()),
        },
        TypeDescriptor::DictEntry(..) => return Err(mismatch()),
    };
    Ok(wire)
}

fn integer(i: i128, descriptor: &TypeDescriptor) -> Option<WireValue> {
    let scalar = match descriptor {
        TypeDescriptor::Byte => Scalar::Byte(i.try_into().ok()?),
        TypeDescriptor::Int16 => Scalar::Int16(i.try_into().ok()?),
        TypeDescriptor::UInt16 => Scalar::UInt16(i.try_into().ok()?),
        TypeDescriptor::Int32 => Scalar::Int32(i.try_into().ok()?),
        TypeDescriptor::UInt32 => Scalar::UInt32(i.try_into().ok()?),
        TypeDescriptor::Int64 => Scalar::Int64(i.try_into().ok()?),
        TypeDescriptor::UInt64 => Scalar::UInt64(i.try_into().ok()?),
        _ => return None,
    };
    Some(scalar.into())
}

/// Turns a decoded wire value into an application value.
pub fn decode(value: &WireValue) -> AppValue {
    match value {
        WireValue::Scalar(scalar) => match scalar {
            Scalar::Byte(v) => AppValue::Int(*v as i64),
            Scalar::Boolean(b) => AppValue::Bool(*b),
            Scalar::Int16(v) => AppValue::Int(*v as i64),
            Scalar::UInt16(v) => AppValue::Int(*v as i64),
            Scalar::Int32(v) => AppValue::Int(*v as i64),
            Scalar::UInt32(v) => AppValue::Int(*v as i64),
            Scalar::Int64(v) => AppValue::Int(*v),
            Scalar::UInt64(v) => match i64::try_from(*v) {
                Ok(i) => AppValue::Int(i),
                Err(_) => AppValue::Wrapped(Wrapped::UInt64(*v)),
            },
            Scalar::Double(f) => AppValue::Float(*f),
            Scalar::String(s) => AppValue::Str(s.clone()),
            Scalar::ObjectPath(p) => AppValue::Wrapped(Wrapped::ObjectPath(p.clone())),
            Scalar::Signature(s) => AppValue::Wrapped(Wrapped::Signature(s.clone())),
        },
        WireValue::Variant(inner) => decode(inner),
        WireValue::Array { items, .. } => AppValue::Array(items.iter().map(decode).collect()),
        WireValue::Dict { entries, .. } => AppValue::Mapping(
            entries
                .iter()
                .map(|(k, v)| (decode(k), decode(v)))
                .collect::<Mapping>(),
        ),
        WireValue::Struct(fields) => AppValue::Array(fields.iter().map(decode).collect()),
        WireValue::Unrecognized(_) => AppValue::Nil,
    }
}

pub fn decode_all(values: &[WireValue]) -> Vec<AppValue> {
    values.iter().map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::{decode, encode_hint, infer_variant_type};
    use crate::app_value::{AppValue, Mapping, Wrapped};
    use crate::error::{Error, Result};
    use crate::ser::encode_body;
    use crate::signature::TypeDescriptor;
    use crate::value::{Scalar, WireValue};
    use test_log::test;

    fn hint(value: AppValue, sig: &str) -> Result<WireValue> {
        encode_hint(&value, &TypeDescriptor::parse(sig)?)
    }

    fn is_mismatch(result: Result<WireValue>) -> bool {
        matches!(result, Err(Error::TypeMismatch { .. }))
    }

    #[test]
    fn variant_inference_table() -> Result<()> {
        assert_eq!(infer_variant_type(&true.into())?, TypeDescriptor::Boolean);
        assert_eq!(infer_variant_type(&5.into())?, TypeDescriptor::Int32);
        assert_eq!(infer_variant_type(&0.5.into())?, TypeDescriptor::Double);
        assert_eq!(infer_variant_type(&"x".into())?, TypeDescriptor::String);
        assert_eq!(
            infer_variant_type(&AppValue::uint32(1))?,
            TypeDescriptor::UInt32
        );
        for unsupported in [
            AppValue::Nil,
            AppValue::Array(vec![]),
            AppValue::Mapping(Mapping::new()),
            AppValue::Object("Node2D".to_owned()),
        ] {
            assert!(matches!(
                infer_variant_type(&unsupported),
                Err(Error::UnsupportedVariantType(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn variant_tags_on_the_wire() -> Result<()> {
        let body = encode_body(&[true.into(), 5.into()], "vv")?;
        assert_eq!(
            body.data,
            vec![1, b'b', 0, 0, 1, 0, 0, 0, 1, b'i', 0, 0, 5, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn variant_int_out_of_range() {
        assert!(is_mismatch(hint(AppValue::Int(1 << 40), "v")));
    }

    #[test]
    fn integer_ranges() -> Result<()> {
        assert_eq!(hint(255.into(), "y")?, Scalar::Byte(255).into());
        assert!(is_mismatch(hint(256.into(), "y")));
        assert!(is_mismatch(hint((-1).into(), "u")));
        assert!(is_mismatch(hint(AppValue::Int(i64::MAX), "i")));
        assert_eq!(
            hint(AppValue::Wrapped(Wrapped::UInt32(7)), "x")?,
            Scalar::Int64(7).into()
        );
        assert!(is_mismatch(hint(AppValue::Wrapped(Wrapped::UInt64(u64::MAX)), "x")));
        assert!(is_mismatch(hint(1.5.into(), "i")));
        assert_eq!(hint(2.into(), "d")?, Scalar::Double(2.0).into());
        Ok(())
    }

    #[test]
    fn string_like_slots() -> Result<()> {
        assert_eq!(
            hint("/org/x".into(), "o")?,
            Scalar::ObjectPath("/org/x".to_owned()).into()
        );
        assert!(is_mismatch(hint("org/x".into(), "o")));
        assert!(is_mismatch(hint("a\0b".into(), "s")));
        assert!(is_mismatch(hint(AppValue::object_path("/a"), "s")));
        assert!(matches!(
            hint("a{".into(), "g"),
            Err(Error::InvalidSignature { .. })
        ));
        Ok(())
    }

    #[test]
    fn containers() -> Result<()> {
        let value = AppValue::Array(vec![1.into(), "x".into()]);
        assert_eq!(
            hint(value.clone(), "(is)")?,
            WireValue::Struct(vec![Scalar::Int32(1).into(), WireValue::string("x")])
        );
        assert!(is_mismatch(hint(value.clone(), "(isi)")));
        assert!(is_mismatch(hint(value, "a{si}")));
        assert!(is_mismatch(hint(AppValue::Mapping(Mapping::new()), "ai")));
        Ok(())
    }

    #[test]
    fn decode_loses_exact_types() {
        let wire = WireValue::Struct(vec![
            Scalar::Byte(3).into(),
            Scalar::UInt64(u64::MAX).into(),
            WireValue::variant(WireValue::string("x")),
            Scalar::ObjectPath("/".to_owned()).into(),
            WireValue::Unrecognized(b'h'),
        ]);
        assert_eq!(
            decode(&wire),
            AppValue::Array(vec![
                3.into(),
                AppValue::Wrapped(Wrapped::UInt64(u64::MAX)),
                "x".into(),
                AppValue::object_path("/"),
                AppValue::Nil,
            ])
        );
    }
}
