use crate::error::{Error, Result};
use crate::primitives::{ObjectPath, Signature};
use crate::signature::{TypeDescriptor, TypeSignature};
use crate::value::{is_valid_object_path, Scalar, WireValue};

use super::message_builder::{ContainerKind, MessageBuilder};

// Writes one value that must have the shape of `descriptor`. On error the
// builder may be left mid-container; callers roll back to a checkpoint.
pub(super) fn write_value(
    builder: &mut MessageBuilder,
    value: &WireValue,
    descriptor: &TypeDescriptor,
) -> Result<()> {
    match (descriptor, value) {
        (TypeDescriptor::Variant, WireValue::Variant(inner)) => {
            let contents = inner
                .descriptor()
                .ok_or_else(|| Error::mismatch("a typed variant value", inner.kind_name()))?;
            builder.open_variant(&contents.signature());
            write_value(builder, inner, &contents)?;
            builder.close(ContainerKind::Variant)
        }
        (
            TypeDescriptor::Array(element),
            WireValue::Array {
                element: value_element,
                items,
            },
        ) if **element == *value_element => {
            builder.open_array(element);
            for item in items {
                write_value(builder, item, element)?;
            }
            builder.close(ContainerKind::Array)
        }
        (
            TypeDescriptor::Array(element),
            WireValue::Dict {
                key: value_key,
                value: value_value,
                entries,
            },
        ) => {
            let (key, val) = match &**element {
                TypeDescriptor::DictEntry(key, val)
                    if **key == *value_key && **val == *value_value =>
                {
                    (key, val)
                }
                _ => return Err(Error::mismatch(descriptor, value.kind_name())),
            };
            builder.open_array(element);
            for (k, v) in entries {
                builder.open_dict_entry();
                write_value(builder, k, key)?;
                write_value(builder, v, val)?;
                builder.close(ContainerKind::DictEntry)?;
            }
            builder.close(ContainerKind::Array)
        }
        (TypeDescriptor::Struct(fields), WireValue::Struct(values))
            if fields.len() == values.len() =>
        {
            builder.open_struct();
            for (field, value) in fields.iter().zip(values) {
                write_value(builder, value, field)?;
            }
            builder.close(ContainerKind::Struct)
        }
        (descriptor, WireValue::Scalar(scalar)) if scalar.descriptor() == *descriptor => {
            write_scalar(builder, scalar)
        }
        (descriptor, value) => Err(Error::mismatch(descriptor, value.kind_name())),
    }
}

fn write_scalar(builder: &mut MessageBuilder, scalar: &Scalar) -> Result<()> {
    match scalar {
        Scalar::Byte(v) => builder.write_primitive(v),
        Scalar::Boolean(v) => builder.write_primitive(v),
        Scalar::Int16(v) => builder.write_primitive(v),
        Scalar::UInt16(v) => builder.write_primitive(v),
        Scalar::Int32(v) => builder.write_primitive(v),
        Scalar::UInt32(v) => builder.write_primitive(v),
        Scalar::Int64(v) => builder.write_primitive(v),
        Scalar::UInt64(v) => builder.write_primitive(v),
        Scalar::Double(v) => builder.write_primitive(v),
        Scalar::String(s) => {
            check_no_nul(s, "s")?;
            builder.write_primitive(&s.as_str())
        }
        Scalar::ObjectPath(path) => {
            if !is_valid_object_path(path) {
                return Err(Error::mismatch("o", format!("invalid object path {:?}", path)));
            }
            builder.write_primitive(&ObjectPath(path))
        }
        Scalar::Signature(sig) => {
            TypeSignature::parse(sig)?;
            builder.write_primitive(&Signature(sig))
        }
    }
    Ok(())
}

fn check_no_nul(s: &str, expected: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(Error::mismatch(expected, "string with an embedded NUL"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::write_value;
    use crate::error::{Error, Result};
    use crate::ser::MessageBuilder;
    use crate::signature::TypeDescriptor;
    use crate::value::{Scalar, WireValue};
    use test_log::test;

    fn write(value: &WireValue, sig: &str) -> Result<Vec<u8>> {
        let mut builder = MessageBuilder::new();
        write_value(&mut builder, value, &TypeDescriptor::parse(sig)?)?;
        builder.finish()
    }

    #[test]
    fn variant_int() -> Result<()> {
        let value = WireValue::variant(Scalar::Int32(37).into());
        assert_eq!(write(&value, "v")?, vec![1, 105, 0, 0, 37, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn variant_double_array() -> Result<()> {
        let value = WireValue::variant(WireValue::Array {
            element: TypeDescriptor::Double,
            items: (1..=4).map(|i| Scalar::Double(i as f64).into()).collect(),
        });
        assert_eq!(
            write(&value, "v")?,
            vec![
                2, 97, 100, 0, 32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 240, 63, 0, 0, 0, 0, 0, 0, 0, 64, 0,
                0, 0, 0, 0, 0, 8, 64, 0, 0, 0, 0, 0, 0, 16, 64,
            ]
        );
        Ok(())
    }

    #[test]
    fn nested_struct() -> Result<()> {
        let value = WireValue::Struct(vec![
            WireValue::string("Hi"),
            Scalar::Double(0.2).into(),
            WireValue::Struct(vec![WireValue::string("Hello"), Scalar::Double(8.3).into()]),
        ]);
        assert_eq!(
            write(&value, "(sd(sd))")?,
            vec![
                2, 0, 0, 0, 72, 105, 0, 0, 154, 153, 153, 153, 153, 153, 201, 63, 5, 0, 0, 0, 72,
                101, 108, 108, 111, 0, 0, 0, 0, 0, 0, 0, 154, 153, 153, 153, 153, 153, 32, 64,
            ]
        );
        Ok(())
    }

    #[test]
    fn string_variant_dict() -> Result<()> {
        let value = WireValue::Dict {
            key: TypeDescriptor::String,
            value: TypeDescriptor::Variant,
            entries: vec![
                (
                    WireValue::string("a"),
                    WireValue::variant(WireValue::string("Hi")),
                ),
                (
                    WireValue::string("b"),
                    WireValue::variant(Scalar::Double(0.2).into()),
                ),
            ],
        };
        assert_eq!(
            write(&value, "a{sv}")?,
            vec![
                48, 0, 0, 0, // 48 bytes of array
                0, 0, 0, 0, // pad to 8 to start kv pair
                1, 0, 0, 0, 97, 0, // "a"
                1, 115, 0, // signature "s"
                0, 0, 0, // padding(4)
                2, 0, 0, 0, 72, 105, 0, // "Hi"
                0, 0, 0, 0, 0, // pad to 8 to start kv pair
                1, 0, 0, 0, 98, 0, // "b"
                1, 100, 0, // signature "d"
                0, 0, 0, 0, 0, 0, 0, // padding(8)
                154, 153, 153, 153, 153, 153, 201, 63, // 0.2
            ]
        );
        Ok(())
    }

    #[test]
    fn shape_mismatch() {
        let value = WireValue::string("x");
        assert!(matches!(write(&value, "i"), Err(Error::TypeMismatch { .. })));
        let value = WireValue::Struct(vec![WireValue::string("x")]);
        assert!(matches!(write(&value, "(ss)"), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn invalid_scalars() {
        let nul = WireValue::string("a\0b");
        assert!(matches!(write(&nul, "s"), Err(Error::TypeMismatch { .. })));
        let path = WireValue::Scalar(Scalar::ObjectPath("not/a/path".to_owned()));
        assert!(matches!(write(&path, "o"), Err(Error::TypeMismatch { .. })));
        let sig = WireValue::Scalar(Scalar::Signature("a{".to_owned()));
        assert!(matches!(write(&sig, "g"), Err(Error::InvalidSignature { .. })));
    }
}
