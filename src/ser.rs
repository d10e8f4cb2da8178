//! Encoding values into DBus message bodies.
//!
//! Encoding is driven by a [`TypeSignature`]: each top-level value is
//! paired with one complete type of the signature and written in its wire
//! layout. Application values ([`AppValue`]) are first adapted to
//! [`WireValue`]s by [`adapter::encode_hint`], which is also where the
//! concrete type of a variant slot gets inferred.
//!
//! Encoding into a [`MessageBuilder`] is atomic: if any value fails, the
//! builder is rolled back to where it was before the call, so no
//! half-written value and no open container is ever left behind for the
//! next message.
//!
//! [`adapter::encode_hint`]: crate::adapter::encode_hint

use crate::adapter;
use crate::app_value::AppValue;
use crate::error::{Error, Result};
use crate::message::Body;
use crate::signature::TypeSignature;
use crate::value::WireValue;

use log::{trace, warn};

mod internal;
mod message_builder;

pub use message_builder::{Checkpoint, MessageBuilder, MAX_ARRAY_LEN};

/// Adapts and encodes `values` against `signature`, appending to
/// `builder`.
///
/// Fails with [`Error::ArityMismatch`] if the number of values differs
/// from the number of complete types in the signature, and with
/// [`Error::TypeMismatch`] or [`Error::UnsupportedVariantType`] if a value
/// does not fit its type. On failure `builder` is unchanged.
pub fn encode(
    builder: &mut MessageBuilder,
    values: &[AppValue],
    signature: &TypeSignature,
) -> Result<()> {
    check_arity(values.len(), signature)?;
    let wire = values
        .iter()
        .zip(signature)
        .map(|(value, descriptor)| adapter::encode_hint(value, descriptor))
        .collect::<Result<Vec<_>>>()?;
    encode_wire(builder, &wire, signature)
}

/// Encodes already-typed wire values against `signature`.
pub fn encode_wire(
    builder: &mut MessageBuilder,
    values: &[WireValue],
    signature: &TypeSignature,
) -> Result<()> {
    check_arity(values.len(), signature)?;
    let checkpoint = builder.checkpoint();
    let start = builder.len();
    for (value, descriptor) in values.iter().zip(signature) {
        trace!("encode {} at {}", descriptor, builder.len());
        if let Err(e) = internal::write_value(builder, value, descriptor) {
            warn!(
                "encoding {:?} failed, rolling back {} bytes: {}",
                signature.to_string(),
                builder.len() - start,
                e
            );
            builder.rollback(checkpoint);
            return Err(e);
        }
    }
    Ok(())
}

/// Parses `signature` and encodes `values` into a fresh body.
pub fn encode_body(values: &[AppValue], signature: &str) -> Result<Body> {
    let parsed = TypeSignature::parse(signature)?;
    let mut builder = MessageBuilder::new();
    encode(&mut builder, values, &parsed)?;
    Ok(Body {
        data: builder.finish()?,
        signature: signature.to_owned(),
        big_endian: false,
    })
}

/// Like [`encode_body`], for wire values.
pub fn encode_wire_body(values: &[WireValue], signature: &str) -> Result<Body> {
    let parsed = TypeSignature::parse(signature)?;
    let mut builder = MessageBuilder::new();
    encode_wire(&mut builder, values, &parsed)?;
    Ok(Body {
        data: builder.finish()?,
        signature: signature.to_owned(),
        big_endian: false,
    })
}

fn check_arity(found: usize, signature: &TypeSignature) -> Result<()> {
    if found != signature.len() {
        return Err(Error::ArityMismatch {
            expected: signature.len(),
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::app_value::{AppValue, Mapping, Wrapped};
    use crate::error::{Error, Result};
    use crate::ser::{encode, encode_body, encode_wire, MessageBuilder};
    use crate::signature::{TypeDescriptor, TypeSignature};
    use crate::value::{Scalar, WireValue};
    use test_log::test;

    #[test]
    fn serialize_int() -> Result<()> {
        let body = encode_body(&[37.into()], "i")?;
        assert_eq!(body.data, vec![37, 0, 0, 0]);
        assert_eq!(body.signature, "i");
        Ok(())
    }

    #[test]
    fn empty_body() -> Result<()> {
        let body = encode_body(&[], "")?;
        assert!(body.data.is_empty());
        assert_eq!(body.signature, "");
        Ok(())
    }

    #[test]
    fn arity_mismatch() {
        let result = encode_body(&[1.into(), 2.into()], "iii");
        assert!(matches!(
            result,
            Err(Error::ArityMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn invalid_signature() {
        assert!(matches!(
            encode_body(&[1.into()], "a{i"),
            Err(Error::InvalidSignature { .. })
        ));
    }

    #[test]
    fn int_array() -> Result<()> {
        let values = AppValue::Array(vec![1.into(), 2.into(), 3.into(), 4.into()]);
        let body = encode_body(&[values], "ai")?;
        assert_eq!(
            body.data,
            vec![16, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn variant_of_uint32_wrapper() -> Result<()> {
        let body = encode_body(&[AppValue::uint32(7)], "v")?;
        assert_eq!(body.data, vec![1, b'u', 0, 0, 7, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn dict_entries_are_written() -> Result<()> {
        let mut mapping = Mapping::new();
        mapping.insert("k".into(), AppValue::Wrapped(Wrapped::Byte(9)));
        let body = encode_body(&[AppValue::Mapping(mapping)], "a{sy}")?;
        assert_eq!(
            body.data,
            vec![
                10, 0, 0, 0, // array length
                0, 0, 0, 0, // pad to 8
                1, 0, 0, 0, b'k', 0, // key
                9, // value
            ]
        );
        Ok(())
    }

    #[test]
    fn failed_array_leaves_builder_clean() -> Result<()> {
        let mut builder = MessageBuilder::new();
        encode(&mut builder, &["first".into()], &TypeSignature::parse("s")?)?;
        let before = builder.len();

        // Wrong element type at index 1 of a 3-element array.
        let broken = WireValue::Array {
            element: TypeDescriptor::Int32,
            items: vec![
                Scalar::Int32(1).into(),
                WireValue::string("two"),
                Scalar::Int32(3).into(),
            ],
        };
        let result = encode_wire(&mut builder, &[broken], &TypeSignature::parse("ai")?);
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
        assert_eq!(builder.open_containers(), 0);
        assert_eq!(builder.len(), before);

        encode(&mut builder, &[5.into()], &TypeSignature::parse("i")?)?;
        let data = builder.finish()?;
        assert_eq!(
            data,
            vec![5, 0, 0, 0, b'f', b'i', b'r', b's', b't', 0, 0, 0, 5, 0, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn mid_array_app_value_mismatch() -> Result<()> {
        let mut builder = MessageBuilder::new();
        let values = AppValue::Array(vec![1.into(), "two".into(), 3.into()]);
        let result = encode(&mut builder, &[values], &TypeSignature::parse("ai")?);
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
        assert_eq!(builder.open_containers(), 0);
        assert!(builder.is_empty());
        Ok(())
    }

    #[test]
    fn unsupported_variant_aborts() -> Result<()> {
        let mut builder = MessageBuilder::new();
        let values = [1.into(), AppValue::Object("Node2D".to_owned())];
        let result = encode(&mut builder, &values, &TypeSignature::parse("iv")?);
        assert!(matches!(result, Err(Error::UnsupportedVariantType(_))));
        assert!(builder.is_empty());
        Ok(())
    }
}
