//! Decoding DBus message bodies.
//!
//! Decoding needs nothing but the body and its signature: the decoder
//! asks the signature for the type code of each value and reads
//! accordingly, recursing into containers with iterators scoped to their
//! contents. See [`MessageIter`].
//!
//! Decoding is best-effort and never fails as a whole. Values the
//! decoder has no model for, such as Unix file descriptors, are stepped
//! over and reported as [`WireValue::Unrecognized`]. Data that cannot be
//! read at all ends decoding with a marker in place of the broken value,
//! keeping everything decoded before it.

use crate::error::Result;
use crate::message::Body;
use crate::value::WireValue;
use byteorder::{ByteOrder, BE, LE};
use log::warn;

mod internal;
pub use internal::{DataBuffer, MessageIter, MAX_DEPTH};

/// Decodes a body in its own byte order.
pub fn decode(body: &Body) -> Vec<WireValue> {
    if body.big_endian {
        decode_with_order::<BE>(&body.data, &body.signature)
    } else {
        decode_with_order::<LE>(&body.data, &body.signature)
    }
}

/// Decodes `data` as values of `signature` in byte order `B`.
pub fn decode_with_order<B: ByteOrder>(data: &[u8], signature: &str) -> Vec<WireValue> {
    let mut buffer = DataBuffer::new(data);
    let values = MessageIter::<B>::new(&mut buffer, signature).read_all();
    if buffer.failure().is_none() && buffer.remaining() != 0 {
        warn!(
            "{} bytes left over after decoding {:?}",
            buffer.remaining(),
            signature
        );
    }
    values
}

/// Strict decoding of a prefix of `data`, for message headers: fails
/// where [`decode_with_order`] would stop early, and also returns how
/// many bytes were consumed.
pub(crate) fn decode_prefix<B: ByteOrder>(
    data: &[u8],
    signature: &str,
) -> Result<(Vec<WireValue>, usize)> {
    let mut buffer = DataBuffer::new(data);
    let values = MessageIter::<B>::new(&mut buffer, signature).read_all();
    match buffer.take_failure() {
        Some(e) => Err(e),
        None => Ok((values, buffer.position())),
    }
}
