use byteorder::ByteOrder;

use std::mem::size_of;

/// A basic value that knows how to lay itself out on the wire in either
/// byte order.
pub(crate) trait DbusPrimitive {
    fn signature() -> u8;
    fn alignment() -> usize;
    fn size(&self) -> usize;
    fn serialize<B: ByteOrder>(&self, out: &mut [u8]);
}

macro_rules! basic_primitive {
    ($type:ident, $sig:expr, $write:ident) => {
        impl DbusPrimitive for $type {
            fn signature() -> u8 {
                $sig as u8
            }

            fn size(&self) -> usize {
                size_of::<$type>()
            }

            fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
                B::$write(out, *self);
            }

            fn alignment() -> usize {
                size_of::<$type>()
            }
        }
    };
}

basic_primitive!(f64, 'd', write_f64);
basic_primitive!(i16, 'n', write_i16);
basic_primitive!(u16, 'q', write_u16);
basic_primitive!(i32, 'i', write_i32);
basic_primitive!(u32, 'u', write_u32);
basic_primitive!(i64, 'x', write_i64);
basic_primitive!(u64, 't', write_u64);

impl DbusPrimitive for u8 {
    fn signature() -> u8 {
        b'y'
    }

    fn size(&self) -> usize {
        1
    }

    fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
        out[0] = *self;
    }

    fn alignment() -> usize {
        1
    }
}

impl DbusPrimitive for bool {
    fn signature() -> u8 {
        b'b'
    }

    fn size(&self) -> usize {
        4
    }

    fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
        B::write_u32(out, *self as u32);
    }

    fn alignment() -> usize {
        4
    }
}

// Strings and object paths share a layout: u32 length, bytes, NUL.
fn write_long_string<B: ByteOrder>(out: &mut [u8], bytes: &[u8]) {
    B::write_u32(&mut out[0..4], bytes.len() as u32);
    out[4..4 + bytes.len()].copy_from_slice(bytes);
    out[4 + bytes.len()] = 0u8;
}

impl DbusPrimitive for &str {
    fn signature() -> u8 {
        b's'
    }

    fn size(&self) -> usize {
        self.len() + 5 // size and terminating null
    }

    fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
        write_long_string::<B>(out, self.as_bytes());
    }

    fn alignment() -> usize {
        4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectPath<'a>(pub &'a str);

impl DbusPrimitive for ObjectPath<'_> {
    fn signature() -> u8 {
        b'o'
    }

    fn size(&self) -> usize {
        self.0.len() + 5
    }

    fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
        write_long_string::<B>(out, self.0.as_bytes());
    }

    fn alignment() -> usize {
        4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Signature<'a>(pub &'a str);

impl DbusPrimitive for Signature<'_> {
    fn signature() -> u8 {
        b'g'
    }

    fn size(&self) -> usize {
        self.0.len() + 2 // u8 size and terminating null
    }

    fn serialize<B: ByteOrder>(&self, out: &mut [u8]) {
        let bytes = self.0.as_bytes();
        out[0] = bytes.len() as u8;
        out[1..1 + bytes.len()].copy_from_slice(bytes);
        out[1 + bytes.len()] = 0u8;
    }

    fn alignment() -> usize {
        1
    }
}
