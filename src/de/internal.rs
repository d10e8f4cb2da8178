use crate::align::align;
use crate::error::{Error, Result};
use crate::ser::MAX_ARRAY_LEN;
use crate::signature::{single_type_len, SignatureIter, TypeDescriptor};
use crate::value::{Scalar, WireValue};
use byteorder::ByteOrder;
use log::{error, trace, warn};
use std::marker::PhantomData;
use std::str::from_utf8;

/// Containers nest at most this deep, counting variants.
pub const MAX_DEPTH: usize = 64;

/// The bytes being decoded, and how far decoding got.
///
/// Shared by every [`MessageIter`] working on the same body, so that a
/// failure deep inside a container stops all of the enclosing sequences.
pub struct DataBuffer<'de> {
    pub(super) data: &'de [u8],
    pub(super) data_ix: usize,
    failure: Option<Error>,
}

impl<'de> DataBuffer<'de> {
    pub fn new(data: &'de [u8]) -> Self {
        Self {
            data,
            data_ix: 0,
            failure: None,
        }
    }

    pub fn position(&self) -> usize {
        self.data_ix
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.data_ix)
    }

    /// Why decoding stopped early, if it did.
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub(super) fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }
}

/// Walks a body using the type codes of its own signature.
///
/// Containers are read through sub-iterators scoped to their contents,
/// sharing the parent's [`DataBuffer`].
pub struct MessageIter<'a, 'de, B: ByteOrder> {
    data_buffer: &'a mut DataBuffer<'de>,
    sig: SignatureIter<'de>,
    depth: usize,
    phantom: PhantomData<B>,
}

// TODO: This information is repeated in `TypeDescriptor::alignment`,
// which cannot be used here because it rejects `h`.
fn sig_alignment(code: u8) -> Option<usize> {
    match code {
        b'y' | b'g' | b'v' => Some(1),
        b'n' | b'q' => Some(2),
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' | b'h' => Some(4),
        b'x' | b't' | b'd' | b'(' | b'{' => Some(8),
        _ => None,
    }
}

impl<'a, 'de, B: ByteOrder> MessageIter<'a, 'de, B> {
    pub fn new(data_buffer: &'a mut DataBuffer<'de>, signature: &'de str) -> Self {
        Self {
            data_buffer,
            sig: SignatureIter::new(signature),
            depth: 0,
            phantom: PhantomData,
        }
    }

    /// Type code of the next value, `None` at the end of the signature.
    pub fn current_type(&self) -> Option<u8> {
        self.sig.current_type()
    }

    /// Reads the value at the cursor and moves past it.
    ///
    /// A value that cannot be read comes back as
    /// [`WireValue::Unrecognized`]. If the problem makes the rest of the
    /// data unreadable, the failure is recorded in the buffer and every
    /// later call, here or in an enclosing iterator, returns `None`.
    pub fn next_value(&mut self) -> Option<WireValue> {
        if self.data_buffer.failure.is_some() {
            return None;
        }
        let code = self.current_type()?;
        let value = match self.read_current(code) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "decoding stopped at {} on type {:?}: {}",
                    self.data_buffer.data_ix, code as char, e
                );
                self.data_buffer.failure = Some(e);
                WireValue::Unrecognized(code)
            }
        };
        self.sig.advance();
        Some(value)
    }

    /// Reads values until the signature or the data gives out.
    pub fn read_all(&mut self) -> Vec<WireValue> {
        let mut values = Vec::new();
        while let Some(value) = self.next_value() {
            values.push(value);
        }
        values
    }

    fn subsidiary<'b>(&'b mut self, sig: &'de str) -> Result<MessageIter<'b, 'de, B>> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Malformed(format!(
                "containers nested deeper than {}",
                MAX_DEPTH
            )));
        }
        Ok(MessageIter {
            data_buffer: &mut *self.data_buffer,
            sig: SignatureIter::new(sig),
            depth: self.depth + 1,
            phantom: PhantomData,
        })
    }

    fn failed(&self) -> bool {
        self.data_buffer.failure.is_some()
    }

    fn read_current(&mut self, code: u8) -> Result<WireValue> {
        let scalar = match code {
            b'y' => Scalar::Byte(self.read_aligned::<1>(1)?[0]),
            b'b' => {
                let i = B::read_u32(&self.read_aligned::<4>(4)?);
                if i > 1 {
                    return Err(Error::Malformed(format!("invalid boolean value {}", i)));
                }
                Scalar::Boolean(i == 1)
            }
            b'n' => Scalar::Int16(B::read_i16(&self.read_aligned::<2>(2)?)),
            b'q' => Scalar::UInt16(B::read_u16(&self.read_aligned::<2>(2)?)),
            b'i' => Scalar::Int32(B::read_i32(&self.read_aligned::<4>(4)?)),
            b'u' => Scalar::UInt32(B::read_u32(&self.read_aligned::<4>(4)?)),
            b'x' => Scalar::Int64(B::read_i64(&self.read_aligned::<8>(8)?)),
            b't' => Scalar::UInt64(B::read_u64(&self.read_aligned::<8>(8)?)),
            b'd' => Scalar::Double(B::read_f64(&self.read_aligned::<8>(8)?)),
            b's' => Scalar::String(self.read_string()?.to_owned()),
            b'o' => Scalar::ObjectPath(self.read_string()?.to_owned()),
            b'g' => Scalar::Signature(self.read_signature()?.to_owned()),
            b'h' => {
                // File descriptors are out-of-band; only the index is here.
                self.read_aligned::<4>(4)?;
                trace!("skipped unix fd");
                return Ok(WireValue::Unrecognized(code));
            }
            b'v' => return self.read_variant(),
            b'a' => return self.read_array(),
            b'(' => return self.read_struct(),
            b'{' => {
                return Err(Error::Malformed(
                    "dict entry outside of an array".to_owned(),
                ))
            }
            other => return Err(Error::UnrecognizedType(other as char)),
        };
        Ok(scalar.into())
    }

    fn read_variant(&mut self) -> Result<WireValue> {
        let sig = self.read_signature()?;
        if single_type_len(sig.as_bytes()) != Some(sig.len()) {
            return Err(Error::Malformed(format!(
                "variant signature {:?} is not a single complete type",
                sig
            )));
        }
        let mut sub = self.subsidiary(sig)?;
        let inner = sub
            .next_value()
            .ok_or_else(|| Error::Malformed("empty variant".to_owned()))?;
        Ok(WireValue::variant(inner))
    }

    fn read_struct(&mut self) -> Result<WireValue> {
        self.align_reader(8)?;
        let contents = self
            .sig
            .recurse()
            .ok_or_else(|| Error::Malformed("unbalanced struct signature".to_owned()))?;
        let fields = self.subsidiary(contents.as_str())?.read_all();
        Ok(WireValue::Struct(fields))
    }

    fn read_array(&mut self) -> Result<WireValue> {
        let array_sig = self
            .sig
            .current_signature()
            .ok_or_else(|| Error::Malformed("unbalanced array signature".to_owned()))?;
        let item_sig = &array_sig[1..];
        let first = *item_sig
            .as_bytes()
            .first()
            .ok_or_else(|| Error::Malformed("array without an element type".to_owned()))?;
        let alignment = sig_alignment(first).ok_or(Error::UnrecognizedType(first as char))?;

        let len = B::read_u32(&self.read_aligned::<4>(4)?) as usize;
        if len > MAX_ARRAY_LEN {
            return Err(Error::Malformed(format!(
                "array of {} bytes exceeds the {} byte limit",
                len, MAX_ARRAY_LEN
            )));
        }
        self.align_reader(alignment)?;
        let end_ix = self.data_buffer.data_ix + len;
        if end_ix > self.data_buffer.data.len() {
            return Err(Error::Malformed(format!(
                "array of {} bytes runs past the end of the data",
                len
            )));
        }

        let element = match TypeDescriptor::parse(array_sig) {
            Ok(TypeDescriptor::Array(element)) => *element,
            _ => {
                // Elements of a type we cannot describe; the length lets
                // us step over all of them.
                warn!("skipping array of {:?}", item_sig);
                self.data_buffer.data_ix = end_ix;
                return Ok(WireValue::Unrecognized(first));
            }
        };
        trace!(
            "array of {} at {}..{}",
            element,
            self.data_buffer.data_ix,
            end_ix
        );

        let value = match element {
            TypeDescriptor::DictEntry(key, value) => {
                let entry_sig = &item_sig[1..item_sig.len() - 1];
                let mut entries = Vec::new();
                while self.data_buffer.data_ix < end_ix && !self.failed() {
                    self.align_reader(8)?;
                    let mut sub = self.subsidiary(entry_sig)?;
                    match (sub.next_value(), sub.next_value()) {
                        (Some(k), Some(v)) => entries.push((k, v)),
                        _ => break,
                    }
                }
                WireValue::Dict {
                    key: *key,
                    value: *value,
                    entries,
                }
            }
            element => {
                let mut items = Vec::new();
                while self.data_buffer.data_ix < end_ix && !self.failed() {
                    match self.subsidiary(item_sig)?.next_value() {
                        Some(item) => items.push(item),
                        None => break,
                    }
                }
                WireValue::Array { element, items }
            }
        };

        if !self.failed() && self.data_buffer.data_ix != end_ix {
            return Err(Error::Malformed(format!(
                "array elements overran the array: {} > {}",
                self.data_buffer.data_ix, end_ix
            )));
        }
        Ok(value)
    }

    // Index after read must be valid for read to be valid
    fn validate_ix(&mut self) -> Result<()> {
        // Strict inequality
        if self.data_buffer.data_ix > self.data_buffer.data.len() {
            error!("Index out of bounds");
            return Err(Error::Malformed(format!(
                "read past the end of the data at {}",
                self.data_buffer.data_ix
            )));
        }

        Ok(())
    }

    pub(super) fn align_reader(&mut self, alignment: usize) -> Result<()> {
        self.data_buffer.data_ix = align(self.data_buffer.data_ix, alignment);
        self.validate_ix()?;
        Ok(())
    }

    pub(super) fn read(&mut self, len: usize) -> Result<&'de [u8]> {
        let old_ix = self.data_buffer.data_ix;
        let new_ix = old_ix.saturating_add(len);
        self.data_buffer.data_ix = new_ix;
        self.validate_ix()?;
        Ok(&self.data_buffer.data[old_ix..new_ix])
    }

    fn read_aligned<const S: usize>(&mut self, alignment: usize) -> Result<[u8; S]> {
        self.align_reader(alignment)?;
        trace!(
            "Read {} bytes at {}",
            S,
            self.data_buffer.data_ix
        );
        let slice = self.read(S)?;
        let mut array = [0u8; S];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn read_terminated(&mut self, size: usize) -> Result<&'de str> {
        let res = self.read(size + 1)?;
        if res[size] != 0 {
            return Err(Error::Malformed("string is not NUL-terminated".to_owned()));
        }
        from_utf8(&res[..size]).map_err(|e| Error::Malformed(e.to_string()))
    }

    fn read_string(&mut self) -> Result<&'de str> {
        let size = B::read_u32(&self.read_aligned::<4>(4)?) as usize;
        let string = self.read_terminated(size)?;
        trace!("string is {}", string);
        Ok(string)
    }

    fn read_signature(&mut self) -> Result<&'de str> {
        let size = self.read(1)?[0] as usize;
        let sig = self.read_terminated(size)?;
        if !sig.is_ascii() {
            return Err(Error::Malformed(format!(
                "signature {:?} is not ASCII",
                sig
            )));
        }
        Ok(sig)
    }
}
