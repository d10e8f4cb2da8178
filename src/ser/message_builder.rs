use crate::align::pad_to;
use crate::error::{Error, Result};
use crate::primitives::{DbusPrimitive, Signature};
use crate::signature::TypeDescriptor;

use byteorder::{ByteOrder, BE, LE};
use log::trace;

/// Arrays may hold at most 64 MiB of element data.
pub const MAX_ARRAY_LEN: usize = 1 << 26;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    Array,
    Struct,
    DictEntry,
    Variant,
}

// Where an array's length lives, and where its first element starts
// (after the padding that the length does not count).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LengthToken {
    fill_ix: usize,
    begin_ix: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct OpenContainer {
    kind: ContainerKind,
    length: Option<LengthToken>,
}

/// A position in the builder that a failed encode can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    len: usize,
    depth: usize,
}

/// Accumulates a message body.
///
/// Offsets are relative to the start of the builder, which must itself
/// sit at an 8-byte boundary of the final message (true for both the
/// header and the body). Containers are opened and closed explicitly;
/// the builder keeps the stack of open containers so that
/// [`MessageBuilder::rollback`] can undo a partially written value and
/// [`MessageBuilder::finish`] can refuse to hand out unbalanced data.
///
/// Output is little endian unless the builder was made with
/// [`MessageBuilder::big_endian`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    data: Vec<u8>,
    open: Vec<OpenContainer>,
    big_endian: bool,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn big_endian() -> Self {
        MessageBuilder {
            big_endian: true,
            ..Self::default()
        }
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn open_containers(&self) -> usize {
        self.open.len()
    }

    // Note: alignment must be power of 2
    pub(crate) fn align(&mut self, alignment: usize) {
        pad_to(&mut self.data, alignment);
    }

    pub(crate) fn prepare_write(&mut self, size: usize) -> &mut [u8] {
        let old_len = self.data.len();
        let new_len = old_len + size;
        self.data.resize(new_len, 0);
        &mut self.data[old_len..new_len]
    }

    pub(crate) fn write_primitive<T: DbusPrimitive>(&mut self, primitive: &T) {
        self.align(T::alignment());
        trace!(
            "write '{}', {} bytes, at {}",
            T::signature() as char,
            primitive.size(),
            self.data.len()
        );
        let big_endian = self.big_endian;
        let out = self.prepare_write(primitive.size());
        if big_endian {
            primitive.serialize::<BE>(out);
        } else {
            primitive.serialize::<LE>(out);
        }
    }

    pub(crate) fn append_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn open_array(&mut self, element: &TypeDescriptor) {
        self.align(4);
        let fill_ix = self.data.len();
        self.prepare_write(4);
        self.align(element.alignment());
        let begin_ix = self.data.len();
        self.open.push(OpenContainer {
            kind: ContainerKind::Array,
            length: Some(LengthToken { fill_ix, begin_ix }),
        });
    }

    pub(crate) fn open_struct(&mut self) {
        self.align(8);
        self.open.push(OpenContainer {
            kind: ContainerKind::Struct,
            length: None,
        });
    }

    pub(crate) fn open_dict_entry(&mut self) {
        self.align(8);
        self.open.push(OpenContainer {
            kind: ContainerKind::DictEntry,
            length: None,
        });
    }

    /// `contents` is the one complete type the variant will hold.
    pub(crate) fn open_variant(&mut self, contents: &str) {
        self.write_primitive(&Signature(contents));
        self.open.push(OpenContainer {
            kind: ContainerKind::Variant,
            length: None,
        });
    }

    pub(crate) fn close(&mut self, kind: ContainerKind) -> Result<()> {
        match self.open.last() {
            Some(top) if top.kind == kind => {}
            _ => return Err(Error::UnbalancedContainer),
        }
        let container = self.open.pop().ok_or(Error::UnbalancedContainer)?;
        if let Some(LengthToken { fill_ix, begin_ix }) = container.length {
            // Backfill the array length now that the contents are known.
            let length = self.data.len() - begin_ix;
            if length > MAX_ARRAY_LEN {
                return Err(Error::Malformed(format!(
                    "array of {} bytes exceeds the {} byte limit",
                    length, MAX_ARRAY_LEN
                )));
            }
            let out = &mut self.data[fill_ix..fill_ix + 4];
            if self.big_endian {
                BE::write_u32(out, length as u32);
            } else {
                LE::write_u32(out, length as u32);
            }
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.data.len(),
            depth: self.open.len(),
        }
    }

    /// Drops everything written and every container opened since
    /// `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.data.truncate(checkpoint.len);
        self.open.truncate(checkpoint.depth);
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        if !self.open.is_empty() {
            return Err(Error::UnbalancedContainer);
        }
        Ok(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContainerKind, MessageBuilder};
    use crate::error::{Error, Result};
    use crate::signature::TypeDescriptor;
    use test_log::test;

    #[test]
    fn array_length_excludes_element_padding() -> Result<()> {
        let mut builder = MessageBuilder::new();
        builder.open_array(&TypeDescriptor::Double);
        builder.write_primitive(&1.0f64);
        builder.close(ContainerKind::Array)?;
        assert_eq!(
            builder.finish()?,
            vec![8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 240, 63]
        );
        Ok(())
    }

    #[test]
    fn empty_array_still_pads() -> Result<()> {
        let mut builder = MessageBuilder::new();
        builder.open_array(&TypeDescriptor::Struct(vec![TypeDescriptor::Int32]));
        builder.close(ContainerKind::Array)?;
        assert_eq!(builder.finish()?, vec![0, 0, 0, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn mismatched_close_is_rejected() {
        let mut builder = MessageBuilder::new();
        builder.open_struct();
        assert!(matches!(
            builder.close(ContainerKind::Array),
            Err(Error::UnbalancedContainer)
        ));
        assert!(matches!(builder.finish(), Err(Error::UnbalancedContainer)));
    }

    #[test]
    fn rollback_restores_state() -> Result<()> {
        let mut builder = MessageBuilder::new();
        builder.write_primitive(&7u8);
        let checkpoint = builder.checkpoint();
        builder.open_array(&TypeDescriptor::String);
        builder.open_variant("i");
        builder.write_primitive(&1i32);
        assert_eq!(builder.open_containers(), 2);
        builder.rollback(checkpoint);
        assert_eq!(builder.open_containers(), 0);
        assert_eq!(builder.finish()?, vec![7]);
        Ok(())
    }

    #[test]
    fn big_endian_array_length() -> Result<()> {
        let mut builder = MessageBuilder::big_endian();
        builder.open_array(&TypeDescriptor::UInt32);
        builder.write_primitive(&1u32);
        builder.write_primitive(&0x0203u32);
        builder.close(ContainerKind::Array)?;
        assert_eq!(
            builder.finish()?,
            vec![0, 0, 0, 8, 0, 0, 0, 1, 0, 0, 2, 3]
        );
        Ok(())
    }
}
