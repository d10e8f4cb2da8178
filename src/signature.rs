//! DBus type signatures.
//!
//! A signature string such as `"sa{sv}(ii)"` is parsed into a
//! [`TypeSignature`], a list of [`TypeDescriptor`] trees, one per
//! complete type. The parser validates the string the same way the bus
//! does, including the nesting limits.
//!
//! For walking a signature lazily, for instance while decoding a body
//! received from the bus, [`SignatureIter`] offers a cursor that can peek
//! at the current type code, advance, and recurse into containers.

use crate::error::{Error, Result};

use std::fmt::{self, Display, Write};
use std::str::FromStr;

pub const MAX_SIGNATURE_LEN: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<TypeDescriptor>),
    DictEntry(Box<TypeDescriptor>, Box<TypeDescriptor>),
    Struct(Vec<TypeDescriptor>),
}

impl TypeDescriptor {
    /// Builds `a{kv}`.
    pub fn dict(key: TypeDescriptor, value: TypeDescriptor) -> Self {
        TypeDescriptor::Array(Box::new(TypeDescriptor::DictEntry(
            Box::new(key),
            Box::new(value),
        )))
    }

    pub fn array(element: TypeDescriptor) -> Self {
        TypeDescriptor::Array(Box::new(element))
    }

    /// Parses exactly one complete type.
    pub fn parse(signature: &str) -> Result<Self> {
        let mut parsed = TypeSignature::parse(signature)?;
        if parsed.len() != 1 {
            return Err(Error::invalid_signature(
                signature,
                format!("expected a single complete type, found {}", parsed.len()),
            ));
        }
        Ok(parsed.0.remove(0))
    }

    /// Wire alignment of a value of this type.
    pub fn alignment(&self) -> usize {
        match self {
            TypeDescriptor::Byte | TypeDescriptor::Signature | TypeDescriptor::Variant => 1,
            TypeDescriptor::Int16 | TypeDescriptor::UInt16 => 2,
            TypeDescriptor::Boolean
            | TypeDescriptor::Int32
            | TypeDescriptor::UInt32
            | TypeDescriptor::String
            | TypeDescriptor::ObjectPath
            | TypeDescriptor::Array(_) => 4,
            TypeDescriptor::Int64
            | TypeDescriptor::UInt64
            | TypeDescriptor::Double
            | TypeDescriptor::DictEntry(..)
            | TypeDescriptor::Struct(_) => 8,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeDescriptor::Variant
                | TypeDescriptor::Array(_)
                | TypeDescriptor::DictEntry(..)
                | TypeDescriptor::Struct(_)
        )
    }

    /// True for `a{..}`.
    pub fn is_dict(&self) -> bool {
        matches!(self, TypeDescriptor::Array(element) if matches!(**element, TypeDescriptor::DictEntry(..)))
    }

    pub fn signature(&self) -> String {
        self.to_string()
    }

    fn write_signature(&self, out: &mut impl Write) -> fmt::Result {
        match self {
            TypeDescriptor::Array(element) => {
                out.write_char('a')?;
                element.write_signature(out)
            }
            TypeDescriptor::DictEntry(key, value) => {
                out.write_char('{')?;
                key.write_signature(out)?;
                value.write_signature(out)?;
                out.write_char('}')
            }
            TypeDescriptor::Struct(fields) => {
                out.write_char('(')?;
                for field in fields {
                    field.write_signature(out)?;
                }
                out.write_char(')')
            }
            basic => out.write_char(basic_code(basic) as char),
        }
    }
}

fn basic_code(descriptor: &TypeDescriptor) -> u8 {
    match descriptor {
        TypeDescriptor::Byte => b'y',
        TypeDescriptor::Boolean => b'b',
        TypeDescriptor::Int16 => b'n',
        TypeDescriptor::UInt16 => b'q',
        TypeDescriptor::Int32 => b'i',
        TypeDescriptor::UInt32 => b'u',
        TypeDescriptor::Int64 => b'x',
        TypeDescriptor::UInt64 => b't',
        TypeDescriptor::Double => b'd',
        TypeDescriptor::String => b's',
        TypeDescriptor::ObjectPath => b'o',
        TypeDescriptor::Signature => b'g',
        TypeDescriptor::Variant => b'v',
        TypeDescriptor::Array(_) => b'a',
        TypeDescriptor::DictEntry(..) => b'e',
        TypeDescriptor::Struct(_) => b'r',
    }
}

fn basic_from_code(code: u8) -> Option<TypeDescriptor> {
    Some(match code {
        b'y' => TypeDescriptor::Byte,
        b'b' => TypeDescriptor::Boolean,
        b'n' => TypeDescriptor::Int16,
        b'q' => TypeDescriptor::UInt16,
        b'i' => TypeDescriptor::Int32,
        b'u' => TypeDescriptor::UInt32,
        b'x' => TypeDescriptor::Int64,
        b't' => TypeDescriptor::UInt64,
        b'd' => TypeDescriptor::Double,
        b's' => TypeDescriptor::String,
        b'o' => TypeDescriptor::ObjectPath,
        b'g' => TypeDescriptor::Signature,
        b'v' => TypeDescriptor::Variant,
        _ => return None,
    })
}

impl Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_signature(f)
    }
}

/// A parsed signature: one descriptor per complete type, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeSignature(Vec<TypeDescriptor>);

impl TypeSignature {
    pub fn parse(signature: &str) -> Result<Self> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(Error::invalid_signature(
                signature,
                format!("longer than {} bytes", MAX_SIGNATURE_LEN),
            ));
        }
        let mut parser = Parser {
            source: signature,
            sig: signature.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        };
        let mut descriptors = Vec::new();
        while parser.pos < parser.sig.len() {
            descriptors.push(parser.parse_single()?);
        }
        Ok(TypeSignature(descriptors))
    }

    pub fn descriptors(&self) -> &[TypeDescriptor] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TypeDescriptor> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<TypeDescriptor>> for TypeSignature {
    fn from(descriptors: Vec<TypeDescriptor>) -> Self {
        TypeSignature(descriptors)
    }
}

impl FromStr for TypeSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TypeSignature::parse(s)
    }
}

impl Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for descriptor in &self.0 {
            descriptor.write_signature(f)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a TypeSignature {
    type Item = &'a TypeDescriptor;
    type IntoIter = std::slice::Iter<'a, TypeDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

struct Parser<'a> {
    source: &'a str,
    sig: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::invalid_signature(self.source, reason)
    }

    fn peek(&self) -> Option<u8> {
        self.sig.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let code = self.peek()?;
        self.pos += 1;
        Some(code)
    }

    fn parse_single(&mut self) -> Result<TypeDescriptor> {
        let at = self.pos;
        let code = self
            .bump()
            .ok_or_else(|| self.error("unexpected end of signature"))?;
        if let Some(basic) = basic_from_code(code) {
            return Ok(basic);
        }
        match code {
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_ARRAY_DEPTH {
                    return Err(self.error("too many nested arrays"));
                }
                let element = if self.peek() == Some(b'{') {
                    self.parse_dict_entry()?
                } else {
                    self.parse_single()?
                };
                self.array_depth -= 1;
                Ok(TypeDescriptor::Array(Box::new(element)))
            }
            b'(' => {
                self.enter_struct()?;
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_single()?),
                        None => return Err(self.error("unterminated struct")),
                    }
                }
                if fields.is_empty() {
                    return Err(self.error("empty struct"));
                }
                self.struct_depth -= 1;
                Ok(TypeDescriptor::Struct(fields))
            }
            b'{' => Err(self.error(format!("dict entry outside of an array at {}", at))),
            b')' | b'}' => Err(self.error(format!(
                "unbalanced {:?} at {}",
                code as char, at
            ))),
            other => Err(self.error(format!(
                "unknown type code {:?} at {}",
                other as char, at
            ))),
        }
    }

    // Called with the cursor on '{', directly after an 'a'.
    fn parse_dict_entry(&mut self) -> Result<TypeDescriptor> {
        self.pos += 1;
        self.enter_struct()?;
        let key = match self.peek() {
            Some(b'}') | None => return Err(self.error("dict entry without a key")),
            Some(_) => self.parse_single()?,
        };
        if !key.is_basic() {
            return Err(self.error(format!("dict key {} is not a basic type", key)));
        }
        let value = match self.peek() {
            Some(b'}') | None => return Err(self.error("dict entry without a value")),
            Some(_) => self.parse_single()?,
        };
        match self.bump() {
            Some(b'}') => {}
            Some(_) => return Err(self.error("dict entry must contain exactly two types")),
            None => return Err(self.error("unterminated dict entry")),
        }
        self.struct_depth -= 1;
        Ok(TypeDescriptor::DictEntry(Box::new(key), Box::new(value)))
    }

    fn enter_struct(&mut self) -> Result<()> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH {
            return Err(self.error("too many nested structs"));
        }
        Ok(())
    }
}

/// Length of the complete type at the start of `sig`, or `None` if the
/// brackets never balance.
pub(crate) fn single_type_len(sig: &[u8]) -> Option<usize> {
    let mut nesting = 0i32;
    for (i, code) in sig.iter().enumerate() {
        match code {
            b'(' | b'{' => nesting += 1,
            b')' | b'}' => nesting -= 1,
            b'a' => continue,
            _ => (),
        }
        if nesting <= 0 {
            return Some(i + 1);
        }
    }
    None
}

/// A lenient cursor over a signature string.
///
/// Unlike [`TypeSignature::parse`] this does not reject unknown type
/// codes; it only needs brackets to balance. That makes it suitable for
/// walking signatures received from the bus, which may contain types this
/// crate has no descriptor for.
#[derive(Clone, Debug)]
pub struct SignatureIter<'a> {
    sig: &'a str,
    pos: usize,
}

impl<'a> SignatureIter<'a> {
    pub fn new(sig: &'a str) -> Self {
        SignatureIter { sig, pos: 0 }
    }

    /// Type code at the cursor, `None` once exhausted.
    pub fn current_type(&self) -> Option<u8> {
        self.sig.as_bytes().get(self.pos).copied()
    }

    /// The complete type at the cursor, e.g. `"a{sv}"` for `"a{sv}i"`.
    /// `None` if the type never closes or ends inside a non-ASCII
    /// character.
    pub fn current_signature(&self) -> Option<&'a str> {
        let rest = self.sig.get(self.pos..)?;
        let len = single_type_len(rest.as_bytes())?;
        rest.get(..len)
    }

    /// Moves past the complete type at the cursor. Returns whether
    /// another type follows.
    pub fn advance(&mut self) -> bool {
        match self.current_signature() {
            Some(current) => {
                self.pos += current.len();
                self.pos < self.sig.len()
            }
            None => {
                self.pos = self.sig.len();
                false
            }
        }
    }

    /// For arrays, the element signature as its own string.
    pub fn element_signature(&self) -> Option<&'a str> {
        let current = self.current_signature()?;
        current.strip_prefix('a')
    }

    /// A cursor scoped to the contents of the container at the cursor:
    /// the element of an array, or the members of a struct or dict entry.
    pub fn recurse(&self) -> Option<SignatureIter<'a>> {
        let current = self.current_signature()?;
        match current.as_bytes()[0] {
            b'a' => Some(SignatureIter::new(&current[1..])),
            b'(' | b'{' if current.len() >= 2 => {
                Some(SignatureIter::new(&current[1..current.len() - 1]))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'a str {
        self.sig
    }
}
