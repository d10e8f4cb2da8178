//! Messages and their wire framing.
//!
//! A message on the wire is a fixed header, `yyyyuua(yv)`, followed by
//! padding to 8 bytes and the body. The header is marshalled with the same
//! encoder and decoder as bodies are; the `a(yv)` part carries the header
//! fields (path, member, signature, ...) as variants keyed by a code.

use crate::adapter;
use crate::app_value::AppValue;
use crate::de::{decode, decode_prefix};
use crate::error::{Error, Result};
use crate::ser::{encode_body, encode_wire, encode_wire_body, MessageBuilder};
use crate::signature::{TypeDescriptor, TypeSignature};
use crate::value::{Scalar, WireValue};

use bitflags::bitflags;
use byteorder::{ByteOrder, BE, LE};
use std::fmt;

/// Largest message the bus will pass, header included.
pub const MAX_MESSAGE_LEN: usize = 1 << 27;

const PROTOCOL_VERSION: u8 = 1;
const HEADER_SIGNATURE: &str = "yyyyuua(yv)";
const FIXED_HEADER_LEN: usize = 16;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// Marshalled arguments and the signature they were marshalled with.
/// The data is little endian unless `big_endian` is set, which only
/// happens for bodies received from a big-endian peer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Body {
    pub data: Vec<u8>,
    pub signature: String,
    pub big_endian: bool,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(Error::Malformed(format!("unknown message type {}", other))),
        }
    }
}

impl MessageType {
    /// The name used for the `type` key of match rules.
    pub fn match_name(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    message_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    unix_fds: Option<u32>,
    body: Body,
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Message {
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            unix_fds: None,
            body: Body::new(),
        }
    }

    /// A call of `interface.member` on the object at `path`, owned by
    /// `destination`. Empty `destination` or `interface` are left out.
    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Message {
            destination: non_empty(destination),
            path: Some(path.to_owned()),
            interface: non_empty(interface),
            member: Some(member.to_owned()),
            ..Message::new(MessageType::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Message {
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Message::new(MessageType::Signal)
        }
    }

    /// An empty reply to `call`, addressed back to its sender.
    pub fn method_return(call: &Message) -> Self {
        Message {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Message::new(MessageType::MethodReturn)
        }
    }

    /// An error reply to `call`, with `text` as its single string
    /// argument.
    pub fn error(call: &Message, name: &str, text: &str) -> Self {
        let body = encode_wire_body(&[WireValue::string(text.replace('\0', ""))], "s")
            .unwrap_or_default();
        Message {
            error_name: Some(name.to_owned()),
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            body,
            ..Message::new(MessageType::Error)
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Marshals `args` against `signature` into the body.
    pub fn with_args(self, args: &[AppValue], signature: &str) -> Result<Self> {
        Ok(self.with_body(encode_body(args, signature)?))
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = non_empty(destination);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Zero until the message has been sent or received.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub(crate) fn set_sender(&mut self, sender: &str) {
        self.sender = Some(sender.to_owned());
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.body.signature
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// The body, decoded.
    pub fn args(&self) -> Vec<WireValue> {
        decode(&self.body)
    }

    /// The body, decoded into application values.
    pub fn app_args(&self) -> Vec<AppValue> {
        adapter::decode_all(&self.args())
    }

    /// The human-readable text of an error reply, if it has one.
    pub fn error_text(&self) -> Option<String> {
        self.args()
            .first()
            .and_then(|arg| arg.as_str().map(str::to_owned))
    }

    fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(Error::Malformed(format!(
                "{} without {}",
                self.message_type.match_name(),
                field
            )))
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.interface.is_none() {
                    return missing("interface");
                }
                if self.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return missing("error name");
                }
                if self.reply_serial.is_none() {
                    return missing("reply serial");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("reply serial");
                }
            }
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<WireValue> {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Scalar| {
            fields.push(WireValue::Struct(vec![
                Scalar::Byte(code).into(),
                WireValue::variant(value.into()),
            ]));
        };
        if let Some(path) = &self.path {
            push(FIELD_PATH, Scalar::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(FIELD_INTERFACE, Scalar::String(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(FIELD_MEMBER, Scalar::String(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(FIELD_ERROR_NAME, Scalar::String(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(FIELD_REPLY_SERIAL, Scalar::UInt32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(FIELD_DESTINATION, Scalar::String(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(FIELD_SENDER, Scalar::String(sender.clone()));
        }
        if !self.body.signature.is_empty() {
            push(FIELD_SIGNATURE, Scalar::Signature(self.body.signature.clone()));
        }
        if let Some(unix_fds) = self.unix_fds {
            push(FIELD_UNIX_FDS, Scalar::UInt32(unix_fds));
        }
        fields
    }

    /// Frames the message with the given serial. The frame has the byte
    /// order of the body, so a body received from a big-endian peer is
    /// passed on untouched.
    pub fn to_bytes(&self, serial: u32) -> Result<Vec<u8>> {
        if serial == 0 {
            return Err(Error::Malformed("serial must not be zero".to_owned()));
        }
        self.validate()?;
        let (marker, mut builder) = if self.body.big_endian {
            (b'B', MessageBuilder::big_endian())
        } else {
            (b'l', MessageBuilder::new())
        };

        let header = vec![
            Scalar::Byte(marker).into(),
            Scalar::Byte(self.message_type as u8).into(),
            Scalar::Byte(self.flags.bits()).into(),
            Scalar::Byte(PROTOCOL_VERSION).into(),
            Scalar::UInt32(self.body.data.len() as u32).into(),
            Scalar::UInt32(serial).into(),
            WireValue::Array {
                element: TypeDescriptor::Struct(vec![TypeDescriptor::Byte, TypeDescriptor::Variant]),
                items: self.header_fields(),
            },
        ];
        encode_wire(&mut builder, &header, &TypeSignature::parse(HEADER_SIGNATURE)?)?;
        builder.align(8);
        builder.append_raw(&self.body.data);
        let bytes = builder.finish()?;
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(Error::Malformed(format!(
                "message of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_MESSAGE_LEN
            )));
        }
        Ok(bytes)
    }

    /// Parses one complete framed message.
    pub fn from_bytes(data: &[u8]) -> Result<Message> {
        match data.first() {
            Some(b'l') => Self::from_bytes_with_order::<LE>(data, false),
            Some(b'B') => Self::from_bytes_with_order::<BE>(data, true),
            Some(other) => Err(Error::Malformed(format!(
                "unknown endianness marker {:?}",
                *other as char
            ))),
            None => Err(Error::Malformed("empty message".to_owned())),
        }
    }

    fn from_bytes_with_order<B: ByteOrder>(data: &[u8], big_endian: bool) -> Result<Message> {
        let (header, header_len) = decode_prefix::<B>(data, HEADER_SIGNATURE)?;
        let byte = |ix: usize| match header.get(ix) {
            Some(WireValue::Scalar(Scalar::Byte(b))) => Ok(*b),
            _ => Err(Error::Malformed("truncated header".to_owned())),
        };
        let message_type = MessageType::try_from(byte(1)?)?;
        let flags = MessageFlags::from_bits_truncate(byte(2)?);
        if byte(3)? != PROTOCOL_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported protocol version {}",
                byte(3)?
            )));
        }
        let body_len = header.get(4).and_then(WireValue::as_u32).unwrap_or(0) as usize;
        let serial = header.get(5).and_then(WireValue::as_u32).unwrap_or(0);
        if serial == 0 {
            return Err(Error::Malformed("message with serial zero".to_owned()));
        }

        let body_start = crate::align::align(header_len, 8);
        let body_end = body_start + body_len;
        if body_end > data.len() || body_end > MAX_MESSAGE_LEN {
            return Err(Error::Malformed(format!(
                "body of {} bytes does not fit the frame",
                body_len
            )));
        }

        let mut message = Message::new(message_type);
        message.flags = flags;
        message.serial = serial;
        message.body.data = data[body_start..body_end].to_vec();
        message.body.big_endian = big_endian;
        if let Some(WireValue::Array { items, .. }) = header.get(6) {
            for field in items {
                message.apply_field(field)?;
            }
        }
        message.validate()?;
        Ok(message)
    }

    fn apply_field(&mut self, field: &WireValue) -> Result<()> {
        let (code, value) = match field {
            WireValue::Struct(parts) => match parts.as_slice() {
                [WireValue::Scalar(Scalar::Byte(code)), value] => (*code, value.unwrap_variant()),
                _ => return Err(Error::Malformed("bad header field".to_owned())),
            },
            _ => return Err(Error::Malformed("bad header field".to_owned())),
        };
        let wrong_type = || {
            Err(Error::Malformed(format!(
                "header field {} has type {}",
                code,
                value.kind_name()
            )))
        };
        let string = || value.as_str().map(str::to_owned);
        match (code, value) {
            (FIELD_PATH, WireValue::Scalar(Scalar::ObjectPath(path))) => {
                self.path = Some(path.clone())
            }
            (FIELD_INTERFACE, WireValue::Scalar(Scalar::String(_))) => self.interface = string(),
            (FIELD_MEMBER, WireValue::Scalar(Scalar::String(_))) => self.member = string(),
            (FIELD_ERROR_NAME, WireValue::Scalar(Scalar::String(_))) => {
                self.error_name = string()
            }
            (FIELD_REPLY_SERIAL, WireValue::Scalar(Scalar::UInt32(serial))) => {
                self.reply_serial = Some(*serial)
            }
            (FIELD_DESTINATION, WireValue::Scalar(Scalar::String(_))) => {
                self.destination = string()
            }
            (FIELD_SENDER, WireValue::Scalar(Scalar::String(_))) => self.sender = string(),
            (FIELD_SIGNATURE, WireValue::Scalar(Scalar::Signature(sig))) => {
                if !sig.is_ascii() {
                    return Err(Error::Malformed(format!(
                        "body signature {:?} is not ASCII",
                        sig
                    )));
                }
                self.body.signature = sig.clone()
            }
            (FIELD_UNIX_FDS, WireValue::Scalar(Scalar::UInt32(n))) => self.unix_fds = Some(*n),
            (FIELD_PATH..=FIELD_UNIX_FDS, _) => return wrong_type(),
            // Unknown fields must be ignored.
            _ => {}
        }
        Ok(())
    }
}

/// Total length of the message starting at `data`, once enough of it has
/// arrived to tell; `None` if fewer than 16 bytes are available.
pub fn frame_length(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let read_u32 = |bytes: &[u8]| match data[0] {
        b'l' => Ok(LE::read_u32(bytes)),
        b'B' => Ok(BE::read_u32(bytes)),
        other => Err(Error::Malformed(format!(
            "unknown endianness marker {:?}",
            other as char
        ))),
    };
    let body_len = read_u32(&data[4..8])? as usize;
    let fields_len = read_u32(&data[12..16])? as usize;
    let total = crate::align::align(FIXED_HEADER_LEN + fields_len, 8) + body_len;
    if total > MAX_MESSAGE_LEN {
        return Err(Error::Malformed(format!(
            "message of {} bytes exceeds the {} byte limit",
            total, MAX_MESSAGE_LEN
        )));
    }
    Ok(Some(total))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.message_type.match_name(), self.serial)?;
        if let Some(sender) = &self.sender {
            write!(f, " from {}", sender)?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " to {}", destination)?;
        }
        if let Some(path) = &self.path {
            write!(f, " {}", path)?;
        }
        match (&self.interface, &self.member) {
            (Some(interface), Some(member)) => write!(f, " {}.{}", interface, member)?,
            (None, Some(member)) => write!(f, " {}", member)?,
            _ => {}
        }
        if let Some(name) = &self.error_name {
            write!(f, " {}", name)?;
        }
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " (reply to #{})", reply_serial)?;
        }
        write!(f, " ({})", self.body.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::{frame_length, Body, Message, MessageFlags, MessageType};
    use crate::app_value::AppValue;
    use crate::error::{Error, Result};
    use crate::ser::{encode_wire, MessageBuilder};
    use crate::signature::{TypeDescriptor, TypeSignature};
    use crate::value::{Scalar, WireValue};
    use test_log::test;

    fn call() -> Result<Message> {
        Message::method_call("org.test.Echo", "/org/test/Echo", "org.test.Echo", "Ping")
            .with_args(&["hello".into()], "s")
    }

    #[test]
    fn header_round_trip() -> Result<()> {
        let mut message = call()?.with_flags(MessageFlags::NO_AUTO_START);
        message.set_sender(":1.7");
        let bytes = message.to_bytes(3)?;
        assert_eq!(frame_length(&bytes)?, Some(bytes.len()));

        let parsed = Message::from_bytes(&bytes)?;
        assert_eq!(parsed.message_type(), MessageType::MethodCall);
        assert_eq!(parsed.serial(), 3);
        assert_eq!(parsed.flags(), MessageFlags::NO_AUTO_START);
        assert_eq!(parsed.destination(), Some("org.test.Echo"));
        assert_eq!(parsed.path(), Some("/org/test/Echo"));
        assert_eq!(parsed.interface(), Some("org.test.Echo"));
        assert_eq!(parsed.member(), Some("Ping"));
        assert_eq!(parsed.sender(), Some(":1.7"));
        assert_eq!(parsed.signature(), "s");
        assert_eq!(parsed.app_args(), vec![AppValue::from("hello")]);
        Ok(())
    }

    #[test]
    fn fixed_header_bytes() -> Result<()> {
        let bytes = Message::signal("/", "a.b", "C").to_bytes(1)?;
        assert_eq!(&bytes[..4], &[b'l', 4, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        // Header fields, then padding up to the (empty) body.
        let fields_len = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        assert_eq!(bytes.len(), 16 + fields_len as usize + (8 - fields_len as usize % 8) % 8);
        Ok(())
    }

    #[test]
    fn replies_and_errors() -> Result<()> {
        let mut request = call()?;
        request.set_serial(9);
        request.set_sender(":1.1");

        let reply = Message::method_return(&request).with_args(&["hello".into()], "s")?;
        let reply = Message::from_bytes(&reply.to_bytes(10)?)?;
        assert_eq!(reply.reply_serial(), Some(9));
        assert_eq!(reply.destination(), Some(":1.1"));

        let error = Message::error(&request, "org.test.Error.Failed", "it broke");
        let error = Message::from_bytes(&error.to_bytes(11)?)?;
        assert_eq!(error.message_type(), MessageType::Error);
        assert_eq!(error.error_name(), Some("org.test.Error.Failed"));
        assert_eq!(error.error_text().as_deref(), Some("it broke"));
        Ok(())
    }

    #[test]
    fn big_endian_message() -> Result<()> {
        // Hand-framed: signal /, interface "a.b", member "C", body u32 5.
        let mut bytes = vec![b'B', 4, 0, 1, 0, 0, 0, 4, 0, 0, 0, 1];
        let fields: Vec<u8> = vec![
            1, 1, b'o', 0, 0, 0, 0, 1, b'/', 0, 0, 0, 0, 0, 0, 0, // path
            2, 1, b's', 0, 0, 0, 0, 3, b'a', b'.', b'b', 0, 0, 0, 0, 0, // interface
            3, 1, b's', 0, 0, 0, 0, 1, b'C', 0, 0, 0, 0, 0, 0, 0, // member
            8, 1, b'g', 0, 1, b'u', 0, // signature
        ];
        bytes.extend_from_slice(&(fields.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&fields);
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        bytes.extend_from_slice(&[0, 0, 0, 5]);

        assert_eq!(frame_length(&bytes)?, Some(bytes.len()));
        let message = Message::from_bytes(&bytes)?;
        assert_eq!(message.member(), Some("C"));
        assert_eq!(message.app_args(), vec![AppValue::Int(5)]);

        // Re-framing keeps the byte order of the body.
        let framed = message.to_bytes(2)?;
        assert_eq!(framed[0], b'B');
        let again = Message::from_bytes(&framed)?;
        assert_eq!(again.app_args(), vec![AppValue::Int(5)]);
        assert_eq!(again.body(), message.body());
        Ok(())
    }

    #[test]
    fn big_endian_unix_fd_survives_reframing() -> Result<()> {
        // Signal with body `hu`: fd index 0, then 9.
        let mut bytes = vec![b'B', 4, 0, 1, 0, 0, 0, 8, 0, 0, 0, 3];
        let fields: Vec<u8> = vec![
            1, 1, b'o', 0, 0, 0, 0, 1, b'/', 0, 0, 0, 0, 0, 0, 0, // path
            2, 1, b's', 0, 0, 0, 0, 3, b'a', b'.', b'b', 0, 0, 0, 0, 0, // interface
            3, 1, b's', 0, 0, 0, 0, 1, b'C', 0, 0, 0, 0, 0, 0, 0, // member
            8, 1, b'g', 0, 2, b'h', b'u', 0, // signature
        ];
        bytes.extend_from_slice(&(fields.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&fields);
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 9]);

        let message = Message::from_bytes(&bytes)?;
        let framed = message.to_bytes(3)?;
        assert_eq!(&framed[framed.len() - 8..], &[0, 0, 0, 0, 0, 0, 0, 9]);
        let again = Message::from_bytes(&framed)?;
        assert_eq!(again.serial(), 3);
        assert_eq!(again.signature(), "hu");
        assert_eq!(
            again.args(),
            vec![WireValue::Unrecognized(b'h'), Scalar::UInt32(9).into()]
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_frames() -> Result<()> {
        let bytes = call()?.to_bytes(1)?;
        assert!(matches!(
            Message::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::Malformed(_))
        ));
        let mut wrong_version = bytes.clone();
        wrong_version[3] = 2;
        assert!(Message::from_bytes(&wrong_version).is_err());
        let mut zero_serial = bytes;
        zero_serial[8] = 0;
        assert!(Message::from_bytes(&zero_serial).is_err());

        let mut no_member = Message::method_call("", "/", "", "x").with_body(Body::new());
        no_member.member = None;
        assert!(no_member.to_bytes(1).is_err());
        assert_eq!(frame_length(&[b'l', 1, 0])?, None);
        Ok(())
    }

    fn framed_signal(extra: (u8, WireValue)) -> Result<Vec<u8>> {
        let field = |code: u8, value: WireValue| {
            WireValue::Struct(vec![Scalar::Byte(code).into(), WireValue::variant(value)])
        };
        let header = vec![
            Scalar::Byte(b'l').into(),
            Scalar::Byte(4).into(),
            Scalar::Byte(0).into(),
            Scalar::Byte(1).into(),
            Scalar::UInt32(0).into(),
            Scalar::UInt32(1).into(),
            WireValue::Array {
                element: TypeDescriptor::Struct(vec![TypeDescriptor::Byte, TypeDescriptor::Variant]),
                items: vec![
                    field(1, Scalar::ObjectPath("/".to_owned()).into()),
                    field(2, WireValue::string("a.b")),
                    field(3, WireValue::string("C")),
                    field(extra.0, extra.1),
                ],
            },
        ];
        let mut builder = MessageBuilder::new();
        encode_wire(&mut builder, &header, &TypeSignature::parse("yyyyuua(yv)")?)?;
        builder.align(8);
        builder.finish()
    }

    #[test]
    fn unknown_header_fields_are_ignored() -> Result<()> {
        let bytes = framed_signal((42, WireValue::string("x")))?;
        let message = Message::from_bytes(&bytes)?;
        assert_eq!(message.member(), Some("C"));
        assert_eq!(message.signature(), "");
        Ok(())
    }

    #[test]
    fn known_field_with_wrong_type() -> Result<()> {
        let bytes = framed_signal((5, WireValue::string("not a serial")))?;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn non_ascii_body_signature() -> Result<()> {
        let mut bytes = framed_signal((8, Scalar::Signature("(yy)".to_owned()).into()))?;
        let at = bytes
            .windows(5)
            .position(|window| window == b"(yy)\0")
            .ok_or_else(|| Error::Malformed("signature field not found".to_owned()))?;
        bytes[at + 1..at + 3].copy_from_slice(&[0xc3, 0xa9]);
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }
}
