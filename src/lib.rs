//! DBus marshalling for dynamically-typed values.
//!
//! Values here do not carry their DBus types. Instead, a type signature
//! like `a{sv}` or `(sdu)` drives the encoding: the [`ser`] module walks the
//! signature and the values side by side, and fails without leaving a
//! trace in the message when they do not fit. The [`de`] module goes the
//! other way, reading as much of a body as it can make sense of.
//!
//! There are two value models. [`WireValue`] mirrors the DBus type system
//! exactly, with every integer width and container kind kept apart.
//! [`AppValue`] is what an application or scripting layer works with:
//! booleans, `i64`s, `f64`s, strings, arrays and mappings, plus a
//! [`Wrapped`] escape hatch for when the exact wire kind matters. The
//! [`adapter`] module converts between the two, which is also where
//! untyped `v` slots get their type inferred.
//!
//! For Rust types with `Serialize` and `Deserialize` instances, the
//! [`app_value`] module bridges [serde] to [`AppValue`], with the
//! [`serializer_policy`] deciding how structs are laid out.
//!
//! On top of the marshaller sits a small blocking client. A
//! [`Connection`] opens a [`Transport`] to a bus, sends
//! [`Message`]s, waits for replies and manages names and match rules.
//! [`transport`] speaks to a real bus daemon through zbus;
//! [`memory`] provides a bus inside the process for tests.
//!
//! [serde]: https://serde.rs
//! [`WireValue`]: crate::value::WireValue
//! [`AppValue`]: crate::app_value::AppValue
//! [`Wrapped`]: crate::app_value::Wrapped
//! [`serializer_policy`]: crate::app_value::serializer_policy
//! [`Connection`]: crate::connection::Connection
//! [`Transport`]: crate::connection::Transport
//! [`Message`]: crate::message::Message

pub mod adapter;
mod align;
pub mod app_value;
pub mod connection;
pub mod de;
pub mod error;
pub mod memory;
pub mod message;
mod primitives;
pub mod ser;
pub mod signature;
pub mod transport;
pub mod value;

pub use app_value::{from_app_value, to_app_value, AppValue, Mapping, Wrapped};
pub use connection::{Bus, Connection, NameFlags};
pub use error::{Error, Result};
pub use message::{Body, Message, MessageType};
pub use signature::{TypeDescriptor, TypeSignature};
pub use value::{Scalar, WireValue};
