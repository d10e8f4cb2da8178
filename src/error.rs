use thiserror;

use std;
use std::fmt::Display;

use serde::{de, ser};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No active bus connection, or the connection could not be set up.
    #[error("connection error: {0}")]
    Connection(String),
    /// The remote side (or the bus itself) answered with an error.
    #[error("{name}: {message}")]
    Bus { name: String, message: String },
    #[error("invalid signature {signature:?}: {reason}")]
    InvalidSignature { signature: String, reason: String },
    #[error("expected {expected} values for signature, got {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("no variant type mapping for {0}")]
    UnsupportedVariantType(String),
    #[error("unrecognized type code {0:?}")]
    UnrecognizedType(char),
    #[error("container close does not match the innermost open container")]
    UnbalancedContainer,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error serializing: {0}")]
    Serializing(String),
    #[error("error deserializing: {0}")]
    Deserializing(String),
}

impl Error {
    pub(crate) fn invalid_signature(signature: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSignature {
            signature: signature.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl Display, found: impl Into<String>) -> Self {
        Error::TypeMismatch {
            expected: expected.to_string(),
            found: found.into(),
        }
    }

    /// The bus-defined error name, for errors that carry one.
    pub fn bus_error_name(&self) -> Option<&str> {
        match self {
            Error::Bus { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Serializing(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Deserializing(msg.to_string())
    }
}

impl From<zbus::Error> for Error {
    fn from(e: zbus::Error) -> Self {
        Error::Connection(e.to_string())
    }
}
