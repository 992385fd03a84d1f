use std::fmt;

use crate::message::{Message, MessageType};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned when setting up connections and sessions.
///
/// Errors produced by individual proxy operations are reported as [`BusError`]s instead, via
/// [`Proxy::last_error`][crate::Proxy::last_error] or an error-shaped reply [`Message`].
#[derive(Debug)]
pub struct Error {
    inner: Repr,
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self { inner: e.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Repr::Zbus(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            Repr::Zbus(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Repr {
    Zbus(zbus::Error),
}

impl From<zbus::Error> for Repr {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Classifies a [`BusError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Not an error. This is what [`Proxy::last_error`][crate::Proxy::last_error] reports after a
    /// successful operation.
    #[default]
    NoError,
    /// A service name, object path, interface or member name was malformed.
    InvalidArgument,
    /// The connection is not live.
    Disconnected,
    /// A property type has no wire signature registered in the
    /// [`TypeRegistry`][crate::types::TypeRegistry].
    UnregisteredType,
    /// A reply did not have the expected shape.
    InvalidSignature,
    /// A generic failure surfaced by the bus or the remote object.
    Failed,
    /// No reply arrived before the call timed out.
    NoReply,
    /// A remote error whose name has no dedicated kind. The name is kept verbatim.
    Other,
}

impl ErrorKind {
    /// Maps a D-Bus error name to the matching kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "" => Self::NoError,
            INVALID_ARGS => Self::InvalidArgument,
            DISCONNECTED => Self::Disconnected,
            INVALID_SIGNATURE => Self::InvalidSignature,
            FAILED => Self::Failed,
            NO_REPLY | "org.freedesktop.DBus.Error.Timeout" => Self::NoReply,
            _ => Self::Other,
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            Self::NoError => "",
            Self::InvalidArgument => INVALID_ARGS,
            Self::Disconnected => DISCONNECTED,
            Self::InvalidSignature => INVALID_SIGNATURE,
            Self::UnregisteredType | Self::Failed | Self::Other => FAILED,
            Self::NoReply => NO_REPLY,
        }
    }
}

/// An error reported by a proxy operation: a [`ErrorKind`], the D-Bus error name and a
/// human-readable message.
///
/// A [`BusError`] of kind [`ErrorKind::NoError`] is the "no error" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusError {
    kind: ErrorKind,
    name: String,
    message: String,
}

impl BusError {
    /// Returns the "no error" sentinel.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates an error of the given kind, using the standard D-Bus error name for that kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.default_name().to_string(),
            message: message.into(),
        }
    }

    /// Creates an error from a D-Bus error name and message, as sent by a remote peer.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ErrorKind::from_name(&name),
            name,
            message: message.into(),
        }
    }

    /// Extracts the error carried by `reply`.
    ///
    /// Returns the "no error" sentinel if `reply` is not an error message, so assigning the result
    /// clears a previously stored error.
    pub fn from_reply(reply: &Message) -> Self {
        if reply.message_type() == MessageType::Error {
            reply.bus_error().cloned().unwrap_or_else(|| {
                BusError::new(ErrorKind::Failed, "error reply without an error name")
            })
        } else {
            Self::none()
        }
    }

    pub(crate) fn from_zbus(e: &zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, detail, _) => {
                Self::remote(name.to_string(), detail.clone().unwrap_or_default())
            }
            zbus::Error::FDO(e) => Self::from_fdo(e),
            other => Self::new(ErrorKind::Failed, other.to_string()),
        }
    }

    pub(crate) fn from_fdo(e: &zbus::fdo::Error) -> Self {
        use zbus::DBusError;

        Self::remote(e.name().to_string(), e.description().unwrap_or_default())
    }

    /// Returns `true` unless this is the "no error" sentinel.
    pub fn is_error(&self) -> bool {
        self.kind != ErrorKind::NoError
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the D-Bus error name (eg. `org.freedesktop.DBus.Error.InvalidArgs`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_error() {
            return f.write_str("no error");
        }
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusError {}
