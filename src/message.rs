//! D-Bus [`Message`]s as seen by proxies.
//!
//! This is a decoded view of a message: addressing, a list of [`Argument`]s and, for error
//! replies, a [`BusError`]. Turning it into bytes is the business of the [`Connection`].
//!
//! [`Connection`]: crate::connection::Connection

use std::fmt::Write;

use bitflags::bitflags;
use zbus::zvariant::{OwnedValue, Value};

use crate::error::BusError;

/// The kind of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    /// A successful method return.
    Reply,
    Error,
    Signal,
}

/// How a synchronous call waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// Send the call and return immediately without waiting for (or expecting) a reply.
    NoBlock,
    /// Block the calling thread until the reply arrives or the call times out.
    #[default]
    Block,
    /// Like [`CallMode::Block`], but keep running the connection's work queue while waiting.
    ///
    /// Other queued work (relayed signals, deferred bookkeeping, callbacks) may run before the call
    /// returns, so callers must tolerate reentrancy.
    BlockWithEventLoop,
    /// Pick [`CallMode::NoBlock`] if the method is declared as not expecting a reply, and
    /// [`CallMode::Block`] otherwise.
    AutoDetect,
}

bitflags! {
    /// Flags attached to an outgoing [`Message`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// The caller will not wait for a reply.
        const NO_REPLY_EXPECTED = 1 << 0;
        /// The caller is prepared to wait for interactive authorization (eg. a polkit prompt).
        const ALLOW_INTERACTIVE_AUTHORIZATION = 1 << 1;
        /// Addressing was already validated by the proxy and need not be checked again.
        const PARAMETERS_VALIDATED = 1 << 2;
    }
}

/// A single message argument.
///
/// [`Argument::Empty`] never goes on the wire; it only pads replies that carried no arguments (see
/// [`Proxy::call`][crate::Proxy::call]).
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Empty,
    Value(OwnedValue),
}

impl Argument {
    /// Creates an [`Argument`] from anything convertible to a [`Value`].
    pub fn new<'a>(value: impl Into<Value<'a>>) -> Self {
        Self::Value(OwnedValue::from(value.into()))
    }

    /// Returns the value, or [`None`] for [`Argument::Empty`].
    pub fn value(&self) -> Option<&OwnedValue> {
        match self {
            Self::Empty => None,
            Self::Value(v) => Some(v),
        }
    }

    /// Returns the wire signature of this argument (empty for [`Argument::Empty`]).
    pub fn signature(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Value(v) => v.value_signature().to_string(),
        }
    }
}

impl From<OwnedValue> for Argument {
    fn from(value: OwnedValue) -> Self {
        Self::Value(value)
    }
}

/// A method call, reply, error or signal.
#[derive(Debug, Clone)]
pub struct Message {
    ty: MessageType,
    service: String,
    path: String,
    interface: String,
    member: String,
    arguments: Vec<Argument>,
    error: Option<BusError>,
    flags: MessageFlags,
}

impl Message {
    fn with_type(ty: MessageType) -> Self {
        Self {
            ty,
            service: String::new(),
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            arguments: Vec::new(),
            error: None,
            flags: MessageFlags::empty(),
        }
    }

    /// Creates a method call addressed to `member` of `interface` on the object at `path` owned by
    /// `service`.
    pub fn method_call(service: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            ..Self::with_type(MessageType::MethodCall)
        }
    }

    /// Creates a successful method return carrying `arguments`.
    pub fn reply(arguments: Vec<Argument>) -> Self {
        Self {
            arguments,
            ..Self::with_type(MessageType::Reply)
        }
    }

    /// Creates an error reply.
    pub fn error(error: BusError) -> Self {
        Self {
            arguments: vec![Argument::new(error.message().to_string())],
            error: Some(error),
            ..Self::with_type(MessageType::Error)
        }
    }

    /// Creates a signal emitted by `service` from the object at `path`.
    pub fn signal(
        service: &str,
        path: &str,
        interface: &str,
        member: &str,
        arguments: Vec<Argument>,
    ) -> Self {
        Self {
            service: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            arguments,
            ..Self::with_type(MessageType::Signal)
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    /// Returns `true` if this is an error reply.
    pub fn is_error(&self) -> bool {
        self.ty == MessageType::Error
    }

    /// Returns the destination of a method call, or the sender of a signal.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn set_arguments(&mut self, arguments: Vec<Argument>) {
        self.arguments = arguments;
    }

    pub fn push_argument(&mut self, argument: Argument) {
        self.arguments.push(argument);
    }

    /// Returns the error carried by an error reply.
    pub fn bus_error(&self) -> Option<&BusError> {
        self.error.as_ref()
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: MessageFlags, enabled: bool) {
        self.flags.set(flag, enabled);
    }

    /// Returns the wire signature of the message body: the concatenated signatures of all
    /// arguments.
    pub fn signature(&self) -> String {
        let mut signature = String::new();
        for arg in &self.arguments {
            if let Argument::Value(v) = arg {
                // Writing to a `String` cannot fail.
                let _ = write!(signature, "{}", v.value_signature());
            }
        }
        signature
    }
}
