//! Static descriptions of D-Bus interfaces.
//!
//! A statically typed proxy is backed by an [`InterfaceDescriptor`]: a constant table of the
//! methods, signals and properties of one remote interface. Proxies consult it to auto-detect call
//! modes, to type property values, and to enumerate signals for relay bookkeeping.
//!
//! ```
//! use busproxy::interface::*;
//!
//! const NOTIFICATIONS: InterfaceDescriptor = InterfaceDescriptor {
//!     name: "org.freedesktop.Notifications",
//!     methods: &[
//!         MethodDescriptor::new("Notify", "susssasa{sv}i", "u"),
//!         MethodDescriptor::new("CloseNotification", "u", "").no_reply(),
//!     ],
//!     signals: &[SignalDescriptor::new("NotificationClosed", "uu")],
//!     properties: &[],
//! };
//!
//! assert!(NOTIFICATIONS.method("CloseNotification").unwrap().no_reply);
//! ```

/// A remote method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub input_signature: &'static str,
    pub output_signature: &'static str,
    /// The method is fire-and-forget: callers never wait for its reply.
    pub no_reply: bool,
}

impl MethodDescriptor {
    pub const fn new(
        name: &'static str,
        input_signature: &'static str,
        output_signature: &'static str,
    ) -> Self {
        Self {
            name,
            input_signature,
            output_signature,
            no_reply: false,
        }
    }

    /// Marks the method as not expecting a reply.
    pub const fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

/// A remote signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub name: &'static str,
    pub signature: &'static str,
}

impl SignalDescriptor {
    pub const fn new(name: &'static str, signature: &'static str) -> Self {
        Self { name, signature }
    }
}

/// Whether a property can be read, written, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// The local type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// Any value is accepted; no signature check is performed.
    Any,
    /// A type registered under this name in the [`TypeRegistry`][crate::types::TypeRegistry].
    Named(&'static str),
}

impl PropertyType {
    /// Returns the registered type name, or `"Any"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::Named(name) => name,
        }
    }
}

/// A remote property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: &'static str,
    pub ty: PropertyType,
    pub access: PropertyAccess,
}

impl PropertyDescriptor {
    pub const fn new(name: &'static str, ty: PropertyType, access: PropertyAccess) -> Self {
        Self { name, ty, access }
    }
}

/// The methods, signals and properties of one D-Bus interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
    pub signals: &'static [SignalDescriptor],
    pub properties: &'static [PropertyDescriptor],
}

impl InterfaceDescriptor {
    /// The descriptor of a dynamic proxy, which declares nothing up front.
    pub const DYNAMIC: Self = Self {
        name: "",
        methods: &[],
        signals: &[],
        properties: &[],
    };

    /// Returns the first declared method called `name`.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Types that expose the [`InterfaceDescriptor`] of the remote interface they stand for.
pub trait Reflectable {
    fn descriptor(&self) -> &InterfaceDescriptor;

    /// Returns the declared properties.
    fn property_descriptors(&self) -> &[PropertyDescriptor] {
        self.descriptor().properties
    }
}
