//! The transport seam between proxies and a message bus.
//!
//! Proxies never touch sockets or wire bytes. Everything that leaves the process goes through a
//! [`Connection`], which is shared by all proxies created from one [`Session`][crate::Session].
//! [`BusConnection`][crate::BusConnection] is the implementation backed by `zbus`.

use std::{fmt, sync::Weak};

use crate::{
    error::BusError,
    message::{CallMode, Message},
    pending::{PendingCall, ReplyCallbacks},
};

/// Well-known name of the message bus itself.
pub const BUS_DRIVER: &str = "org.freedesktop.DBus";

/// Addresses one remote signal. Empty fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalRule {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl fmt::Display for SignalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}.{}",
            self.service, self.path, self.interface, self.member
        )
    }
}

/// Receives signals relayed by a [`Connection`].
pub trait SignalReceiver: Send + Sync {
    fn deliver(&self, signal: Message);
}

/// The local end of a signal relay.
///
/// The connection holds the receiver weakly; relays whose receiver is gone silently stop
/// delivering.
#[derive(Clone)]
pub struct RelayTarget {
    /// Distinguishes relays of the same [`SignalRule`] registered by different receivers.
    pub id: u64,
    pub receiver: Weak<dyn SignalReceiver>,
}

impl fmt::Debug for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTarget").field("id", &self.id).finish()
    }
}

/// A change of ownership of a bus name.
///
/// An empty `new_owner` means the name is no longer owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

pub type OwnerChangeHandler = Box<dyn Fn(OwnerChange) + Send + Sync>;

/// Keeps a watch registered with a [`Connection`] alive. The watch ends when this is dropped.
#[must_use = "the watch ends when the `Subscription` is dropped"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a [`Subscription`] that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a [`Subscription`] with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A connection to a message bus or to a single peer.
///
/// Implementations serialize access to their own state; all methods may be called from any
/// thread. Timeouts are in milliseconds, with `-1` selecting the connection's default.
pub trait Connection: Send + Sync {
    /// Returns `true` while the connection is live.
    fn is_connected(&self) -> bool;

    /// Returns `true` for direct peer-to-peer links, which have no bus names or owners.
    fn is_peer(&self) -> bool;

    /// Returns `true` if proxies for `service` need to follow its owner.
    ///
    /// By default this holds for every well-known name on a bus except the bus driver itself.
    /// Unique names (`:1.42`) always belong to the same connection.
    fn should_watch_service(&self, service: &str) -> bool {
        !self.is_peer() && !service.is_empty() && !service.starts_with(':') && service != BUS_DRIVER
    }

    /// Queries the unique name currently owning `service`.
    fn name_owner(&self, service: &str) -> Result<String, BusError>;

    /// Calls `handler` whenever the owner of `service` changes, until the returned
    /// [`Subscription`] is dropped.
    fn watch_owner_changes(&self, service: &str, handler: OwnerChangeHandler) -> Subscription;

    /// Sends `message` and waits for its reply as `mode` prescribes.
    ///
    /// `mode` is never [`CallMode::AutoDetect`]. With [`CallMode::NoBlock`] the returned reply is
    /// empty. Failures are reported as error replies.
    fn call(&self, message: Message, mode: CallMode, timeout: i32) -> Message;

    /// Sends `message` without waiting for the reply.
    fn async_call(&self, message: Message, timeout: i32) -> PendingCall;

    /// Sends `message` and hands the reply to `callbacks` once it arrives.
    ///
    /// Returns `false` if the call could not be sent.
    fn call_with_callback(&self, message: Message, callbacks: ReplyCallbacks, timeout: i32)
        -> bool;

    /// Starts relaying signals matching `rule` to `target`.
    fn connect_relay(&self, rule: &SignalRule, target: RelayTarget);

    /// Stops the relay registered for `rule` by the target with id `target`.
    fn disconnect_relay(&self, rule: &SignalRule, target: u64);
}
