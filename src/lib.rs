//! Remote-object proxies for D-Bus services.
//!
//! A [`Proxy`] stands for one interface of one object exported by some service. It offers
//! blocking, asynchronous and callback-style method calls, typed property access, and local
//! subscriptions to remote signals, and keeps track of which connection currently owns the
//! service. Failures never panic: they are recorded in [`Proxy::last_error`] and returned as
//! error-shaped replies.
//!
//! All proxies created from one [`Session`] share its [`Connection`] and [`TypeRegistry`], and
//! run their deferred work (signal delivery, relay bookkeeping, reply callbacks) on its
//! [`WorkQueue`].

mod bus;
pub mod connection;
mod error;
pub mod interface;
pub mod message;
pub mod names;
mod pending;
mod proxy;
pub mod queue;
#[cfg(test)]
mod testing;
pub mod types;

pub use bus::BusConnection;
pub use connection::Connection;
pub use error::{BusError, Error, ErrorKind, Result};
pub use message::{Argument, CallMode, Message};
pub use pending::{PendingCall, ReplyCallbacks};
pub use proxy::{Proxy, ProxyBuilder, SignalHandlerId};
pub use queue::{Scheduler, WorkQueue};
pub use types::TypeRegistry;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use zbus::zvariant::{OwnedValue, Type, Value};

/// A cloneable handle to a [`Connection`], the [`TypeRegistry`] and the [`WorkQueue`] shared by
/// a group of proxies.
///
/// The work queue belongs to the thread that created the [`Session`]; that thread must run it
/// (see [`WorkQueue::run_pending`]) for signals and callbacks to be delivered.
#[derive(Clone)]
pub struct Session {
    conn: Arc<dyn Connection>,
    registry: Arc<RwLock<TypeRegistry>>,
    queue: Arc<WorkQueue>,
}

impl Session {
    /// Connects to the system bus.
    pub async fn system() -> Result<Self> {
        let conn = zbus::Connection::system().await.map_err(Error::from)?;
        Ok(Self::from_zbus(conn))
    }

    /// Connects to the session bus of the current user.
    pub async fn session() -> Result<Self> {
        let conn = zbus::Connection::session().await.map_err(Error::from)?;
        Ok(Self::from_zbus(conn))
    }

    /// Creates a [`Session`] on an existing `zbus` connection to a message bus.
    pub fn from_zbus(conn: zbus::Connection) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let conn = BusConnection::bus(conn).with_event_loop(queue.clone());
        Self::with_queue(Arc::new(conn), queue)
    }

    /// Creates a [`Session`] on any [`Connection`], with a fresh [`WorkQueue`] owned by the
    /// calling thread.
    pub fn from_connection(conn: Arc<dyn Connection>) -> Self {
        Self::with_queue(conn, Arc::new(WorkQueue::new()))
    }

    fn with_queue(conn: Arc<dyn Connection>, queue: Arc<WorkQueue>) -> Self {
        Self {
            conn,
            registry: Arc::new(RwLock::new(TypeRegistry::with_builtins())),
            queue,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Returns the [`WorkQueue`] proxies of this [`Session`] post their deferred work to.
    pub fn event_loop(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Makes properties declared with type `name` usable, with the wire signature of `T`.
    pub fn register_type<T: Type>(&self, name: &str) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register::<T>(name);
    }

    /// Makes properties declared with type `name` usable, converting compound values with
    /// `demarshal`.
    pub fn register_type_with<F>(&self, name: &str, signature: &str, demarshal: F)
    where
        F: Fn(&Value<'_>) -> Option<OwnedValue> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_with(name, signature, demarshal);
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, TypeRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}
