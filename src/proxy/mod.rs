//! [`Proxy`]: the local stand-in for a remote object.

mod call;
mod owner;
mod property;
mod signal;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

pub use signal::SignalHandlerId;

use crate::{
    connection::{Connection, Subscription},
    error::{BusError, ErrorKind},
    interface::{InterfaceDescriptor, Reflectable},
    message::{Argument, Message, MessageFlags},
    names::{self, EmptyPolicy},
    queue::{lock, Scheduler},
    Session,
};

use self::signal::SignalHub;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A proxy for one interface of a remote object.
///
/// Proxies come in two flavors. *Static* proxies are built from an [`InterfaceDescriptor`]
/// declaring the methods, signals and properties of the interface; *dynamic* proxies only know
/// the interface name (if any) and accept whatever the caller asks for.
///
/// All operations report failures through [`Proxy::last_error`] instead of panicking. Cloning a
/// [`Proxy`] yields another handle to the same state.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct State {
    last_error: BusError,
    current_owner: String,
}

pub(crate) struct Inner {
    this: Weak<Inner>,
    id: u64,
    service: String,
    path: String,
    interface: String,
    session: Session,
    scheduler: Arc<dyn Scheduler>,
    descriptor: &'static InterfaceDescriptor,
    is_dynamic: bool,
    /// Outcome of the validation at construction time. Never changes.
    is_valid: bool,
    state: Mutex<State>,
    timeout: AtomicI32,
    interactive: AtomicBool,
    signals: SignalHub,
    owner_watch: Mutex<Option<Subscription>>,
}

impl Proxy {
    /// Creates a static proxy for the interface described by `descriptor`.
    ///
    /// # Panics
    ///
    /// Panics if `descriptor` has an empty interface name.
    pub fn new(
        session: &Session,
        service: &str,
        path: &str,
        descriptor: &'static InterfaceDescriptor,
    ) -> Self {
        ProxyBuilder::new(session)
            .service(service)
            .path(path)
            .descriptor(descriptor)
            .build()
    }

    /// Creates a dynamic proxy. `interface` may be empty.
    pub fn new_dynamic(session: &Session, service: &str, path: &str, interface: &str) -> Self {
        ProxyBuilder::new(session)
            .service(service)
            .path(path)
            .interface(interface)
            .build()
    }

    pub fn builder(session: &Session) -> ProxyBuilder {
        ProxyBuilder::new(session)
    }

    /// Returns `true` if the remote object can currently be reached.
    ///
    /// On a message bus this means that the service currently has an owner. On a peer
    /// connection, where there are no owners, it means that the proxy was constructed with a
    /// well-formed service, path and interface.
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    /// Returns `true` if the proxy was created without an [`InterfaceDescriptor`].
    pub fn is_dynamic(&self) -> bool {
        self.inner.is_dynamic
    }

    /// Returns the unique name of the connection currently owning the service, or an empty
    /// string if it is unowned or not tracked.
    pub fn owner(&self) -> String {
        lock(&self.inner.state).current_owner.clone()
    }

    /// Returns the error left behind by the last operation, or the "no error" sentinel.
    pub fn last_error(&self) -> BusError {
        self.inner.last_error()
    }

    /// Returns the call timeout in milliseconds. `-1` stands for the connection's default.
    pub fn timeout(&self) -> i32 {
        self.inner.timeout()
    }

    pub fn set_timeout(&self, timeout: i32) {
        self.inner.timeout.store(timeout, Ordering::Relaxed);
    }

    /// Returns whether asynchronous calls let the callee prompt the user for authorization.
    pub fn is_interactive_authorization_allowed(&self) -> bool {
        self.inner.interactive.load(Ordering::Relaxed)
    }

    pub fn set_interactive_authorization_allowed(&self, allowed: bool) {
        self.inner.interactive.store(allowed, Ordering::Relaxed);
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Returns the [`Scheduler`] this proxy posts its deferred work to.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }
}

impl Reflectable for Proxy {
    fn descriptor(&self) -> &InterfaceDescriptor {
        self.inner.descriptor
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.inner.service)
            .field("path", &self.inner.path)
            .field("interface", &self.inner.interface)
            .field("dynamic", &self.inner.is_dynamic)
            .finish()
    }
}

impl Inner {
    fn conn(&self) -> &dyn Connection {
        &**self.session.connection()
    }

    fn is_valid(&self) -> bool {
        if self.conn().is_peer() {
            self.is_valid
        } else {
            !lock(&self.state).current_owner.is_empty()
        }
    }

    fn last_error(&self) -> BusError {
        lock(&self.state).last_error.clone()
    }

    fn set_last_error(&self, error: BusError) {
        lock(&self.state).last_error = error;
    }

    fn timeout(&self) -> i32 {
        self.timeout.load(Ordering::Relaxed)
    }

    /// Re-checks the fields that were allowed to be left empty at construction.
    fn can_make_calls(&self) -> bool {
        let checked = if self.service.is_empty() && !self.conn().is_peer() {
            names::check_bus_name(&self.service, EmptyPolicy::NotAllowed)
        } else if self.path.is_empty() {
            names::check_object_path(&self.path, EmptyPolicy::NotAllowed)
        } else {
            Ok(())
        };

        match checked {
            Ok(()) => true,
            Err(e) => {
                self.set_last_error(e);
                false
            }
        }
    }

    /// The gate in front of every remote operation.
    ///
    /// Only the validation done at construction counts. A service without an owner is still
    /// called, since the bus may activate it.
    fn ready(&self) -> bool {
        self.is_valid && self.can_make_calls()
    }

    fn method_call(&self, method: &str, arguments: Vec<Argument>) -> Message {
        let mut msg = Message::method_call(&self.service, &self.path, &self.interface, method);
        msg.set_arguments(arguments);
        msg.set_flag(MessageFlags::PARAMETERS_VALIDATED, true);
        msg
    }
}

/// Configures and creates a [`Proxy`].
///
/// ```no_run
/// # use busproxy::{Proxy, Session};
/// # pollster::block_on(async {
/// let session = Session::session().await?;
/// let proxy = Proxy::builder(&session)
///     .service("org.freedesktop.Notifications")
///     .path("/org/freedesktop/Notifications")
///     .interface("org.freedesktop.Notifications")
///     .timeout(2000)
///     .build();
/// # busproxy::Result::Ok(())
/// # });
/// ```
#[must_use]
pub struct ProxyBuilder {
    session: Session,
    service: String,
    path: String,
    interface: Option<String>,
    descriptor: Option<&'static InterfaceDescriptor>,
    timeout: i32,
    interactive: bool,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ProxyBuilder {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            service: String::new(),
            path: String::new(),
            interface: None,
            descriptor: None,
            timeout: -1,
            interactive: false,
            scheduler: None,
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the interface name. For static proxies this overrides the descriptor's name.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Makes the proxy static, described by `descriptor`.
    pub fn descriptor(mut self, descriptor: &'static InterfaceDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Sets the call timeout in milliseconds (`-1`, the default, uses the connection's).
    pub fn timeout(mut self, timeout: i32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interactive_authorization(mut self, allowed: bool) -> Self {
        self.interactive = allowed;
        self
    }

    /// Sets the [`Scheduler`] running the proxy's deferred work. Defaults to the session's
    /// [`WorkQueue`][crate::WorkQueue].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Creates the [`Proxy`].
    ///
    /// A malformed service, path or interface does not fail construction; the proxy is created
    /// invalid, with the problem recorded in [`Proxy::last_error`].
    ///
    /// # Panics
    ///
    /// Panics if a static proxy ends up with an empty interface name.
    pub fn build(self) -> Proxy {
        let is_dynamic = self.descriptor.is_none();
        let descriptor = self.descriptor.unwrap_or(&InterfaceDescriptor::DYNAMIC);
        let interface = self
            .interface
            .unwrap_or_else(|| descriptor.name.to_string());
        let conn = self.session.connection().clone();

        let (is_valid, mut last_error) = match names::check_if_valid(
            &self.service,
            &self.path,
            &interface,
            is_dynamic,
            conn.is_peer(),
        ) {
            Ok(()) => (true, BusError::none()),
            Err(e) => {
                log::debug!("invalid proxy for {}:{}: {}", self.service, self.path, e);
                (false, e)
            }
        };
        if is_valid && !conn.is_connected() {
            last_error = BusError::new(ErrorKind::Disconnected, "Not connected to D-Bus server");
        }

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => self.session.event_loop().clone(),
        };
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            service: self.service,
            path: self.path,
            interface,
            session: self.session,
            scheduler,
            descriptor,
            is_dynamic,
            is_valid,
            state: Mutex::new(State {
                last_error,
                current_owner: String::new(),
            }),
            timeout: AtomicI32::new(self.timeout),
            interactive: AtomicBool::new(self.interactive),
            signals: SignalHub::default(),
            owner_watch: Mutex::new(None),
        });
        log::debug!(
            "created proxy {} for {} at {}:{}",
            inner.id,
            inner.interface,
            inner.service,
            inner.path
        );

        inner.init_owner_tracking();
        Proxy { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interface::{MethodDescriptor, SignalDescriptor},
        testing::MockConnection,
    };

    pub(super) const NOTIFICATIONS: InterfaceDescriptor = InterfaceDescriptor {
        name: "org.freedesktop.Notifications",
        methods: &[
            MethodDescriptor::new("Notify", "susssasa{sv}i", "u").no_reply(),
            MethodDescriptor::new("GetServerInformation", "", "ssss"),
        ],
        signals: &[
            SignalDescriptor::new("NotificationClosed", "uu"),
            SignalDescriptor::new("ActionInvoked", "us"),
        ],
        properties: &[],
    };

    pub(super) fn session(conn: MockConnection) -> (Session, Arc<MockConnection>) {
        let conn = Arc::new(conn);
        (Session::from_connection(conn.clone()), conn)
    }

    #[test]
    fn dynamic_proxy_without_interface() {
        let (session, _) = session(MockConnection::bus().with_owner("com.x", ":1.7"));
        let proxy = Proxy::new_dynamic(&session, "com.x", "/p", "");
        assert!(proxy.is_valid());
        assert!(proxy.is_dynamic());
        assert!(!proxy.last_error().is_error());
        assert_eq!(proxy.owner(), ":1.7");
    }

    #[test]
    #[should_panic(expected = "cannot be empty")]
    fn static_proxy_without_interface() {
        const NAMELESS: InterfaceDescriptor = InterfaceDescriptor::DYNAMIC;
        let (session, _) = session(MockConnection::bus());
        let _ = Proxy::new(&session, "com.x", "/p", &NAMELESS);
    }

    #[test]
    fn malformed_identity() {
        let (session, conn) = session(MockConnection::bus());
        let proxy = Proxy::new_dynamic(&session, "com.x", "no/slash", "");
        assert!(!proxy.is_valid());
        assert_eq!(proxy.last_error().kind(), ErrorKind::InvalidArgument);
        assert_eq!(proxy.last_error().message(), "Invalid object path: no/slash");
        // Invalid proxies never watch anything.
        assert_eq!(conn.watcher_count(), 0);
    }

    #[test]
    fn disconnected() {
        let conn = MockConnection::bus();
        conn.set_connected(false);
        let (session, conn) = session(conn);
        let proxy = Proxy::new(&session, "com.x", "/p", &NOTIFICATIONS);
        assert_eq!(proxy.last_error().kind(), ErrorKind::Disconnected);
        assert_eq!(proxy.last_error().message(), "Not connected to D-Bus server");
        assert_eq!(conn.watcher_count(), 0);
    }

    #[test]
    fn peer_validity() {
        let (session, conn) = session(MockConnection::peer());
        let proxy = Proxy::new_dynamic(&session, "", "/p", "org.example.Iface");
        assert!(proxy.is_valid());
        assert_eq!(conn.watcher_count(), 0);

        let proxy = Proxy::new_dynamic(&session, "", "", "org.example.Iface");
        assert!(!proxy.is_valid());
    }

    #[test]
    fn wildcard_service_cannot_make_calls() {
        let (session, conn) = session(MockConnection::peer());
        // Static proxies may leave the path empty, but not call through it.
        let proxy = Proxy::new(&session, "", "", &NOTIFICATIONS);
        assert!(proxy.is_valid());

        let reply = proxy.call_method("GetServerInformation", Vec::new());
        assert!(reply.is_error());
        assert_eq!(proxy.last_error().message(), "Object path cannot be empty");
        assert!(conn.calls().is_empty());
    }

    #[test]
    fn builder_options() {
        let (session, _) = session(MockConnection::bus().with_owner("com.x", ":1.7"));
        let proxy = Proxy::builder(&session)
            .service("com.x")
            .path("/p")
            .descriptor(&NOTIFICATIONS)
            .interface("org.example.Renamed")
            .timeout(500)
            .interactive_authorization(true)
            .build();
        assert_eq!(proxy.interface(), "org.example.Renamed");
        assert_eq!(proxy.timeout(), 500);
        assert!(proxy.is_interactive_authorization_allowed());
        assert_eq!(proxy.property_descriptors().len(), 0);

        proxy.set_timeout(-1);
        proxy.set_interactive_authorization_allowed(false);
        assert_eq!(proxy.timeout(), -1);
        assert!(!proxy.is_interactive_authorization_allowed());
    }
}
