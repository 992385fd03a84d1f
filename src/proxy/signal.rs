use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::{
    connection::{RelayTarget, SignalReceiver, SignalRule},
    error::{BusError, ErrorKind},
    message::Message,
    names,
    queue::lock,
};

use super::{Inner, Proxy};

/// Identifies a handler registered with [`Proxy::connect_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandlerId(u64);

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Local subscriptions to the signals of one proxy.
#[derive(Default)]
pub(super) struct SignalHub {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    /// Signals currently relayed by the connection.
    relayed: Mutex<HashSet<String>>,
    destroyed: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl SignalHub {
    fn insert(&self, signal: &str, handler: Handler) -> SignalHandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers)
            .entry(signal.to_string())
            .or_default()
            .push((id, handler));
        SignalHandlerId(id)
    }

    /// Removes a handler, returning the signal it was connected to.
    fn remove(&self, id: SignalHandlerId) -> Option<String> {
        let mut handlers = lock(&self.handlers);
        let (signal, list) = handlers
            .iter_mut()
            .find(|(_, list)| list.iter().any(|(i, _)| *i == id.0))?;
        list.retain(|(i, _)| *i != id.0);
        let signal = signal.clone();
        if list.is_empty() {
            handlers.remove(&signal);
        }
        Some(signal)
    }

    fn subscribers(&self, signal: &str) -> usize {
        lock(&self.handlers).get(signal).map_or(0, Vec::len)
    }

    fn handlers_for(&self, signal: &str) -> Vec<Handler> {
        lock(&self.handlers)
            .get(signal)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// A disconnect notification waiting for the proxy's scheduler.
///
/// Processing happens on a later turn so that it never runs while the code that removed the
/// handler is still on the stack.
struct PendingSignalRelay {
    proxy: Weak<Inner>,
    /// [`None`] for "all signals".
    signal: Option<String>,
}

impl PendingSignalRelay {
    fn process(self) {
        if let Some(inner) = self.proxy.upgrade() {
            inner.finish_disconnect_notify(self.signal.as_deref());
        }
    }
}

impl Inner {
    fn relay_rule(&self, signal: &str) -> SignalRule {
        SignalRule {
            service: self.service.clone(),
            path: self.path.clone(),
            interface: self.interface.clone(),
            member: signal.to_string(),
        }
    }

    fn connect_notify(&self, signal: &str) {
        if !self.is_valid {
            return;
        }
        if !lock(&self.signals.relayed).insert(signal.to_string()) {
            return;
        }

        let receiver: Weak<dyn SignalReceiver> = self.this.clone();
        self.conn().connect_relay(
            &self.relay_rule(signal),
            RelayTarget {
                id: self.id,
                receiver,
            },
        );
    }

    fn disconnect_notify(&self, signal: Option<&str>) {
        if !self.is_valid {
            return;
        }

        let pending = PendingSignalRelay {
            proxy: self.this.clone(),
            signal: signal.map(str::to_string),
        };
        self.scheduler.post(Box::new(move || pending.process()));
    }

    fn drop_relay(&self, signal: &str) {
        if lock(&self.signals.relayed).remove(signal) {
            self.conn().disconnect_relay(&self.relay_rule(signal), self.id);
        }
    }

    fn finish_disconnect_notify(&self, signal: Option<&str>) {
        if !self.conn().is_connected() {
            return;
        }

        match signal {
            Some(signal) => {
                if self.signals.subscribers(signal) == 0 {
                    self.drop_relay(signal);
                }
            }
            None => {
                let mut candidates = self
                    .descriptor
                    .signals
                    .iter()
                    .map(|s| s.name.to_string())
                    .collect::<BTreeSet<_>>();
                candidates.extend(lock(&self.signals.relayed).iter().cloned());

                for signal in candidates {
                    if self.signals.subscribers(&signal) == 0 {
                        self.drop_relay(&signal);
                    }
                }
            }
        }
    }
}

impl SignalReceiver for Inner {
    fn deliver(&self, signal: Message) {
        let this = self.this.clone();
        self.scheduler.post(Box::new(move || {
            if let Some(inner) = this.upgrade() {
                for handler in inner.signals.handlers_for(signal.member()) {
                    handler(&signal);
                }
            }
        }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.is_valid {
            let relayed = std::mem::take(&mut *lock(&self.signals.relayed));
            for signal in relayed {
                self.conn().disconnect_relay(&self.relay_rule(&signal), self.id);
            }
        }

        for destroyed in std::mem::take(&mut *lock(&self.signals.destroyed)) {
            destroyed();
        }
        log::debug!("dropped proxy {}", self.id);
    }
}

impl Proxy {
    /// Calls `handler` for every `signal` the remote object emits.
    ///
    /// Handlers run on the proxy's [`Scheduler`][crate::Scheduler]. Static proxies only accept
    /// declared signals. Returns [`None`] and records the reason in [`Proxy::last_error`] if
    /// `signal` is rejected.
    pub fn connect_signal<F>(&self, signal: &str, handler: F) -> Option<SignalHandlerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        if let Err(e) = names::check_member_name(signal) {
            inner.set_last_error(e);
            return None;
        }
        if !inner.is_dynamic && inner.descriptor.signal(signal).is_none() {
            inner.set_last_error(BusError::new(
                ErrorKind::InvalidArgument,
                format!("No such signal '{}'", signal),
            ));
            return None;
        }

        let id = inner.signals.insert(signal, Arc::new(handler));
        inner.connect_notify(signal);
        Some(id)
    }

    /// Removes a handler. Returns `false` if it was not connected.
    ///
    /// The remote subscription is dropped on a later turn of the proxy's
    /// [`Scheduler`][crate::Scheduler], once no handler for the signal is left.
    pub fn disconnect_signal(&self, id: SignalHandlerId) -> bool {
        match self.inner.signals.remove(id) {
            Some(signal) => {
                self.inner.disconnect_notify(Some(&signal));
                true
            }
            None => false,
        }
    }

    /// Removes all signal handlers.
    pub fn disconnect_all_signals(&self) {
        lock(&self.inner.signals.handlers).clear();
        self.inner.disconnect_notify(None);
    }

    /// Returns `true` if at least one handler is connected to `signal`.
    pub fn is_signal_connected(&self, signal: &str) -> bool {
        self.inner.signals.subscribers(signal) > 0
    }

    /// Calls `f` when the last handle to this proxy is dropped. Never involves the remote object.
    pub fn on_destroyed(&self, f: impl FnOnce() + Send + 'static) {
        lock(&self.inner.signals.destroyed).push(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::super::{
        tests::{session, NOTIFICATIONS},
        Proxy,
    };
    use crate::{
        connection::SignalRule,
        error::ErrorKind,
        message::Argument,
        testing::MockConnection,
        Session,
    };

    fn notifications() -> (Session, Proxy, Arc<MockConnection>) {
        let (session, conn) = session(MockConnection::bus().with_owner("com.x", ":1.7"));
        let proxy = Proxy::new(&session, "com.x", "/p", &NOTIFICATIONS);
        (session, proxy, conn)
    }

    fn rule(member: &str) -> SignalRule {
        SignalRule {
            service: "com.x".into(),
            path: "/p".into(),
            interface: "org.freedesktop.Notifications".into(),
            member: member.into(),
        }
    }

    #[test]
    fn relays_once_per_signal() {
        let (_, proxy, conn) = notifications();
        proxy.connect_signal("NotificationClosed", |_| {}).unwrap();
        proxy.connect_signal("NotificationClosed", |_| {}).unwrap();
        assert_eq!(conn.relays(), [rule("NotificationClosed")]);
        assert!(proxy.is_signal_connected("NotificationClosed"));
        assert!(!proxy.is_signal_connected("ActionInvoked"));
    }

    #[test]
    fn rejects_unknown_signals() {
        let (_, proxy, conn) = notifications();
        assert!(proxy.connect_signal("Bogus", |_| {}).is_none());
        assert_eq!(proxy.last_error().message(), "No such signal 'Bogus'");
        assert!(proxy.connect_signal("Not.Valid", |_| {}).is_none());
        assert_eq!(proxy.last_error().kind(), ErrorKind::InvalidArgument);
        assert!(conn.relays().is_empty());
    }

    #[test]
    fn deferred_drop() {
        let (session, proxy, conn) = notifications();
        let first = proxy.connect_signal("NotificationClosed", |_| {}).unwrap();
        let second = proxy.connect_signal("NotificationClosed", |_| {}).unwrap();

        // Another listener remains.
        assert!(proxy.disconnect_signal(first));
        session.event_loop().run_pending();
        assert!(conn.dropped().is_empty());

        assert!(proxy.disconnect_signal(second));
        assert!(!proxy.disconnect_signal(second));
        // Nothing happens until the queue runs.
        assert!(conn.dropped().is_empty());
        session.event_loop().run_pending();
        assert_eq!(conn.dropped(), [rule("NotificationClosed")]);
        assert!(conn.relays().is_empty());
    }

    #[test]
    fn reconnect_before_deferred_drop() {
        let (session, proxy, conn) = notifications();
        let id = proxy.connect_signal("ActionInvoked", |_| {}).unwrap();
        proxy.disconnect_signal(id);
        proxy.connect_signal("ActionInvoked", |_| {}).unwrap();

        session.event_loop().run_pending();
        assert!(conn.dropped().is_empty());
        assert_eq!(conn.relays(), [rule("ActionInvoked")]);
    }

    #[test]
    fn wildcard_drop() {
        let (session, proxy, conn) = notifications();
        proxy.connect_signal("NotificationClosed", |_| {}).unwrap();
        proxy.connect_signal("ActionInvoked", |_| {}).unwrap();

        proxy.disconnect_all_signals();
        assert!(!proxy.is_signal_connected("ActionInvoked"));
        session.event_loop().run_pending();

        let mut dropped = conn
            .dropped()
            .into_iter()
            .map(|r| r.member)
            .collect::<Vec<_>>();
        dropped.sort();
        assert_eq!(dropped, ["ActionInvoked", "NotificationClosed"]);
    }

    #[test]
    fn drop_skipped_when_disconnected() {
        let (session, proxy, conn) = notifications();
        let id = proxy.connect_signal("NotificationClosed", |_| {}).unwrap();
        proxy.disconnect_signal(id);
        conn.set_connected(false);
        session.event_loop().run_pending();
        assert!(conn.dropped().is_empty());
    }

    #[test]
    fn invalid_proxies_do_not_relay() {
        let (session, conn) = session(MockConnection::bus());
        let proxy = Proxy::new_dynamic(&session, "com.x", "bad path", "");
        let id = proxy.connect_signal("Anything", |_| {}).unwrap();
        assert!(conn.relays().is_empty());

        proxy.disconnect_signal(id);
        assert_eq!(session.event_loop().run_pending(), 0);
    }

    #[test]
    fn signals_reach_handlers_on_the_queue() {
        let (session, proxy, conn) = notifications();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        proxy
            .connect_signal("NotificationClosed", move |msg| {
                s.lock().unwrap().push(msg.signature());
            })
            .unwrap();

        conn.emit_signal(
            ":1.7",
            "NotificationClosed",
            vec![Argument::new(4u32), Argument::new(2u32)],
        );
        assert!(seen.lock().unwrap().is_empty());
        session.event_loop().run_pending();
        assert_eq!(*seen.lock().unwrap(), ["uu"]);
    }

    #[test]
    fn dropping_the_proxy() {
        let (session, proxy, conn) = notifications();
        let destroyed = Arc::new(AtomicUsize::new(0));

        let d = destroyed.clone();
        proxy.on_destroyed(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        proxy.connect_signal("ActionInvoked", |_| {}).unwrap();
        // The destroyed notification is never relayed.
        assert_eq!(conn.relays(), [rule("ActionInvoked")]);

        // Pending deferred work must not resurrect the proxy.
        proxy.disconnect_all_signals();
        drop(proxy);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(conn.dropped(), [rule("ActionInvoked")]);

        session.event_loop().run_pending();
        assert_eq!(conn.dropped().len(), 1);
    }
}
