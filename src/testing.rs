//! An in-memory [`Connection`] for unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use zbus::zvariant::{OwnedValue, Value};

use crate::{
    connection::{
        Connection, OwnerChange, OwnerChangeHandler, RelayTarget, SignalRule, Subscription,
    },
    error::BusError,
    message::{Argument, CallMode, Message, MessageType},
    pending::{PendingCall, ReplyCallbacks},
    queue::lock,
};

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

type Responder = Box<dyn Fn(&Message) -> Option<Message> + Send + Sync>;
type Watchers = Arc<Mutex<Vec<(u64, String, Arc<dyn Fn(OwnerChange) + Send + Sync>)>>>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub message: Message,
    /// [`None`] for asynchronous and callback calls.
    pub mode: Option<CallMode>,
    pub timeout: i32,
}

/// Records everything proxies ask of it and plays a cooperative remote object.
///
/// `org.freedesktop.DBus.Properties` calls are served from an in-memory property store; other
/// calls get an empty reply unless a responder is installed.
pub struct MockConnection {
    peer: bool,
    connected: AtomicBool,
    accept_callbacks: AtomicBool,
    owners: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<RecordedCall>>,
    responder: Mutex<Option<Responder>>,
    properties: Mutex<HashMap<(String, String), OwnedValue>>,
    relays: Mutex<Vec<(SignalRule, RelayTarget)>>,
    dropped: Mutex<Vec<SignalRule>>,
    watchers: Watchers,
    next_watch: AtomicU64,
    /// Watcher count seen by each owner query.
    owner_queries: Mutex<Vec<usize>>,
}

impl MockConnection {
    fn new(peer: bool) -> Self {
        Self {
            peer,
            connected: AtomicBool::new(true),
            accept_callbacks: AtomicBool::new(true),
            owners: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            properties: Mutex::new(HashMap::new()),
            relays: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watch: AtomicU64::new(0),
            owner_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn bus() -> Self {
        Self::new(false)
    }

    pub fn peer() -> Self {
        Self::new(true)
    }

    pub fn with_owner(self, service: &str, owner: &str) -> Self {
        lock(&self.owners).insert(service.to_string(), owner.to_string());
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_accept_callbacks(&self, accept: bool) {
        self.accept_callbacks.store(accept, Ordering::SeqCst);
    }

    /// Installs a function answering calls. Returning [`None`] falls back to the default reply.
    pub fn set_responder(&self, f: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static) {
        *lock(&self.responder) = Some(Box::new(f));
    }

    /// Stores a property value as the remote object would hold it.
    pub fn set_remote_property<'a>(&self, interface: &str, name: &str, value: impl Into<Value<'a>>) {
        lock(&self.properties).insert(
            (interface.to_string(), name.to_string()),
            OwnedValue::from(value.into()),
        );
    }

    pub fn remote_property(&self, interface: &str, name: &str) -> Option<OwnedValue> {
        lock(&self.properties)
            .get(&(interface.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns how many owner watchers were registered at each owner query, in order.
    pub fn watchers_at_owner_queries(&self) -> Vec<usize> {
        lock(&self.owner_queries).clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        lock(&self.calls).last().cloned()
    }

    /// Returns the rules of all relays registered so far, in order.
    pub fn relays(&self) -> Vec<SignalRule> {
        lock(&self.relays).iter().map(|(rule, _)| rule.clone()).collect()
    }

    /// Returns the rules of all relays dropped so far, in order.
    pub fn dropped(&self) -> Vec<SignalRule> {
        lock(&self.dropped).clone()
    }

    pub fn watcher_count(&self) -> usize {
        lock(&self.watchers).len()
    }

    /// Delivers `change` to every owner watcher, whatever service it watches.
    pub fn broadcast_owner_change(&self, name: &str, old_owner: &str, new_owner: &str) {
        let handlers = lock(&self.watchers)
            .iter()
            .map(|(_, _, handler)| handler.clone())
            .collect::<Vec<_>>();
        for handler in handlers {
            handler(OwnerChange {
                name: name.to_string(),
                old_owner: old_owner.to_string(),
                new_owner: new_owner.to_string(),
            });
        }
    }

    /// Emits a signal from `service` to every live relay whose rule names `member`.
    pub fn emit_signal(&self, service: &str, member: &str, args: Vec<Argument>) {
        let targets = lock(&self.relays)
            .iter()
            .filter(|(rule, _)| rule.member == member)
            .map(|(rule, target)| (rule.clone(), target.clone()))
            .collect::<Vec<_>>();
        for (rule, target) in targets {
            if let Some(receiver) = target.receiver.upgrade() {
                receiver.deliver(Message::signal(
                    service,
                    &rule.path,
                    &rule.interface,
                    member,
                    args.clone(),
                ));
            }
        }
    }

    fn record(&self, message: &Message, mode: Option<CallMode>, timeout: i32) {
        lock(&self.calls).push(RecordedCall {
            message: message.clone(),
            mode,
            timeout,
        });
    }

    fn respond(&self, message: &Message) -> Message {
        if let Some(responder) = &*lock(&self.responder) {
            if let Some(reply) = responder(message) {
                return reply;
            }
        }

        if message.interface() == PROPERTIES {
            return self.serve_properties(message);
        }
        Message::reply(Vec::new())
    }

    fn serve_properties(&self, message: &Message) -> Message {
        let strings = message
            .arguments()
            .iter()
            .filter_map(Argument::value)
            .filter_map(|v| match &**v {
                Value::Str(s) => Some(s.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let [interface, name, ..] = strings.as_slice() else {
            return Message::error(BusError::remote(
                "org.freedesktop.DBus.Error.InvalidArgs",
                "expected interface and property name",
            ));
        };
        let key = (interface.clone(), name.clone());

        match message.member() {
            "Get" => match lock(&self.properties).get(&key) {
                Some(value) => Message::reply(vec![Argument::new(Value::Value(Box::new(
                    (**value).clone(),
                )))]),
                None => Message::error(BusError::remote(
                    "org.freedesktop.DBus.Error.UnknownProperty",
                    format!("No such property '{}'", name),
                )),
            },
            "Set" => match message.arguments().get(2).and_then(Argument::value) {
                Some(value) => {
                    let value = match &**value {
                        Value::Value(inner) => OwnedValue::from((**inner).clone()),
                        other => OwnedValue::from(other.clone()),
                    };
                    lock(&self.properties).insert(key, value);
                    Message::reply(Vec::new())
                }
                None => Message::error(BusError::remote(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    "missing value",
                )),
            },
            other => Message::error(BusError::remote(
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("Unknown method {}", other),
            )),
        }
    }
}

impl Connection for MockConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_peer(&self) -> bool {
        self.peer
    }

    fn name_owner(&self, service: &str) -> Result<String, BusError> {
        let watching = lock(&self.watchers).len();
        lock(&self.owner_queries).push(watching);
        lock(&self.owners).get(service).cloned().ok_or_else(|| {
            BusError::remote(
                "org.freedesktop.DBus.Error.NameHasNoOwner",
                format!("Could not get owner of name '{}': no such name", service),
            )
        })
    }

    fn watch_owner_changes(&self, service: &str, handler: OwnerChangeHandler) -> Subscription {
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        lock(&self.watchers).push((id, service.to_string(), Arc::from(handler)));

        let watchers = self.watchers.clone();
        Subscription::new(move || lock(&watchers).retain(|(i, _, _)| *i != id))
    }

    fn call(&self, message: Message, mode: CallMode, timeout: i32) -> Message {
        assert_ne!(mode, CallMode::AutoDetect, "connections never see AutoDetect");
        self.record(&message, Some(mode), timeout);

        let reply = self.respond(&message);
        match mode {
            CallMode::NoBlock if reply.message_type() != MessageType::Error => {
                Message::reply(Vec::new())
            }
            _ => reply,
        }
    }

    fn async_call(&self, message: Message, timeout: i32) -> PendingCall {
        self.record(&message, None, timeout);
        let reply = self.respond(&message);
        PendingCall::new(async move { reply })
    }

    fn call_with_callback(
        &self,
        message: Message,
        callbacks: ReplyCallbacks,
        timeout: i32,
    ) -> bool {
        if !self.accept_callbacks.load(Ordering::SeqCst) {
            return false;
        }
        self.record(&message, None, timeout);
        callbacks.deliver(self.respond(&message));
        true
    }

    fn connect_relay(&self, rule: &SignalRule, target: RelayTarget) {
        lock(&self.relays).push((rule.clone(), target));
    }

    fn disconnect_relay(&self, rule: &SignalRule, target: u64) {
        lock(&self.relays).retain(|(r, t)| !(r == rule && t.id == target));
        lock(&self.dropped).push(rule.clone());
    }
}
