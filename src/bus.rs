//! [`Connection`] implementation on top of `zbus`.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{mpsc, Arc, Mutex, Weak},
    thread,
    time::{Duration, Instant},
};

use futures_util::{
    future::{abortable, lazy, AbortHandle},
    FutureExt, StreamExt,
};
use zbus::{
    fdo::DBusProxy,
    names::{BusName, UniqueName},
    zvariant::{OwnedValue, Structure, StructureBuilder},
    MatchRule, MessageBuilder, MessageStream, MessageType as WireType,
};

use crate::{
    connection::{
        Connection, OwnerChange, OwnerChangeHandler, RelayTarget, SignalReceiver, SignalRule,
        Subscription,
    },
    error::{BusError, ErrorKind},
    message::{Argument, CallMode, Message, MessageFlags},
    pending::{PendingCall, ReplyCallbacks},
    queue::{lock, Scheduler, WorkQueue},
};

/// Timeout applied when a call asks for the default (`-1`).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

fn timeout_duration(timeout: i32) -> Duration {
    match u64::try_from(timeout) {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => DEFAULT_TIMEOUT,
    }
}

/// Runs `f` on a new helper thread.
fn spawn_thread<F>(name: &str, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(_) => true,
        Err(e) => {
            log::error!("failed to spawn {} thread: {}", name, e);
            false
        }
    }
}

/// Waits for the reply sent through `replies` until `deadline` passes.
///
/// With a `queue`, queued work keeps running in the meantime. The sender has to post a task
/// after sending to wake the queue up.
fn await_reply(
    replies: &mpsc::Receiver<Message>,
    deadline: Instant,
    queue: Option<&WorkQueue>,
) -> Option<Message> {
    match queue {
        Some(queue) => {
            let mut reply = None;
            queue.run_until(
                || {
                    if reply.is_none() {
                        reply = replies.try_recv().ok();
                    }
                    reply.is_some()
                },
                Some(deadline),
            );
            reply
        }
        None => replies
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
    }
}

/// Sends `wire` and blocks until the reply arrives or `timeout` passes.
///
/// The exchange runs on a helper thread, so the caller can give up on it.
fn send_and_wait(
    conn: zbus::Connection,
    wire: zbus::Message,
    timeout: i32,
    queue: Option<Arc<WorkQueue>>,
) -> Message {
    let (exchange, abort) = abortable(send_with_reply(conn, wire));
    let (tx, rx) = mpsc::channel();
    let waker = queue.clone();
    let started = spawn_thread("busproxy-call", move || {
        if let Ok(reply) = pollster::block_on(exchange) {
            // The receiver is gone once the caller timed out.
            if tx.send(reply).is_ok() {
                if let Some(queue) = waker {
                    queue.post(Box::new(|| {}));
                }
            }
        }
    });
    if !started {
        return Message::error(BusError::new(ErrorKind::Failed, "Failed to send message"));
    }

    let deadline = Instant::now() + timeout_duration(timeout);
    await_reply(&rx, deadline, queue.as_deref()).unwrap_or_else(|| {
        abort.abort();
        Message::error(BusError::new(
            ErrorKind::NoReply,
            "Did not receive a reply before the timeout expired",
        ))
    })
}

/// A [`Connection`] to a D-Bus message bus or peer, backed by a [`zbus::Connection`].
///
/// Every call is bounded by its timeout. Exchanges run on short-lived helper threads so that the
/// caller can give up on them, and so that [`CallMode::BlockWithEventLoop`] can keep running the
/// attached [`WorkQueue`]. Owner watches and signal relays run on the connection's executor,
/// which zbus drives on its own thread unless the connection was built without one.
pub struct BusConnection {
    conn: zbus::Connection,
    peer: bool,
    event_loop: Option<Arc<WorkQueue>>,
    relays: Mutex<HashMap<(SignalRule, u64), AbortHandle>>,
}

impl BusConnection {
    /// Opens a connection to the system bus.
    pub async fn system() -> crate::Result<Self> {
        let conn = zbus::Connection::system()
            .await
            .map_err(crate::Error::from)?;
        Ok(Self::bus(conn))
    }

    /// Opens a connection to the session bus of the current user.
    pub async fn session() -> crate::Result<Self> {
        let conn = zbus::Connection::session()
            .await
            .map_err(crate::Error::from)?;
        Ok(Self::bus(conn))
    }

    /// Wraps an existing connection to a message bus.
    pub fn bus(conn: zbus::Connection) -> Self {
        Self::new(conn, false)
    }

    /// Wraps an existing peer-to-peer connection.
    pub fn peer(conn: zbus::Connection) -> Self {
        Self::new(conn, true)
    }

    fn new(conn: zbus::Connection, peer: bool) -> Self {
        log::debug!(
            "using {} connection {}",
            if peer { "peer" } else { "bus" },
            conn.server_guid()
        );
        Self {
            conn,
            peer,
            event_loop: None,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches the [`WorkQueue`] that [`CallMode::BlockWithEventLoop`] keeps running.
    ///
    /// Without one, that mode behaves like [`CallMode::Block`].
    pub fn with_event_loop(mut self, queue: Arc<WorkQueue>) -> Self {
        self.event_loop = Some(queue);
        self
    }

    /// Returns the underlying `zbus` connection.
    pub fn inner(&self) -> &zbus::Connection {
        &self.conn
    }

    /// Runs a long-lived `task` until it finishes or is aborted.
    #[cfg(not(feature = "tokio"))]
    fn spawn_task<F>(&self, name: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.conn.executor().spawn(task, name).detach();
        true
    }

    /// Runs a long-lived `task` until it finishes or is aborted.
    ///
    /// zbus spawns onto the ambient tokio runtime, which the calling thread may lack, so the task
    /// gets a helper thread instead.
    #[cfg(feature = "tokio")]
    fn spawn_task<F>(&self, name: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_thread(name, move || pollster::block_on(task))
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        for (_, relay) in lock(&self.relays).drain() {
            relay.abort();
        }
    }
}

impl fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("guid", &self.conn.server_guid())
            .field("peer", &self.peer)
            .field("relays", &lock(&self.relays).len())
            .finish()
    }
}

impl Connection for BusConnection {
    fn is_connected(&self) -> bool {
        // zbus connections cannot be closed while a handle to them exists.
        true
    }

    fn is_peer(&self) -> bool {
        self.peer
    }

    fn name_owner(&self, service: &str) -> Result<String, BusError> {
        let name = BusName::try_from(service)
            .map_err(|e| BusError::new(ErrorKind::InvalidArgument, e.to_string()))?;
        pollster::block_on(async {
            let proxy = DBusProxy::new(&self.conn)
                .await
                .map_err(|e| BusError::from_zbus(&e))?;
            let owner = proxy
                .get_name_owner(name)
                .await
                .map_err(|e| BusError::from_fdo(&e))?;
            Ok(owner.to_string())
        })
    }

    fn watch_owner_changes(&self, service: &str, handler: OwnerChangeHandler) -> Subscription {
        // The match rule must be in place before the caller queries the current owner.
        let subscribed = pollster::block_on(async {
            DBusProxy::new(&self.conn)
                .await?
                .receive_name_owner_changed_with_args(&[(0, service)])
                .await
        });
        let mut changes = match subscribed {
            Ok(changes) => changes,
            Err(e) => {
                log::warn!("cannot watch the owner of {}: {}", service, e);
                return Subscription::noop();
            }
        };

        let service = service.to_string();
        let (watch, abort) = abortable(async move {
            while let Some(signal) = changes.next().await {
                let args = match signal.args() {
                    Ok(args) => args,
                    Err(e) => {
                        log::warn!("malformed NameOwnerChanged signal: {}", e);
                        continue;
                    }
                };
                if args.name.as_str() != service {
                    continue;
                }
                handler(OwnerChange {
                    name: args.name.to_string(),
                    old_owner: owner_name(&args.old_owner),
                    new_owner: owner_name(&args.new_owner),
                });
            }
        });

        if self.spawn_task("busproxy-owner", watch.map(drop)) {
            Subscription::new(move || abort.abort())
        } else {
            Subscription::noop()
        }
    }

    fn call(&self, message: Message, mode: CallMode, timeout: i32) -> Message {
        let mut message = message;
        if mode == CallMode::NoBlock {
            message.set_flag(MessageFlags::NO_REPLY_EXPECTED, true);
        }
        let wire = match to_wire(&message) {
            Ok(wire) => wire,
            Err(e) => return Message::error(BusError::from_zbus(&e)),
        };

        log::trace!(
            "{:?} call to {}.{} on {}",
            mode,
            message.interface(),
            message.member(),
            message.service()
        );
        match mode {
            CallMode::NoBlock => match pollster::block_on(self.conn.send_message(wire)) {
                Ok(_) => Message::reply(Vec::new()),
                Err(e) => Message::error(BusError::from_zbus(&e)),
            },
            CallMode::BlockWithEventLoop => {
                let queue = self
                    .event_loop
                    .as_ref()
                    .filter(|queue| queue.is_current())
                    .cloned();
                send_and_wait(self.conn.clone(), wire, timeout, queue)
            }
            CallMode::Block | CallMode::AutoDetect => {
                send_and_wait(self.conn.clone(), wire, timeout, None)
            }
        }
    }

    fn async_call(&self, message: Message, timeout: i32) -> PendingCall {
        let wire = match to_wire(&message) {
            Ok(wire) => wire,
            Err(e) => return PendingCall::from_error(BusError::from_zbus(&e)),
        };

        let conn = self.conn.clone();
        let (reply, handle) =
            lazy(move |_| send_and_wait(conn, wire, timeout, None)).remote_handle();
        if spawn_thread("busproxy-async-call", move || pollster::block_on(reply)) {
            PendingCall::new(handle)
        } else {
            PendingCall::from_error(BusError::new(ErrorKind::Failed, "Failed to send message"))
        }
    }

    fn call_with_callback(
        &self,
        message: Message,
        callbacks: ReplyCallbacks,
        timeout: i32,
    ) -> bool {
        let wire = match to_wire(&message) {
            Ok(wire) => wire,
            Err(e) => {
                log::warn!("cannot send {}: {}", message.member(), e);
                return false;
            }
        };

        let conn = self.conn.clone();
        spawn_thread("busproxy-callback", move || {
            callbacks.deliver(send_and_wait(conn, wire, timeout, None));
        })
    }

    fn connect_relay(&self, rule: &SignalRule, target: RelayTarget) {
        let key = (rule.clone(), target.id);
        let mut relays = lock(&self.relays);
        if relays.contains_key(&key) {
            return;
        }

        let match_rule = match match_rule(rule) {
            Ok(match_rule) => match_rule,
            Err(e) => {
                log::warn!("cannot relay {}: {}", rule, e);
                return;
            }
        };

        log::debug!("relaying {} to target {}", rule, target.id);
        let (relay, abort) = abortable(relay_signals(
            self.conn.clone(),
            match_rule,
            target.receiver,
        ));
        if self.spawn_task("busproxy-relay", relay.map(drop)) {
            relays.insert(key, abort);
        }
    }

    fn disconnect_relay(&self, rule: &SignalRule, target: u64) {
        if let Some(relay) = lock(&self.relays).remove(&(rule.clone(), target)) {
            log::debug!("dropping relay of {} to target {}", rule, target);
            relay.abort();
        }
    }
}

fn owner_name(owner: &Option<UniqueName<'_>>) -> String {
    match owner {
        Some(owner) => owner.to_string(),
        None => String::new(),
    }
}

fn to_wire(message: &Message) -> zbus::Result<zbus::Message> {
    let mut builder = MessageBuilder::method_call(message.path(), message.member())?;
    if !message.service().is_empty() {
        builder = builder.destination(message.service())?;
    }
    if !message.interface().is_empty() {
        builder = builder.interface(message.interface())?;
    }
    if message.flags().contains(MessageFlags::NO_REPLY_EXPECTED) {
        builder = builder.with_flags(zbus::MessageFlags::NoReplyExpected)?;
    }
    if message
        .flags()
        .contains(MessageFlags::ALLOW_INTERACTIVE_AUTHORIZATION)
    {
        builder = builder.with_flags(zbus::MessageFlags::AllowInteractiveAuth)?;
    }

    let values = message
        .arguments()
        .iter()
        .filter_map(Argument::value)
        .collect::<Vec<_>>();
    if values.is_empty() {
        return builder.build(&());
    }

    let mut body = StructureBuilder::new();
    for value in values {
        body = body.append_field((**value).clone());
    }
    builder.build(&body.build())
}

fn arguments_from_wire(wire: &zbus::Message) -> zbus::Result<Vec<Argument>> {
    let signature = match wire.body_signature() {
        Ok(signature) => signature.to_string(),
        Err(zbus::Error::NoBodySignature) => String::new(),
        Err(e) => return Err(e),
    };
    if signature.is_empty() {
        return Ok(Vec::new());
    }

    let body = wire.body::<Structure<'_>>()?;
    Ok(body
        .fields()
        .iter()
        .map(|field| Argument::from(OwnedValue::from(field.clone())))
        .collect())
}

fn reply_from_wire(wire: &zbus::Message) -> zbus::Result<Message> {
    if wire.message_type() == WireType::Error {
        let header = wire.header()?;
        let name = match header.error_name()? {
            Some(name) => name.to_string(),
            None => "org.freedesktop.DBus.Error.Failed".to_string(),
        };
        let text = wire.body::<String>().unwrap_or_default();
        return Ok(Message::error(BusError::remote(name, text)));
    }

    Ok(Message::reply(arguments_from_wire(wire)?))
}

fn signal_from_wire(wire: &zbus::Message) -> zbus::Result<Message> {
    let header = wire.header()?;
    let sender = header.sender()?.map(|s| s.to_string()).unwrap_or_default();
    let path = header.path()?.map(|p| p.to_string()).unwrap_or_default();
    let interface = header
        .interface()?
        .map(|i| i.to_string())
        .unwrap_or_default();
    let member = header.member()?.map(|m| m.to_string()).unwrap_or_default();
    Ok(Message::signal(
        &sender,
        &path,
        &interface,
        &member,
        arguments_from_wire(wire)?,
    ))
}

async fn exchange(conn: &zbus::Connection, wire: zbus::Message) -> zbus::Result<Message> {
    // Subscribe before sending, or a fast reply could be missed.
    let mut stream = MessageStream::from(conn);
    let serial = conn.send_message(wire).await?;

    while let Some(incoming) = stream.next().await {
        let incoming = incoming?;
        if incoming.header()?.reply_serial()? == Some(serial) {
            return reply_from_wire(&incoming);
        }
    }

    Ok(Message::error(BusError::new(
        ErrorKind::Disconnected,
        "Connection closed before the reply arrived",
    )))
}

async fn send_with_reply(conn: zbus::Connection, wire: zbus::Message) -> Message {
    match exchange(&conn, wire).await {
        Ok(reply) => reply,
        Err(e) => Message::error(BusError::from_zbus(&e)),
    }
}

fn match_rule(rule: &SignalRule) -> zbus::Result<MatchRule<'static>> {
    let mut builder = MatchRule::builder().msg_type(WireType::Signal);
    if !rule.service.is_empty() {
        builder = builder.sender(rule.service.clone())?;
    }
    if !rule.path.is_empty() {
        builder = builder.path(rule.path.clone())?;
    }
    if !rule.interface.is_empty() {
        builder = builder.interface(rule.interface.clone())?;
    }
    if !rule.member.is_empty() {
        builder = builder.member(rule.member.clone())?;
    }
    Ok(builder.build())
}

async fn relay_signals(
    conn: zbus::Connection,
    rule: MatchRule<'static>,
    receiver: Weak<dyn SignalReceiver>,
) {
    let description = rule.to_string();
    let mut stream = match MessageStream::for_match_rule(rule, &conn, None).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("failed to subscribe to '{}': {}", description, e);
            return;
        }
    };

    while let Some(signal) = stream.next().await {
        let Some(receiver) = receiver.upgrade() else {
            return;
        };
        match signal.and_then(|signal| signal_from_wire(&signal)) {
            Ok(signal) => receiver.deliver(signal),
            Err(e) => log::warn!("dropping malformed signal for '{}': {}", description, e),
        }
    }
}
