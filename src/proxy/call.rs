use std::sync::{atomic::Ordering, Arc};

use crate::{
    error::BusError,
    message::{Argument, CallMode, Message, MessageFlags},
    pending::{PendingCall, ReplyCallbacks},
    queue::Scheduler,
};

use super::{Inner, Proxy};

impl Inner {
    /// Picks the blocking behavior for a method declared as `name`.
    ///
    /// Undeclared methods block. That is always safe for methods that reply, but a fire-and-forget
    /// method missing from an incomplete descriptor will wait for a reply that never comes.
    fn detect_mode(&self, name: &str) -> CallMode {
        match self.descriptor.method(name) {
            Some(method) if method.no_reply => CallMode::NoBlock,
            Some(_) => CallMode::Block,
            None => {
                log::trace!("{} is not declared by {}, blocking", name, self.interface);
                CallMode::Block
            }
        }
    }
}

impl Proxy {
    /// Calls `method` and waits for the reply as `mode` prescribes.
    ///
    /// `method` may carry a signature suffix after a `.` (`"Frob.su"`); only the part before it is
    /// matched against the declared methods by [`CallMode::AutoDetect`].
    ///
    /// The returned reply always has at least one argument: replies without any are padded with
    /// [`Argument::Empty`]. Errors, including those of the proxy itself, come back as error
    /// replies. [`Proxy::last_error`] is updated (and cleared on success) only when called on the
    /// thread running the proxy's [`Scheduler`].
    ///
    /// With [`CallMode::BlockWithEventLoop`], other queued work may run before this returns.
    pub fn call(&self, mode: CallMode, method: &str, args: Vec<Argument>) -> Message {
        let inner = &self.inner;
        if !inner.ready() {
            return Message::error(inner.last_error());
        }

        let mode = match mode {
            CallMode::AutoDetect => {
                let name = method.split_once('.').map_or(method, |(name, _)| name);
                inner.detect_mode(name)
            }
            mode => mode,
        };

        log::trace!(
            "calling {}.{} on {}{} ({:?})",
            inner.interface,
            method,
            inner.service,
            inner.path,
            mode
        );
        let message = inner.method_call(method, args);
        let mut reply = inner.conn().call(message, mode, inner.timeout());
        if inner.scheduler.is_current() {
            inner.set_last_error(BusError::from_reply(&reply));
        }

        if reply.arguments().is_empty() {
            reply.push_argument(Argument::Empty);
        }
        reply
    }

    /// Calls `method`, blocking unless it is declared as not expecting a reply.
    pub fn call_method(&self, method: &str, args: Vec<Argument>) -> Message {
        self.call(CallMode::AutoDetect, method, args)
    }

    /// Calls `method` without waiting for the reply.
    ///
    /// Errors are reported by the returned [`PendingCall`] only; [`Proxy::last_error`] is left
    /// alone.
    pub fn async_call(&self, method: &str, args: Vec<Argument>) -> PendingCall {
        let inner = &self.inner;
        if !inner.ready() {
            return PendingCall::from_error(inner.last_error());
        }

        let mut message = inner.method_call(method, args);
        message.set_flag(
            MessageFlags::ALLOW_INTERACTIVE_AUTHORIZATION,
            inner.interactive.load(Ordering::Relaxed),
        );
        log::trace!("async call to {}.{}", inner.interface, method);
        inner.conn().async_call(message, inner.timeout())
    }

    /// Calls `method` and runs `callbacks` on `receiver` once the reply arrives.
    ///
    /// Returns whether the call was sent, which says nothing about whether it will succeed.
    pub fn call_with_callback(
        &self,
        method: &str,
        args: Vec<Argument>,
        receiver: Arc<dyn Scheduler>,
        callbacks: ReplyCallbacks,
    ) -> bool {
        let inner = &self.inner;
        if !inner.ready() {
            return false;
        }

        let message = inner.method_call(method, args);
        inner.set_last_error(BusError::none());
        let relay = ReplyCallbacks::new(move |reply| {
            receiver.post(Box::new(move || callbacks.deliver(reply)));
        });
        inner.conn().call_with_callback(message, relay, inner.timeout())
    }
}
