//! Replies that have not arrived yet.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{error::BusError, message::Message};

/// The reply to an asynchronous call.
///
/// A [`PendingCall`] is a [`Future`] resolving to the reply [`Message`], which may be an error
/// reply. It can be dropped at any time to abandon the call.
pub struct PendingCall {
    state: State,
}

enum State {
    Ready(Option<Message>),
    Waiting(BoxFuture<'static, Message>),
}

impl PendingCall {
    /// Creates a [`PendingCall`] that resolves once `reply` does.
    pub fn new<F>(reply: F) -> Self
    where
        F: Future<Output = Message> + Send + 'static,
    {
        Self {
            state: State::Waiting(reply.boxed()),
        }
    }

    /// Creates a [`PendingCall`] that is already finished.
    pub fn from_reply(reply: Message) -> Self {
        Self {
            state: State::Ready(Some(reply)),
        }
    }

    /// Creates a [`PendingCall`] that is already finished with an error.
    pub fn from_error(error: BusError) -> Self {
        Self::from_reply(Message::error(error))
    }

    /// Returns `true` if the reply is known to be available without waiting.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Ready(Some(_)))
    }

    /// Blocks the calling thread until the reply arrives.
    pub fn wait(self) -> Message {
        pollster::block_on(self)
    }
}

impl Future for PendingCall {
    type Output = Message;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Message> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(reply) => match reply.take() {
                Some(reply) => Poll::Ready(reply),
                None => panic!("`PendingCall` polled after completion"),
            },
            State::Waiting(fut) => match fut.poll_unpin(cx) {
                Poll::Ready(reply) => {
                    this.state = State::Ready(None);
                    Poll::Ready(reply)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("finished", &self.is_finished())
            .finish()
    }
}

type ReplyHandler = Box<dyn FnOnce(Message) + Send>;
type ErrorHandler = Box<dyn FnOnce(BusError) + Send>;

/// Handlers invoked with the outcome of
/// [`Proxy::call_with_callback`][crate::Proxy::call_with_callback].
///
/// Exactly one of the handlers runs. Without an error handler, error replies are passed to the
/// reply handler like any other reply.
pub struct ReplyCallbacks {
    on_reply: ReplyHandler,
    on_error: Option<ErrorHandler>,
}

impl ReplyCallbacks {
    pub fn new(on_reply: impl FnOnce(Message) + Send + 'static) -> Self {
        Self {
            on_reply: Box::new(on_reply),
            on_error: None,
        }
    }

    pub fn with_error_handler(mut self, on_error: impl FnOnce(BusError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Hands `reply` to the matching handler.
    pub fn deliver(self, reply: Message) {
        match self.on_error {
            Some(on_error) if reply.is_error() => on_error(BusError::from_reply(&reply)),
            _ => (self.on_reply)(reply),
        }
    }
}

impl fmt::Debug for ReplyCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyCallbacks")
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}
