//! Open channels - long-lived bidirectional conversations with one context.
//!
//! Each [`Channel::send`] hands the context a fresh [`ReplyPort`] together
//! with the payload, and the returned [`Reply`] resolves with whatever is
//! answered on that port. Replies never travel over the main signal path,
//! so concurrent round trips cannot pick up each other's answers even when
//! the context replies out of order.
//!
//! Data the context posts on its own (without a port) is queued and can be
//! read with [`Channel::recv`].
//!
//! [`ReplyPort`]: crate::context::ReplyPort

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::context::Payload;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::operation::OperationId;

/// Handle to an open channel.
pub struct Channel {
    id: OperationId,
    name: String,
    dispatcher: Dispatcher,
    inbox: mpsc::UnboundedReceiver<Payload>,
}

impl Channel {
    pub(crate) fn new(
        id: OperationId,
        name: String,
        dispatcher: Dispatcher,
        inbox: mpsc::UnboundedReceiver<Payload>,
    ) -> Self {
        Self {
            id,
            name,
            dispatcher,
            inbox,
        }
    }

    /// Id of the channel's operation.
    #[inline]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Name of the worker behind this channel.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the channel's context is still live.
    pub fn is_open(&self) -> bool {
        self.dispatcher.is_active(self.id)
    }

    /// Send a payload and wait for the context's reply to it.
    ///
    /// Resolves with `Terminated` if the channel is already closed, or with
    /// `NoReply` if the context goes away without answering.
    pub fn send(&self, payload: Payload) -> Reply {
        self.dispatcher.round_trip(self.id, payload)
    }

    /// Wait for the next message the context posted without a reply port.
    ///
    /// Returns `None` once the channel is closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.inbox.recv().await
    }

    /// Tear down the context and remove the channel.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn terminate(&self) -> bool {
        self.dispatcher.terminate(self.id)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Result of a single channel round trip.
#[must_use = "a Reply does nothing unless awaited"]
pub struct Reply {
    /// `None` when the channel was closed before the request went out.
    rx: Option<oneshot::Receiver<Payload>>,
}

impl Reply {
    pub(crate) fn new(rx: oneshot::Receiver<Payload>) -> Self {
        Self { rx: Some(rx) }
    }

    pub(crate) fn closed() -> Self {
        Self { rx: None }
    }
}

impl Future for Reply {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|reply| reply.map_err(|_| DispatchError::NoReply)),
            None => Poll::Ready(Err(DispatchError::Terminated)),
        }
    }
}
