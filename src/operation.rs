//! Operation records - one per outstanding operation and its context.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tokio::sync::{mpsc, oneshot};

use crate::channel::Channel;
use crate::context::{ExecutionContext, Payload};
use crate::error::Result;

/// Stable identifier of an operation.
///
/// Assigned by the registry starting from 1; 0 is reserved for handles whose
/// operation never made it into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// Id of operations that were rejected before being registered.
    pub const DETACHED: OperationId = OperationId(0);

    /// Raw numeric value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Subscription handler, invoked once per data signal.
///
/// Identity is the allocation: clones compare equal, two callbacks built
/// from identical closures do not.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Payload) + Send + Sync>);

impl Callback {
    /// Wrap a handler.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the handler.
    #[inline]
    pub fn call(&self, payload: Payload) {
        (self.0)(payload)
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

/// Open/closed flag guarding a subscription's callback.
///
/// The pump runs the callback while holding the gate, and teardown closes
/// it under the same lock, so once `close` returns no invocation is running
/// or will start. The lock is reentrant: a callback may tear down its own
/// subscription.
#[derive(Clone)]
pub(crate) struct Gate(Arc<ReentrantMutex<Cell<bool>>>);

impl Gate {
    pub(crate) fn new() -> Self {
        Self(Arc::new(ReentrantMutex::new(Cell::new(true))))
    }

    /// Run `f` if the gate is still open. Returns whether it ran.
    pub(crate) fn run<F: FnOnce()>(&self, f: F) -> bool {
        let open = self.0.lock();
        if !open.get() {
            return false;
        }
        f();
        true
    }

    /// Close the gate, waiting for an invocation in flight on another thread.
    pub(crate) fn close(&self) {
        self.0.lock().set(false);
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.0.lock().get()
    }
}

/// Mode-specific state of an operation.
pub(crate) enum Operation {
    /// One-shot request/response.
    Request {
        pending: Option<oneshot::Sender<Result<Payload>>>,
    },
    /// Persistent subscription delivering data to a callback.
    Subscription {
        callback: Callback,
        gate: Gate,
        ready: Option<oneshot::Sender<Result<()>>>,
    },
    /// Persistent bidirectional channel.
    Channel {
        ready: Option<oneshot::Sender<Result<Channel>>>,
        inbox: mpsc::UnboundedSender<Payload>,
        /// Handed to the `Channel` once the context is ready.
        inbox_rx: Option<mpsc::UnboundedReceiver<Payload>>,
    },
}

impl Operation {
    /// Whether the operation survives its first completion signal.
    pub(crate) fn is_persistent(&self) -> bool {
        !matches!(self, Operation::Request { .. })
    }

    /// Stop any further callback invocations.
    pub(crate) fn close(&self) {
        if let Operation::Subscription { gate, .. } = self {
            gate.close();
        }
    }

    /// Short label for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Operation::Request { .. } => "request",
            Operation::Subscription { .. } => "subscription",
            Operation::Channel { .. } => "channel",
        }
    }
}

/// Correlation between a caller-visible handle and its execution context.
pub(crate) struct OperationRecord {
    pub(crate) name: String,
    pub(crate) context: Box<dyn ExecutionContext>,
    pub(crate) operation: Operation,
}

impl OperationRecord {
    pub(crate) fn new(name: &str, context: Box<dyn ExecutionContext>, operation: Operation) -> Self {
        Self {
            name: name.to_string(),
            context,
            operation,
        }
    }

    /// Whether this is a subscription on `name`, optionally restricted to one callback.
    pub(crate) fn is_subscription(&self, name: &str, callback: Option<&Callback>) -> bool {
        match &self.operation {
            Operation::Subscription { callback: own, .. } => {
                self.name == name && callback.map_or(true, |cb| cb == own)
            }
            _ => false,
        }
    }
}
