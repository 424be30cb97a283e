//! Dispatcher builder and completion protocol.
//!
//! The [`Dispatcher`] owns the operation registry and drives every
//! operation through its lifecycle:
//! 1. Check the capability gate and the worker name
//! 2. Ask the provider for a fresh execution context
//! 3. Register the operation and start its signal pump
//! 4. Settle the caller's [`Pending`] on data or error signals
//! 5. Destroy the context and drop the record on completion or termination
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use worker_dispatch::context::TaskProvider;
//! use worker_dispatch::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> worker_dispatch::Result<()> {
//!     let provider = TaskProvider::new().worker("echo", |mut scope| async move {
//!         if let Some(envelope) = scope.recv().await {
//!             scope.post(envelope.payload)?;
//!         }
//!         Ok(())
//!     });
//!
//!     let dispatcher = Dispatcher::new(provider);
//!     let reply = dispatcher.send("echo", json!({ "hello": "world" }))?.await?;
//!     assert_eq!(reply, json!({ "hello": "world" }));
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, Reply};
use crate::context::{
    is_ready, ContextEvent, ContextProvider, Envelope, Payload, ReplyPort, SpawnedContext,
};
use crate::error::{DispatchError, Result};
use crate::operation::{Callback, Gate, Operation, OperationId, OperationRecord};
use crate::pending::Pending;
use crate::registry::Registry;

/// Builder for configuring and creating a [`Dispatcher`].
pub struct DispatcherBuilder {
    provider: Arc<dyn ContextProvider>,
    enabled: Option<bool>,
}

impl DispatcherBuilder {
    /// Create a builder around a context provider.
    pub fn new<P: ContextProvider>(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            enabled: None,
        }
    }

    /// Force the capability gate on or off.
    ///
    /// Default: whatever [`ContextProvider::is_available`] reports at build time.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Build the dispatcher.
    pub fn build(self) -> Dispatcher {
        let enabled = self
            .enabled
            .unwrap_or_else(|| self.provider.is_available());
        tracing::debug!("Dispatcher created (enabled: {})", enabled);

        Dispatcher {
            inner: Arc::new(Inner {
                provider: self.provider,
                registry: Mutex::new(Registry::new()),
                enabled,
            }),
        }
    }
}

/// Shared state behind every `Dispatcher` clone.
struct Inner {
    provider: Arc<dyn ContextProvider>,
    registry: Mutex<Registry>,
    enabled: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        if registry.is_empty() {
            return;
        }
        let records = registry.drain();
        tracing::debug!("Dispatcher dropped, destroying {} contexts", records.len());
        for mut record in records {
            record.operation.close();
            record.context.destroy();
        }
    }
}

/// A record freshly created by `acquire`, not yet registered.
struct Acquired {
    record: OperationRecord,
    events: mpsc::UnboundedReceiver<ContextEvent>,
}

/// Manages execution contexts on behalf of the application.
///
/// Cheap to clone; all clones share one registry. Entry points must be
/// called from within a tokio runtime. Dropping the last clone destroys
/// every live context.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher with default settings.
    pub fn new<P: ContextProvider>(provider: P) -> Self {
        DispatcherBuilder::new(provider).build()
    }

    /// Create a dispatcher builder.
    pub fn builder<P: ContextProvider>(provider: P) -> DispatcherBuilder {
        DispatcherBuilder::new(provider)
    }

    /// Whether execution contexts can be created at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Number of live operations (and therefore live contexts).
    pub fn active_operations(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether the operation is still live.
    pub fn is_active(&self, id: OperationId) -> bool {
        self.inner.registry.lock().get(id).is_some()
    }

    /// Send a payload to a fresh context and wait for its single reply.
    ///
    /// The context is destroyed as soon as it replies or fails.
    ///
    /// # Errors
    ///
    /// Fails immediately with `Unavailable` or `InvalidArgument`. Everything
    /// else, including a context that cannot be started, is reported through
    /// the returned [`Pending`].
    pub fn send(&self, name: &str, payload: Payload) -> Result<Pending<Payload>> {
        let (tx, rx) = oneshot::channel();
        self.launch(name, Operation::Request { pending: Some(tx) }, rx, Some(payload))
    }

    /// Subscribe to the stream of data a context emits.
    ///
    /// The returned [`Pending`] resolves once the context signals readiness;
    /// every later data signal is passed to `callback`, in arrival order.
    pub fn subscribe(&self, name: &str, callback: &Callback) -> Result<Pending<()>> {
        self.start_subscription(name, callback, None)
    }

    /// Like [`subscribe`](Self::subscribe), but dispatches `payload` to the
    /// context right after it is created.
    pub fn subscribe_with(
        &self,
        name: &str,
        payload: Payload,
        callback: &Callback,
    ) -> Result<Pending<()>> {
        self.start_subscription(name, callback, Some(payload))
    }

    fn start_subscription(
        &self,
        name: &str,
        callback: &Callback,
        initial: Option<Payload>,
    ) -> Result<Pending<()>> {
        let (tx, rx) = oneshot::channel();
        let operation = Operation::Subscription {
            callback: callback.clone(),
            gate: Gate::new(),
            ready: Some(tx),
        };
        self.launch(name, operation, rx, initial)
    }

    /// Tear down subscriptions on `name`.
    ///
    /// With a callback, only the subscription registered with that exact
    /// callback is removed; without one, every subscription on `name` is.
    /// A subscription that had not signalled readiness yet resolves `Ok(())`.
    ///
    /// Teardown happens before this returns: once it does, the removed
    /// callbacks are not running and will not be invoked again. A callback
    /// still running on another thread is waited for.
    ///
    /// The returned [`Pending`] is already settled with the number of
    /// subscriptions removed, or rejected with `NotFound` if nothing matched.
    ///
    /// # Errors
    ///
    /// Fails immediately with `InvalidArgument` for an empty name.
    pub fn unsubscribe(&self, name: &str, callback: Option<&Callback>) -> Result<Pending<usize>> {
        if name.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "You must provide the worker name".to_string(),
            ));
        }

        let records: Vec<OperationRecord> = {
            let mut registry = self.inner.registry.lock();
            let ids: Vec<OperationId> = match callback {
                Some(callback) => registry
                    .find_first(|r| r.is_subscription(name, Some(callback)))
                    .into_iter()
                    .collect(),
                None => registry.find(|r| r.is_subscription(name, None)),
            };
            ids.into_iter().filter_map(|id| registry.remove(id)).collect()
        };

        if records.is_empty() {
            tracing::trace!("No subscription to remove on worker '{}'", name);
            return Ok(Pending::rejected(DispatchError::NotFound {
                name: name.to_string(),
            }));
        }

        let count = records.len();
        for mut record in records {
            record.operation.close();
            record.context.destroy();
            if let Operation::Subscription {
                ready: Some(tx), ..
            } = record.operation
            {
                let _ = tx.send(Ok(()));
            }
        }
        tracing::debug!("Unsubscribed {} from worker '{}'", count, name);
        Ok(Pending::settled(Ok(count)))
    }

    /// Open a long-lived channel to a fresh context.
    ///
    /// The returned [`Pending`] resolves with the [`Channel`] once the
    /// context signals readiness.
    pub fn open(&self, name: &str) -> Result<Pending<Channel>> {
        let (tx, rx) = oneshot::channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let operation = Operation::Channel {
            ready: Some(tx),
            inbox,
            inbox_rx: Some(inbox_rx),
        };
        self.launch(name, operation, rx, None)
    }

    /// Terminate one operation.
    ///
    /// Its context is destroyed immediately and its [`Pending`], if not yet
    /// settled, resolves with `Terminated`. Unknown or already finished ids
    /// are ignored. Returns whether anything was terminated.
    pub fn terminate(&self, id: OperationId) -> bool {
        match self.retire(id) {
            Some(record) => {
                tracing::debug!(
                    "Terminated {} {} of worker '{}'",
                    record.operation.kind(),
                    id,
                    record.name
                );
                reject(record.operation, DispatchError::Terminated);
                true
            }
            None => {
                tracing::trace!("Nothing to terminate for {}", id);
                false
            }
        }
    }

    /// Terminate every live operation. Returns how many were terminated.
    pub fn terminate_all(&self) -> usize {
        let records = self.inner.registry.lock().drain();
        let count = records.len();

        for mut record in records {
            record.operation.close();
            record.context.destroy();
            reject(record.operation, DispatchError::Terminated);
        }

        if count > 0 {
            tracing::debug!("Terminated {} operations", count);
        }
        count
    }

    /// Channel round trip: dispatch with a fresh reply port.
    pub(crate) fn round_trip(&self, id: OperationId, payload: Payload) -> Reply {
        let (port, rx) = ReplyPort::new();

        let dispatched = match self.inner.registry.lock().get(id) {
            Some(record) if matches!(record.operation, Operation::Channel { .. }) => record
                .context
                .dispatch(Envelope::with_reply(payload, port)),
            _ => return Reply::closed(),
        };

        match dispatched {
            Ok(()) => Reply::new(rx),
            Err(e) => {
                self.on_error(id, e.into_message());
                Reply::closed()
            }
        }
    }

    /// Shared tail of every entry point: gate, acquire, register, dispatch.
    fn launch<T>(
        &self,
        name: &str,
        operation: Operation,
        rx: oneshot::Receiver<Result<T>>,
        initial: Option<Payload>,
    ) -> Result<Pending<T>> {
        self.check(name)?;

        let acquired = match self.acquire(name, operation) {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::debug!("Worker '{}' could not be started: {}", name, e);
                return Ok(Pending::rejected(e));
            }
        };

        let id = self.add(acquired);
        if let Some(payload) = initial {
            self.dispatch(id, Envelope::new(payload));
        }

        Ok(Pending::new(id, rx))
    }

    /// Synchronous preconditions; nothing has been created when these fail.
    fn check(&self, name: &str) -> Result<()> {
        if !self.inner.enabled {
            return Err(DispatchError::Unavailable);
        }
        if name.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "You must provide the worker name".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a context and its record. The record is not registered yet.
    fn acquire(&self, name: &str, operation: Operation) -> Result<Acquired> {
        let SpawnedContext { context, events } = self.inner.provider.spawn(name)?;
        Ok(Acquired {
            record: OperationRecord::new(name, context, operation),
            events,
        })
    }

    /// Register an acquired record and start pumping its signals.
    fn add(&self, acquired: Acquired) -> OperationId {
        let Acquired { record, events } = acquired;
        let kind = record.operation.kind();
        let name = record.name.clone();

        let id = self.inner.registry.lock().add(record);
        tracing::debug!("Started {} {} on worker '{}'", kind, id, name);

        self.wire(id, events);
        id
    }

    fn dispatch(&self, id: OperationId, envelope: Envelope) {
        let dispatched = match self.inner.registry.lock().get(id) {
            Some(record) => record.context.dispatch(envelope),
            None => return,
        };

        if let Err(e) = dispatched {
            self.on_error(id, e.into_message());
        }
    }

    /// Spawn the task delivering one context's signals, in order.
    ///
    /// The task only holds a weak reference, so it never keeps the
    /// dispatcher alive. It stops once the record is gone.
    fn wire(&self, id: OperationId, mut events: mpsc::UnboundedReceiver<ContextEvent>) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let dispatcher = Dispatcher { inner };

                let live = match event {
                    ContextEvent::Message(payload) => dispatcher.on_message(id, payload),
                    ContextEvent::Error(message) => {
                        dispatcher.on_error(id, message);
                        false
                    }
                };
                if !live {
                    return;
                }
            }

            if let Some(inner) = inner.upgrade() {
                Dispatcher { inner }.on_error(id, "Execution context closed".to_string());
            }
        });
    }

    /// Data signal. Returns whether the record is still live.
    fn on_message(&self, id: OperationId, payload: Payload) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(record) = registry.get_mut(id) else {
            return false;
        };

        if !record.operation.is_persistent() {
            if is_ready(&payload) {
                tracing::trace!("Ignoring readiness ping for request {}", id);
                return true;
            }

            let Some(mut record) = registry.remove(id) else {
                return false;
            };
            drop(registry);

            record.context.destroy();
            tracing::debug!("Request {} on worker '{}' resolved", id, record.name);
            if let Operation::Request { pending: Some(tx) } = record.operation {
                let _ = tx.send(Ok(payload));
            }
            return false;
        }

        match &mut record.operation {
            Operation::Request { .. } => false,
            Operation::Subscription {
                callback,
                gate,
                ready,
            } => {
                if is_ready(&payload) {
                    if let Some(tx) = ready.take() {
                        tracing::debug!("Subscription {} on worker '{}' is live", id, record.name);
                        let _ = tx.send(Ok(()));
                    }
                    return true;
                }

                let callback = callback.clone();
                let gate = gate.clone();
                drop(registry);

                // Teardown may win the race once the registry lock is released.
                gate.run(|| callback.call(payload))
            }
            Operation::Channel {
                ready,
                inbox,
                inbox_rx,
            } => {
                if !is_ready(&payload) {
                    let _ = inbox.send(payload);
                    return true;
                }

                if let (Some(tx), Some(rx)) = (ready.take(), inbox_rx.take()) {
                    tracing::debug!("Channel {} on worker '{}' is open", id, record.name);
                    let channel = Channel::new(id, record.name.clone(), self.clone(), rx);
                    let _ = tx.send(Ok(channel));
                }
                true
            }
        }
    }

    /// Error signal: tear down unconditionally, then reject.
    fn on_error(&self, id: OperationId, message: String) {
        let Some(record) = self.retire(id) else {
            return;
        };

        let kind = record.operation.kind();
        let name = record.name;
        if reject(record.operation, DispatchError::Context(message.clone())) {
            tracing::debug!("{} {} on worker '{}' failed: {}", kind, id, name, message);
        } else {
            tracing::warn!(
                "Live {} {} on worker '{}' failed and was closed: {}",
                kind,
                id,
                name,
                message
            );
        }
    }

    /// Remove a record and destroy its context.
    fn retire(&self, id: OperationId) -> Option<OperationRecord> {
        let mut record = self.inner.registry.lock().remove(id)?;
        record.operation.close();
        record.context.destroy();
        Some(record)
    }
}

/// Reject whatever is still unsettled. Returns whether anything was.
fn reject(operation: Operation, error: DispatchError) -> bool {
    match operation {
        Operation::Request { pending: Some(tx) } => tx.send(Err(error)).is_ok(),
        Operation::Subscription { ready: Some(tx), .. } => tx.send(Err(error)).is_ok(),
        Operation::Channel { ready: Some(tx), .. } => tx.send(Err(error)).is_ok(),
        _ => false,
    }
}
