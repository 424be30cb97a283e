//! In-process provider: named async functions running as tokio tasks.
//!
//! Each spawned context is a fresh task running the registered function
//! with its own [`WorkerScope`]. Nothing is shared between two contexts
//! spawned from the same name.
//!
//! # Example
//!
//! ```ignore
//! use worker_dispatch::context::TaskProvider;
//!
//! let provider = TaskProvider::new().worker("echo", |mut scope| async move {
//!     while let Some(envelope) = scope.recv().await {
//!         scope.post(envelope.payload)?;
//!     }
//!     Ok(())
//! });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{
    ContextEvent, ContextProvider, Envelope, ExecutionContext, Payload, SpawnedContext, READY,
};
use crate::error::{DispatchError, Result};

/// Result type for worker functions.
pub type WorkerResult = Result<()>;

/// Boxed future for worker results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for worker functions.
pub trait WorkerFn: Send + Sync + 'static {
    /// Run the worker body for one context.
    fn call(&self, scope: WorkerScope) -> BoxFuture<'static, WorkerResult>;
}

impl<F, Fut> WorkerFn for F
where
    F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult> + Send + 'static,
{
    fn call(&self, scope: WorkerScope) -> BoxFuture<'static, WorkerResult> {
        Box::pin(self(scope))
    }
}

/// The worker's side of a context.
///
/// Receives envelopes from the dispatcher and posts data back. Returning
/// `Err` from the worker function, or panicking, is reported to the
/// dispatcher as an error signal.
pub struct WorkerScope {
    name: String,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl WorkerScope {
    /// Name this context was spawned under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next envelope.
    ///
    /// Returns `None` once the context has been destroyed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Post data to the dispatcher.
    pub fn post(&self, payload: Payload) -> Result<()> {
        self.events
            .send(ContextEvent::Message(payload))
            .map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Announce that the context has started.
    pub fn ready(&self) -> Result<()> {
        self.post(READY)
    }
}

/// Registry mapping worker names to worker functions.
#[derive(Clone, Default)]
pub struct TaskProvider {
    workers: HashMap<String, Arc<dyn WorkerFn>>,
}

impl TaskProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker (builder style).
    pub fn worker<F, Fut>(mut self, name: &str, worker: F) -> Self
    where
        F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        self.register(name, worker);
        self
    }

    /// Register a worker, replacing any previous one with the same name.
    pub fn register<F, Fut>(&mut self, name: &str, worker: F)
    where
        F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        self.workers.insert(name.to_string(), Arc::new(worker));
    }

    /// Whether a worker is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }
}

impl ContextProvider for TaskProvider {
    fn spawn(&self, name: &str) -> Result<SpawnedContext> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| DispatchError::Context(format!("No worker registered as '{name}'")))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let scope = WorkerScope {
            name: name.to_string(),
            inbound: inbound_rx,
            events: events_tx.clone(),
        };

        let task = tokio::spawn(worker.call(scope));
        let abort = task.abort_handle();

        // Supervisor: turns a failed or panicked worker into an error signal.
        let worker_name = name.to_string();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => tracing::trace!("Worker '{}' finished", worker_name),
                Ok(Err(e)) => {
                    let _ = events_tx.send(ContextEvent::Error(e.into_message()));
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    tracing::error!("Worker '{}' panicked: {}", worker_name, message);
                    let _ = events_tx.send(ContextEvent::Error(message));
                }
                Err(_) => tracing::trace!("Worker '{}' aborted", worker_name),
            }
        });

        Ok(SpawnedContext {
            context: Box::new(TaskContext {
                inbound: Some(inbound_tx),
                abort,
            }),
            events: events_rx,
        })
    }
}

/// Context handle for a worker task.
struct TaskContext {
    inbound: Option<mpsc::UnboundedSender<Envelope>>,
    abort: AbortHandle,
}

impl ExecutionContext for TaskContext {
    fn dispatch(&self, envelope: Envelope) -> Result<()> {
        match &self.inbound {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| DispatchError::ConnectionClosed),
            None => Err(DispatchError::ConnectionClosed),
        }
    }

    fn destroy(&mut self) {
        self.inbound.take();
        self.abort.abort();
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("Worker panicked: {detail}")
}
