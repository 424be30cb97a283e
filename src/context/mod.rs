//! Context module - the boundary between the dispatcher and execution contexts.
//!
//! An execution context is an isolated unit of computation reachable only
//! through messages. The dispatcher never creates one itself; it asks a
//! [`ContextProvider`] for one by name and gets back:
//!
//! - a [`ExecutionContext`] handle to dispatch envelopes into and to destroy,
//! - a receiver of [`ContextEvent`]s (data and error signals).
//!
//! Two providers ship with the crate:
//!
//! - [`TaskProvider`] - named async functions running as tokio tasks
//! - [`ProcessProvider`] - child processes speaking JSON lines over stdio
//!
//! # Readiness sentinel
//!
//! Readiness and real data travel over the same signal path. A context
//! announces that it has started by posting the boolean `true`
//! ([`READY`]). That value is reserved and never used as payload data.

mod process;
mod task;
pub(crate) mod wire;

use tokio::sync::{mpsc, oneshot};

use crate::error::{DispatchError, Result};

pub use process::{ProcessConfig, ProcessProvider};
pub use task::{BoxFuture, TaskProvider, WorkerFn, WorkerResult, WorkerScope};

/// Opaque payload exchanged with execution contexts.
pub type Payload = serde_json::Value;

/// Readiness sentinel posted by a context once it has started.
pub const READY: Payload = Payload::Bool(true);

/// Check whether a payload is the readiness sentinel.
#[inline]
pub fn is_ready(payload: &Payload) -> bool {
    matches!(payload, Payload::Bool(true))
}

/// Signal delivered from a context to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// Data posted by the context (or the readiness sentinel).
    Message(Payload),
    /// The context failed; carries the message text.
    Error(String),
}

/// Port for answering exactly one channel round trip.
///
/// Travels next to the payload instead of over the main signal path, so a
/// reply can only ever reach the caller that sent the matching request.
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<Payload>);

impl ReplyPort {
    /// Create a port and the receiver its reply will arrive on.
    pub fn new() -> (Self, oneshot::Receiver<Payload>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Answer the round trip.
    ///
    /// Fails with `ConnectionClosed` if the caller stopped waiting.
    pub fn send(self, payload: Payload) -> Result<()> {
        self.0
            .send(payload)
            .map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Whether the caller is still waiting for the reply.
    pub fn is_open(&self) -> bool {
        !self.0.is_closed()
    }
}

/// Data dispatched into a context.
#[derive(Debug)]
pub struct Envelope {
    /// The payload, handed through verbatim.
    pub payload: Payload,
    /// Reply port for channel round trips.
    pub reply: Option<ReplyPort>,
}

impl Envelope {
    /// Envelope without a reply port.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            reply: None,
        }
    }

    /// Envelope carrying a reply port.
    pub fn with_reply(payload: Payload, reply: ReplyPort) -> Self {
        Self {
            payload,
            reply: Some(reply),
        }
    }
}

/// Handle to a running execution context.
pub trait ExecutionContext: Send + 'static {
    /// Send an envelope into the context (fire-and-forget).
    fn dispatch(&self, envelope: Envelope) -> Result<()>;

    /// Immediately stop the context. Must be idempotent.
    fn destroy(&mut self);
}

/// A freshly spawned context and the signals it emits.
pub struct SpawnedContext {
    /// Handle owned by the operation record.
    pub context: Box<dyn ExecutionContext>,
    /// Data and error signals, in emission order.
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
}

/// Capability to create execution contexts by name.
pub trait ContextProvider: Send + Sync + 'static {
    /// Create a context for the named unit of work.
    ///
    /// Must be called from within a tokio runtime.
    fn spawn(&self, name: &str) -> Result<SpawnedContext>;

    /// Whether this host can create contexts at all.
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_sentinel() {
        assert!(is_ready(&READY));
        assert!(is_ready(&json!(true)));
        assert!(!is_ready(&json!(false)));
        assert!(!is_ready(&json!("true")));
        assert!(!is_ready(&json!({ "ready": true })));
    }

    #[tokio::test]
    async fn test_reply_port_delivers_once() {
        let (port, rx) = ReplyPort::new();
        assert!(port.is_open());
        port.send(json!({ "index": 1 })).unwrap();
        assert_eq!(rx.await.unwrap(), json!({ "index": 1 }));
    }

    #[test]
    fn test_reply_port_closed_receiver() {
        let (port, rx) = ReplyPort::new();
        drop(rx);
        assert!(!port.is_open());
        assert!(matches!(
            port.send(json!(1)),
            Err(DispatchError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_envelope_constructors() {
        let plain = Envelope::new(json!("data"));
        assert!(plain.reply.is_none());

        let (port, _rx) = ReplyPort::new();
        let with_reply = Envelope::with_reply(json!("data"), port);
        assert!(with_reply.reply.is_some());
    }
}
