//! Deferred results returned by the dispatcher's entry points.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{DispatchError, Result};
use crate::operation::OperationId;

/// Outcome of an operation, settled at most once.
///
/// Await it for the result. Keep [`Pending::id`] around to cancel the
/// operation with [`Dispatcher::terminate`](crate::Dispatcher::terminate).
/// If the operation is torn down without settling, the result is
/// `Err(DispatchError::Terminated)`.
#[must_use = "dropping a Pending does not cancel the operation"]
pub struct Pending<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(id: OperationId, rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { id, rx }
    }

    /// A result that is already settled and owns no operation.
    pub(crate) fn settled(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            id: OperationId::DETACHED,
            rx,
        }
    }

    /// A result that is already rejected and owns no operation.
    pub(crate) fn rejected(error: DispatchError) -> Self {
        Self::settled(Err(error))
    }

    /// Id of the underlying operation.
    #[inline]
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(DispatchError::Terminated)))
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}
