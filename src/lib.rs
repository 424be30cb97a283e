//! # worker-dispatch
//!
//! Dispatcher for message-passing worker contexts.
//!
//! Every operation runs in a fresh, isolated execution context created by a
//! [`ContextProvider`](context::ContextProvider). The [`Dispatcher`] keeps a
//! registry of live operations and settles each caller's result exactly
//! once from the context's signals.
//!
//! ## Operations
//!
//! - **Request**: [`Dispatcher::send`] - one payload in, one reply out, context destroyed
//! - **Subscription**: [`Dispatcher::subscribe`] - every data signal goes to a [`Callback`]
//! - **Channel**: [`Dispatcher::open`] - repeated round trips over one [`Channel`]
//!
//! Any operation can be cancelled with [`Dispatcher::terminate`].
//!
//! ## Example
//!
//! ```ignore
//! use serde_json::json;
//! use worker_dispatch::context::TaskProvider;
//! use worker_dispatch::{Callback, Dispatcher};
//!
//! #[tokio::main]
//! async fn main() -> worker_dispatch::Result<()> {
//!     let provider = TaskProvider::new().worker("ticker", |mut scope| async move {
//!         scope.ready()?;
//!         for index in 0..3 {
//!             scope.post(json!({ "index": index }))?;
//!         }
//!         while scope.recv().await.is_some() {}
//!         Ok(())
//!     });
//!
//!     let dispatcher = Dispatcher::new(provider);
//!     let callback = Callback::new(|data| println!("tick: {data}"));
//!     dispatcher.subscribe("ticker", &callback)?.await?;
//!     dispatcher.unsubscribe("ticker", Some(&callback))?.await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod worker;

mod channel;
mod dispatcher;
mod operation;
mod pending;
mod registry;

pub use channel::{Channel, Reply};
pub use context::{Payload, READY};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{DispatchError, Result};
pub use operation::{Callback, OperationId};
pub use pending::Pending;
