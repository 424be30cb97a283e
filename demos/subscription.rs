//! Subscription - streaming data from an in-process worker.
//!
//! This example demonstrates:
//! - Registering async workers with `TaskProvider`
//! - Subscribing a callback and waiting for readiness
//! - Unsubscribing by callback
//!
//! ```text
//! RUST_LOG=worker_dispatch=debug cargo run --example subscription
//! ```

use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use worker_dispatch::context::{TaskProvider, WorkerScope};
use worker_dispatch::{Callback, Dispatcher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let provider = TaskProvider::new().worker("ticker", |scope: WorkerScope| async move {
        scope.ready()?;
        let mut index = 0;
        while scope.post(json!({ "index": index })).is_ok() {
            index += 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    });

    let dispatcher = Dispatcher::new(provider);
    let callback = Callback::new(|data| println!("tick: {data}"));

    dispatcher.subscribe("ticker", &callback)?.await?;
    println!("subscribed, live operations: {}", dispatcher.active_operations());

    tokio::time::sleep(Duration::from_millis(550)).await;

    let removed = dispatcher.unsubscribe("ticker", Some(&callback))?.await?;
    println!("unsubscribed {removed}, live operations: {}", dispatcher.active_operations());
    Ok(())
}
