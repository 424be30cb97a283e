//! Process Host - dispatching to child-process workers.
//!
//! This example demonstrates:
//! - Configuring a `ProcessProvider` from JSON
//! - A one-shot request against a fresh process
//! - An open channel with several round trips to one process
//!
//! Expects the `echo_worker` example to be built first:
//!
//! ```text
//! cargo build --example echo_worker
//! RUST_LOG=worker_dispatch=debug cargo run --example process_host
//! ```

use serde_json::json;
use tracing_subscriber::EnvFilter;
use worker_dispatch::context::{ProcessConfig, ProcessProvider};
use worker_dispatch::Dispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ProcessConfig::from_json(r#"{ "workers_path": "target/debug/examples/" }"#)?;
    let dispatcher = Dispatcher::new(ProcessProvider::new(config));
    if !dispatcher.is_enabled() {
        eprintln!("target/debug/examples/ not found, build the echo_worker example first");
        return Ok(());
    }

    let reply = dispatcher.send("echo_worker", json!({ "message": "hello" }))?.await?;
    println!("request: {reply}");

    let channel = dispatcher.open("echo_worker")?.await?;
    for index in 0..3 {
        let reply = channel.send(json!({ "index": index })).await?;
        println!("channel round trip {index}: {reply}");
    }
    channel.terminate();

    println!("live operations: {}", dispatcher.active_operations());
    Ok(())
}
