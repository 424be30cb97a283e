//! Echo Worker - a child-process context written in Rust.
//!
//! This example demonstrates:
//! - Announcing readiness with `StdioWorker::ready`
//! - Answering channel round trips on their reply port
//! - Posting plain messages back for requests
//! - Logging to stderr, never stdout
//!
//! Build it, then drive it with the `process_host` example:
//!
//! ```text
//! cargo build --example echo_worker
//! cargo run --example process_host
//! ```

use serde_json::json;
use tracing_subscriber::EnvFilter;
use worker_dispatch::worker::StdioWorker;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut worker = StdioWorker::new();
    worker.ready()?;

    while let Some(message) = worker.recv().await? {
        tracing::debug!("echo_worker received {}", message.data);
        let answer = json!({ "echo": message.data });
        match message.port {
            Some(port) => worker.reply(port, answer)?,
            None => worker.post(answer)?,
        }
    }

    tracing::debug!("echo_worker stdin closed, exiting");
    Ok(())
}
