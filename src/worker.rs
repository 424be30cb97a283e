//! Worker side of the child-process protocol.
//!
//! A Rust program started by [`ProcessProvider`](crate::context::ProcessProvider)
//! uses [`StdioWorker`] to talk to its dispatcher over stdio.
//!
//! # Important
//!
//! - **stdout**: protocol lines only (one JSON object per line)
//! - **stderr**: logs, the last line is attached to exit errors
//! - **Never use `println!`**: anything else on stdout is a protocol error
//!
//! # Example
//!
//! ```ignore
//! use worker_dispatch::worker::StdioWorker;
//!
//! #[tokio::main]
//! async fn main() -> worker_dispatch::Result<()> {
//!     let mut worker = StdioWorker::new();
//!     worker.ready()?;
//!     while let Some(message) = worker.recv().await? {
//!         match message.port {
//!             Some(port) => worker.reply(port, message.data)?,
//!             None => worker.post(message.data)?,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::context::wire::WireMessage;
use crate::context::{Payload, READY};
use crate::error::Result;

/// A message received from the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// The payload.
    pub data: Payload,
    /// Set for channel round trips; answer with [`StdioWorker::reply`].
    pub port: Option<u64>,
}

/// Stdio endpoint of a worker process.
pub struct StdioWorker {
    lines: Lines<BufReader<Stdin>>,
}

impl StdioWorker {
    /// Attach to the process's stdin and stdout.
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Announce that the worker has started.
    pub fn ready(&self) -> Result<()> {
        self.post(READY)
    }

    /// Post data to the dispatcher.
    pub fn post(&self, data: Payload) -> Result<()> {
        write_stdout(&WireMessage::new(data))
    }

    /// Answer the round trip that arrived with `port`.
    pub fn reply(&self, port: u64, data: Payload) -> Result<()> {
        write_stdout(&WireMessage::with_port(data, port))
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once stdin is closed, which is how the dispatcher
    /// tears a context down. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a line that is not valid JSON.
    pub async fn recv(&mut self) -> Result<Option<Incoming>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message = WireMessage::decode_line(&line)?;
            return Ok(Some(Incoming {
                data: message.data,
                port: message.port,
            }));
        }
        Ok(None)
    }
}

impl Default for StdioWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one protocol line to stdout and flush.
fn write_stdout(message: &WireMessage) -> Result<()> {
    let line = message.encode_line()?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.flush()?;
    Ok(())
}
