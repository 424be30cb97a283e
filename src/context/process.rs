//! Child-process provider: one OS process per context.
//!
//! The worker executable is located at `{workers_path}{name}{suffix}` and
//! optionally launched through an interpreter. Messages travel as JSON lines
//! (see [`wire`](super::wire)):
//!
//! ```text
//! Dispatcher ─► writer task ─► stdin  ─┐
//!                                      ├─ worker process
//! Dispatcher ◄─ reader task ◄─ stdout ─┘
//!                              stderr ─► tracing
//! ```
//!
//! Reply ports are kept in a per-context table keyed by a numeric port id;
//! a line carrying `port` is routed to that port and never reaches the
//! main signal path. Process exit and malformed output become error signals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::wire::WireMessage;
use super::{ContextEvent, ContextProvider, Envelope, ExecutionContext, ReplyPort, SpawnedContext};
use crate::error::{DispatchError, Result};

/// Default directory prefix for worker executables.
pub const DEFAULT_WORKERS_PATH: &str = "workers/";

/// How long to wait for the stderr tail once a worker has exited.
const STDERR_TAIL_TIMEOUT: Duration = Duration::from_millis(100);

type PortTable = Arc<Mutex<HashMap<u64, ReplyPort>>>;

/// Where worker executables live and how to start them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Prefix prepended to the worker name. Usually a directory ending in `/`.
    pub workers_path: String,
    /// Suffix appended to the worker name (e.g. `.sh`).
    pub suffix: String,
    /// Program used to run the script (e.g. `sh`). Executed directly if unset.
    pub interpreter: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            workers_path: DEFAULT_WORKERS_PATH.to_string(),
            suffix: String::new(),
            interpreter: None,
        }
    }
}

impl ProcessConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Location of the worker called `name`.
    pub fn script_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}{}", self.workers_path, name, self.suffix))
    }

    /// Directory part of `workers_path`.
    fn workers_dir(&self) -> &Path {
        let path = Path::new(&self.workers_path);
        if self.workers_path.ends_with('/') || self.workers_path.ends_with(std::path::MAIN_SEPARATOR)
        {
            path
        } else {
            path.parent().unwrap_or_else(|| Path::new(""))
        }
    }
}

/// Provider spawning one child process per context.
#[derive(Debug, Clone, Default)]
pub struct ProcessProvider {
    config: ProcessConfig,
}

impl ProcessProvider {
    /// Create a provider with the given configuration.
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

impl ContextProvider for ProcessProvider {
    fn spawn(&self, name: &str) -> Result<SpawnedContext> {
        let script = self.config.script_path(name);

        let mut command = match &self.config.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script);
                command
            }
            None => Command::new(&script),
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            DispatchError::Context(format!(
                "Failed to start worker '{}' ({}): {}",
                name,
                script.display(),
                e
            ))
        })?;
        tracing::debug!("Spawned worker '{}' from {}", name, script.display());

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take())
        {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(DispatchError::ConnectionClosed),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let ports: PortTable = Arc::default();

        let writer = tokio::spawn(writer_loop(stdin, outbound_rx, name.to_string()));
        let stderr_tail = tokio::spawn(stderr_loop(stderr, name.to_string()));
        tokio::spawn(reader_loop(
            ReaderState {
                name: name.to_string(),
                child,
                events: events_tx,
                ports: ports.clone(),
            },
            kill_rx,
            stdout,
            stderr_tail,
        ));

        Ok(SpawnedContext {
            context: Box::new(ProcessContext {
                outbound: Some(outbound_tx),
                ports,
                next_port: AtomicU64::new(1),
                kill: Some(kill_tx),
                writer,
            }),
            events: events_rx,
        })
    }

    fn is_available(&self) -> bool {
        let dir = self.config.workers_dir();
        dir.as_os_str().is_empty() || dir.is_dir()
    }
}

/// Context handle for a worker process.
struct ProcessContext {
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    ports: PortTable,
    next_port: AtomicU64,
    kill: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
}

impl ExecutionContext for ProcessContext {
    fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(DispatchError::ConnectionClosed)?;

        let (message, port) = match envelope.reply {
            Some(reply) => {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                self.ports.lock().insert(port, reply);
                (WireMessage::with_port(envelope.payload, port), Some(port))
            }
            None => (WireMessage::new(envelope.payload), None),
        };

        outbound.send(message).map_err(|_| {
            if let Some(port) = port {
                self.ports.lock().remove(&port);
            }
            DispatchError::ConnectionClosed
        })
    }

    fn destroy(&mut self) {
        self.outbound.take();
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.writer.abort();
        self.ports.lock().clear();
    }
}

/// Writes outbound messages to the worker's stdin, one line each.
async fn writer_loop(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    name: String,
) {
    while let Some(message) = rx.recv().await {
        let line = match message.encode_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Dropping unencodable message for worker '{}': {}", name, e);
                continue;
            }
        };

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!("Worker '{}' stdin closed: {}", name, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!("Worker '{}' stdin flush failed: {}", name, e);
            break;
        }
    }
}

/// Logs stderr lines and returns the last non-empty one.
async fn stderr_loop(stderr: ChildStderr, name: String) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::warn!("[worker {}] {}", name, line);
        last = Some(line);
    }
    last
}

struct ReaderState {
    name: String,
    child: Child,
    events: mpsc::UnboundedSender<ContextEvent>,
    ports: PortTable,
}

impl ReaderState {
    fn route(&self, line: &str) {
        let message = match WireMessage::decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                self.signal_error(format!(
                    "Malformed message from worker '{}': {}",
                    self.name, e
                ));
                return;
            }
        };

        match message.port {
            Some(port) => match self.ports.lock().remove(&port) {
                Some(reply) => {
                    let _ = reply.send(message.data);
                }
                None => tracing::warn!(
                    "Worker '{}' replied on unknown port {}",
                    self.name,
                    port
                ),
            },
            None => {
                let _ = self.events.send(ContextEvent::Message(message.data));
            }
        }
    }

    fn signal_error(&self, message: String) {
        let _ = self.events.send(ContextEvent::Error(message));
    }

    async fn kill_child(&mut self) {
        let _ = self.child.kill().await;
        tracing::debug!("Worker '{}' killed", self.name);
    }
}

/// Reads stdout until the worker exits or the context is destroyed.
///
/// A dropped kill sender counts as a kill request.
async fn reader_loop(
    mut state: ReaderState,
    mut kill: oneshot::Receiver<()>,
    stdout: ChildStdout,
    stderr_tail: JoinHandle<Option<String>>,
) {
    let mut lines = BufReader::new(stdout).lines();

    let killed = loop {
        tokio::select! {
            _ = &mut kill => break true,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        state.route(&line);
                    }
                }
                Ok(None) => break false,
                Err(e) => {
                    state.signal_error(format!("Worker '{}' stdout failed: {}", state.name, e));
                    break false;
                }
            }
        }
    };
    if killed {
        state.kill_child().await;
        return;
    }

    let status = tokio::select! {
        _ = &mut kill => None,
        status = state.child.wait() => Some(status),
    };
    let Some(status) = status else {
        state.kill_child().await;
        return;
    };

    let tail = match tokio::time::timeout(STDERR_TAIL_TIMEOUT, stderr_tail).await {
        Ok(Ok(tail)) => tail,
        _ => None,
    };

    let mut message = match status {
        Ok(status) if status.success() => format!("Worker '{}' exited", state.name),
        Ok(status) => format!("Worker '{}' exited with {}", state.name, status),
        Err(e) => format!("Worker '{}' could not be awaited: {}", state.name, e),
    };
    if let Some(tail) = tail {
        message.push_str(": ");
        message.push_str(&tail);
    }

    tracing::debug!("{}", message);
    state.signal_error(message);
}
