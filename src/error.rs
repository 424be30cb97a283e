//! Error types for worker-dispatch.

use thiserror::Error;

/// Main error type for all dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A required argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The host cannot create execution contexts.
    #[error("Workers are disabled")]
    Unavailable,

    /// The execution context signalled an error.
    #[error("Context error: {0}")]
    Context(String),

    /// No live subscription matched an unsubscribe request.
    #[error("Worker: event does not exist: {name}")]
    NotFound { name: String },

    /// The operation was terminated before it settled.
    #[error("Operation terminated")]
    Terminated,

    /// A channel round trip ended without a reply.
    #[error("Context dropped the reply port without answering")]
    NoReply,

    /// The receiving side of a context is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error while talking to a child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Text handed to the dispatcher when a worker fails with this error.
    ///
    /// Context errors keep their original message so that a failure raised
    /// inside a worker reaches the caller verbatim.
    pub fn into_message(self) -> String {
        match self {
            DispatchError::Context(message) => message,
            other => other.to_string(),
        }
    }
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;
