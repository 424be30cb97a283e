//! Line format spoken with child-process workers.
//!
//! Every message is one JSON object on its own line, in both directions:
//!
//! ```text
//! {"data": <payload>}                 plain message
//! {"data": <payload>, "port": 7}      channel round trip (request or reply)
//! {"data": true}                      readiness sentinel
//! ```
//!
//! A worker answers a round trip by echoing the `port` it received.
//! Lines must end with a single `\n`; stderr is free-form and only logged.

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::Result;

/// One line of the stdio protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// The payload.
    pub data: Payload,
    /// Reply port id for channel round trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u64>,
}

impl WireMessage {
    /// Message without a port.
    pub fn new(data: Payload) -> Self {
        Self { data, port: None }
    }

    /// Message bound to a reply port.
    pub fn with_port(data: Payload, port: u64) -> Self {
        Self {
            data,
            port: Some(port),
        }
    }

    /// Encode as a single line, including the trailing `\n`.
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (surrounding whitespace is ignored).
    pub fn decode_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
