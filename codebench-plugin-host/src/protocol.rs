//! Wire protocol between the host and the isolated plugin worker.
//!
//! Messages are single-line JSON, newline-delimited, over the worker's
//! stdio. Every outbound message that expects a reply carries a `u64`
//! correlation id; the worker echoes it back on `result`/`error`/`pong`.
//! `ready` and `log` are unsolicited.

use crate::permissions::Permission;
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the host to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Activate a plugin inside the worker.
    Activate {
        id: u64,
        plugin_id: String,
        data: ActivatePayload,
    },
    /// Deactivate a previously activated plugin.
    Deactivate { id: u64, plugin_id: String },
    /// Invoke an exported plugin method.
    Call {
        id: u64,
        plugin_id: String,
        data: CallPayload,
    },
    /// Liveness probe.
    Ping { id: u64 },
    /// Orderly shutdown request.
    Shutdown { id: u64 },
}

impl HostMessage {
    /// The correlation id carried by this message.
    pub fn id(&self) -> u64 {
        match self {
            Self::Activate { id, .. }
            | Self::Deactivate { id, .. }
            | Self::Call { id, .. }
            | Self::Ping { id }
            | Self::Shutdown { id } => *id,
        }
    }
}

/// Payload of an `activate` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivatePayload {
    /// The plugin's entry source, shipped to the worker so the sandbox
    /// needs no filesystem access.
    pub source: String,
    /// Capabilities the worker should expose to this plugin.
    pub permissions: Vec<Permission>,
}

/// Payload of a `call` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Messages sent from the worker to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Handshake: the worker is initialized and accepting requests.
    Ready { version: u32 },
    /// Successful reply to a correlated request.
    Result {
        id: u64,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// Failed reply to a correlated request.
    Error { id: u64, error: String },
    /// Unsolicited log line from a plugin.
    Log {
        #[serde(default)]
        plugin_id: Option<String>,
        level: LogLevel,
        message: String,
    },
    /// Reply to a `ping`.
    Pong { id: u64 },
}

/// Log severity forwarded from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}
