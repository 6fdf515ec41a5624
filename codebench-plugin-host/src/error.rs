//! Error types for the plugin host.

use thiserror::Error;

/// Result type for plugin host operations.
pub type HostResult<T> = Result<T, PluginHostError>;

/// Errors that can occur in plugin host operations.
#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("invalid plugin manifest: {0}")]
    ManifestInvalid(String),

    #[error("activation failed: plugin '{plugin_id}': {message}")]
    ActivationFailed { plugin_id: String, message: String },

    #[error("sandbox error: plugin '{plugin_id}': {message}")]
    Sandbox { plugin_id: String, message: String },

    #[error("permission denied: plugin '{plugin_id}' lacks '{permission}' capability")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
    },

    #[error("worker process not ready")]
    WorkerNotReady,

    #[error("worker process exited")]
    WorkerExited,

    #[error("worker launch failed: {0}")]
    WorkerLaunchFailed(String),

    #[error("request rejected by worker: {0}")]
    WorkerRejected(String),

    #[error("timeout after {timeout_ms}ms waiting for worker reply")]
    Timeout { timeout_ms: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
