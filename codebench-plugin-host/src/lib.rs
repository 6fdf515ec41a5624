//! Plugin lifecycle and isolation for the codebench playground.
//!
//! Third-party plugins are untrusted code. The host activates each one
//! under exactly one of three isolation tiers, chosen from its manifest:
//!
//! - **Direct load**: `"sandboxed": false` loads straight into the
//!   host process. Reserved for first-party plugins; always logged.
//! - **Process isolation**: sandboxed plugins run inside a separate
//!   worker process behind a message channel ([`PluginProcessManager`]),
//!   sharing no memory with the host.
//! - **VM sandbox**: the in-process fallback, a restricted execution
//!   context scoped to the plugin's declared permissions.
//!
//! Declarative contributions (commands, keybindings, snippets, themes,
//! languages, wasm runtimes) are registered before a plugin's own
//! `activate` hook runs and are unconditionally torn down on
//! deactivation, even when the plugin misbehaves.

mod contributions;
mod correlation;
mod error;
mod host;
mod loader;
mod manifest;
mod permissions;
mod process;
mod protocol;
mod sandbox;

pub use contributions::{ContributionKind, ContributionRegistry};
pub use correlation::{ReplyError, RequestTracker};
pub use error::{HostResult, PluginHostError};
pub use host::{HostConfig, HostEvent, IsolationTier, PluginHost, PluginInfo, PluginStatus};
pub use loader::{mock as loader_mock, ModuleLoader, PluginContext, PluginModule, PluginStore};
pub use manifest::{
    CommandContribution, Contributions, KeybindingContribution, LanguageContribution,
    PluginManifest, SnippetContribution, ThemeContribution, WasmLanguageContribution,
};
pub use permissions::{Permission, PermissionSet, PermissionTier};
pub use process::{
    mock as process_mock, CommandLauncher, PluginProcessManager, ProcessManagerConfig,
    WorkerEvent, WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcess,
};
pub use protocol::{
    ActivatePayload, CallPayload, HostMessage, LogLevel, WorkerMessage, PROTOCOL_VERSION,
};
pub use sandbox::{mock as sandbox_mock, SandboxFactory, SandboxHandle, SandboxSpec};
