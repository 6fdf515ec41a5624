//! Plugin manifest parsing.
//!
//! A plugin directory carries a `manifest.json` describing the plugin's
//! identity, entry points, requested permissions, and declarative
//! contributions. The manifest is immutable once loaded; hot-reload
//! re-reads it from disk.

use crate::error::{HostResult, PluginHostError};
use crate::permissions::Permission;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Static descriptor for a plugin, read from `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin id, e.g. `"vendor.formatter"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Entry file, relative to the plugin directory.
    pub main: String,
    /// Optional renderer-side entry file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
    /// Whether the plugin must run sandboxed. Defaults to true; only
    /// first-party plugins may opt out.
    #[serde(default = "default_sandboxed")]
    pub sandboxed: bool,
    /// Capabilities the plugin requests.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Declarative extension points.
    #[serde(default)]
    pub contributes: Contributions,
    /// Free-form configuration schema, passed through to the UI layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
}

fn default_sandboxed() -> bool {
    true
}

impl PluginManifest {
    /// Loads and parses a manifest file.
    pub async fn load(path: &Path) -> HostResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PluginHostError::ManifestNotFound(path.display().to_string())
            } else {
                PluginHostError::Io(e)
            }
        })?;
        let manifest: Self = serde_json::from_str(&text)
            .map_err(|e| PluginHostError::ManifestInvalid(format!("{}: {e}", path.display())))?;
        if manifest.id.is_empty() {
            return Err(PluginHostError::ManifestInvalid(format!(
                "{}: empty plugin id",
                path.display()
            )));
        }
        Ok(manifest)
    }
}

/// Declarative contributions a plugin exposes via manifest data alone.
///
/// The host registers these without invoking the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Contributions {
    pub commands: Vec<CommandContribution>,
    pub keybindings: Vec<KeybindingContribution>,
    pub snippets: Vec<SnippetContribution>,
    pub themes: Vec<ThemeContribution>,
    pub languages: Vec<LanguageContribution>,
    pub wasm_languages: Vec<WasmLanguageContribution>,
}

impl Contributions {
    /// Total number of declared contributions across all kinds.
    pub fn len(&self) -> usize {
        self.commands.len()
            + self.keybindings.len()
            + self.snippets.len()
            + self.themes.len()
            + self.languages.len()
            + self.wasm_languages.len()
    }

    /// Whether no contributions are declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A command surfaced in the command palette.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContribution {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keybinding: Option<String>,
}

/// A standalone keybinding mapped to an existing command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeybindingContribution {
    pub key: String,
    pub command: String,
}

/// An editor snippet for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetContribution {
    pub language: String,
    pub prefix: String,
    pub body: String,
}

/// An editor color theme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeContribution {
    pub id: String,
    pub label: String,
    /// Theme definition file, relative to the plugin directory.
    pub path: String,
}

/// A text-language registration (highlighting and file association are
/// handled by the editor layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageContribution {
    pub id: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// An executable-language runtime shipped as a wasm module.
///
/// The runtime module exposes run/stdout/stderr entry points; the host
/// only records where to find it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmLanguageContribution {
    /// Language id this runtime executes.
    pub id: String,
    /// Runtime wasm module, relative to the plugin directory.
    pub runtime: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}
