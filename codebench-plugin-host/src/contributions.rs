//! Declarative contribution registry.
//!
//! Contributions are indexed two ways: per kind by capability id (command
//! id, key chord, theme id, ...) for lookup, and per plugin id for
//! teardown. Unregistering a plugin touches only its own contributions.
//!
//! Registration conflicts (two plugins claiming the same id) resolve
//! first-wins: the loser is logged and skipped, and only successfully
//! registered keys are recorded against the plugin, so teardown is an
//! exact inverse of registration.

use crate::manifest::{
    CommandContribution, Contributions, KeybindingContribution, LanguageContribution,
    SnippetContribution, ThemeContribution, WasmLanguageContribution,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// The kinds of declarative contribution a plugin can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContributionKind {
    Command,
    Keybinding,
    Snippet,
    Theme,
    Language,
    WasmLanguage,
}

/// A contribution stored with its owning plugin.
#[derive(Debug, Clone)]
struct Registered<T> {
    plugin_id: String,
    contribution: T,
}

/// Registry of all declarative contributions from active plugins.
#[derive(Debug, Default)]
pub struct ContributionRegistry {
    commands: HashMap<String, Registered<CommandContribution>>,
    keybindings: HashMap<String, Registered<KeybindingContribution>>,
    /// Keyed by `"<language>:<prefix>"`.
    snippets: HashMap<String, Registered<SnippetContribution>>,
    themes: HashMap<String, Registered<ThemeContribution>>,
    languages: HashMap<String, Registered<LanguageContribution>>,
    wasm_languages: HashMap<String, Registered<WasmLanguageContribution>>,
    /// Per-plugin index of everything that plugin registered.
    by_plugin: HashMap<String, Vec<(ContributionKind, String)>>,
}

impl ContributionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every contribution a manifest declares.
    ///
    /// Returns the number actually registered (conflicts are skipped).
    pub fn register_all(&mut self, plugin_id: &str, contributes: &Contributions) -> usize {
        let mut registered = 0;

        for command in &contributes.commands {
            registered += self.insert(
                ContributionKind::Command,
                plugin_id,
                command.id.clone(),
                command.clone(),
            );
        }
        for keybinding in &contributes.keybindings {
            registered += self.insert(
                ContributionKind::Keybinding,
                plugin_id,
                keybinding.key.clone(),
                keybinding.clone(),
            );
        }
        for snippet in &contributes.snippets {
            let key = format!("{}:{}", snippet.language, snippet.prefix);
            registered += self.insert(ContributionKind::Snippet, plugin_id, key, snippet.clone());
        }
        for theme in &contributes.themes {
            registered += self.insert(
                ContributionKind::Theme,
                plugin_id,
                theme.id.clone(),
                theme.clone(),
            );
        }
        for language in &contributes.languages {
            registered += self.insert(
                ContributionKind::Language,
                plugin_id,
                language.id.clone(),
                language.clone(),
            );
        }
        for wasm_language in &contributes.wasm_languages {
            registered += self.insert(
                ContributionKind::WasmLanguage,
                plugin_id,
                wasm_language.id.clone(),
                wasm_language.clone(),
            );
        }

        debug!(plugin_id = %plugin_id, registered, "registered plugin contributions");
        registered
    }

    /// Removes every contribution the plugin registered.
    ///
    /// Returns the number removed. Safe to call for plugins that never
    /// registered anything.
    pub fn unregister_plugin(&mut self, plugin_id: &str) -> usize {
        let Some(keys) = self.by_plugin.remove(plugin_id) else {
            return 0;
        };
        let removed = keys.len();
        for (kind, key) in keys {
            match kind {
                ContributionKind::Command => {
                    self.commands.remove(&key);
                }
                ContributionKind::Keybinding => {
                    self.keybindings.remove(&key);
                }
                ContributionKind::Snippet => {
                    self.snippets.remove(&key);
                }
                ContributionKind::Theme => {
                    self.themes.remove(&key);
                }
                ContributionKind::Language => {
                    self.languages.remove(&key);
                }
                ContributionKind::WasmLanguage => {
                    self.wasm_languages.remove(&key);
                }
            }
        }
        debug!(plugin_id = %plugin_id, removed, "unregistered plugin contributions");
        removed
    }

    // ================================================================
    // Lookups
    // ================================================================

    pub fn command(&self, id: &str) -> Option<&CommandContribution> {
        self.commands.get(id).map(|r| &r.contribution)
    }

    pub fn keybinding(&self, key: &str) -> Option<&KeybindingContribution> {
        self.keybindings.get(key).map(|r| &r.contribution)
    }

    pub fn theme(&self, id: &str) -> Option<&ThemeContribution> {
        self.themes.get(id).map(|r| &r.contribution)
    }

    pub fn language(&self, id: &str) -> Option<&LanguageContribution> {
        self.languages.get(id).map(|r| &r.contribution)
    }

    pub fn wasm_language(&self, id: &str) -> Option<&WasmLanguageContribution> {
        self.wasm_languages.get(id).map(|r| &r.contribution)
    }

    /// All snippets registered for a language.
    pub fn snippets_for_language(&self, language: &str) -> Vec<&SnippetContribution> {
        self.snippets
            .values()
            .filter(|r| r.contribution.language == language)
            .map(|r| &r.contribution)
            .collect()
    }

    /// All commands, with their owning plugin ids (command palette feed).
    pub fn all_commands(&self) -> Vec<(&str, &CommandContribution)> {
        self.commands
            .values()
            .map(|r| (r.plugin_id.as_str(), &r.contribution))
            .collect()
    }

    /// The language registered for a file extension, if any.
    pub fn language_for_extension(&self, extension: &str) -> Option<&LanguageContribution> {
        self.languages
            .values()
            .map(|r| &r.contribution)
            .find(|language| language.extensions.iter().any(|e| e == extension))
    }

    /// Number of contributions a plugin currently has registered.
    pub fn count_for_plugin(&self, plugin_id: &str) -> usize {
        self.by_plugin.get(plugin_id).map_or(0, Vec::len)
    }

    /// Total registered contributions across all plugins.
    pub fn len(&self) -> usize {
        self.by_plugin.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of<T>(
        map: &mut HashMap<String, Registered<T>>,
        kind: ContributionKind,
        plugin_id: &str,
        key: String,
        contribution: T,
    ) -> Option<(ContributionKind, String)> {
        if let Some(existing) = map.get(&key) {
            warn!(
                plugin_id = %plugin_id,
                owner = %existing.plugin_id,
                key = %key,
                ?kind,
                "contribution id already registered; skipping"
            );
            return None;
        }
        map.insert(
            key.clone(),
            Registered {
                plugin_id: plugin_id.to_string(),
                contribution,
            },
        );
        Some((kind, key))
    }

    fn insert<T>(
        &mut self,
        kind: ContributionKind,
        plugin_id: &str,
        key: String,
        contribution: T,
    ) -> usize
    where
        T: RegistryKind,
    {
        let slot = T::map(self);
        match Self::index_of(slot, kind, plugin_id, key, contribution) {
            Some(entry) => {
                self.by_plugin
                    .entry(plugin_id.to_string())
                    .or_default()
                    .push(entry);
                1
            }
            None => 0,
        }
    }
}

/// Maps each contribution payload type to its arena in the registry.
trait RegistryKind: Sized {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>>;
}

impl RegistryKind for CommandContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.commands
    }
}

impl RegistryKind for KeybindingContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.keybindings
    }
}

impl RegistryKind for SnippetContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.snippets
    }
}

impl RegistryKind for ThemeContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.themes
    }
}

impl RegistryKind for LanguageContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.languages
    }
}

impl RegistryKind for WasmLanguageContribution {
    fn map(registry: &mut ContributionRegistry) -> &mut HashMap<String, Registered<Self>> {
        &mut registry.wasm_languages
    }
}
