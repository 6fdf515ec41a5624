//! Central plugin lifecycle orchestrator.
//!
//! Owns per-plugin status, the contribution registry, and the two
//! activation sets: `active` (direct-loaded or VM-sandboxed modules held
//! in-process) and `isolated` (ids delegated to the worker process). A
//! plugin is never in both: activation is idempotent and early-returns
//! if the id is already live anywhere.
//!
//! Isolation tier is resolved once per activation, in fixed priority
//! order: trusted direct load, process isolation, VM sandbox fallback.

use crate::contributions::ContributionRegistry;
use crate::error::{HostResult, PluginHostError};
use crate::loader::{ModuleLoader, PluginContext, PluginModule, PluginStore};
use crate::manifest::{Contributions, PluginManifest};
use crate::permissions::PermissionSet;
use crate::process::PluginProcessManager;
use crate::sandbox::{SandboxFactory, SandboxHandle, SandboxSpec};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Configuration for the plugin host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory scanned for plugin subdirectories.
    pub plugins_dir: PathBuf,
    /// Global feature flag for the process-isolation tier.
    pub process_isolation: bool,
    /// Hard execution bound for the in-process VM sandbox.
    pub sandbox_timeout: Duration,
}

impl HostConfig {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            process_isolation: true,
            sandbox_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle status of a discovered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Installed,
    Active,
    Disabled,
    Error,
}

/// Everything the UI needs to know about one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub manifest: PluginManifest,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<u64>,
}

/// The security boundary a plugin activates under.
///
/// Resolved once per activation so the policy is auditable in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationTier {
    /// Trusted: imported directly into the host process.
    DirectLoad,
    /// Untrusted: delegated to the isolated worker process.
    ProcessIsolated,
    /// Untrusted: in-process restricted context.
    VmSandboxed,
}

/// Notifications pushed to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Some plugin's status changed; re-query the list.
    PluginListChanged,
}

/// A plugin live in the host process (direct-loaded or VM-sandboxed).
struct ActivePlugin {
    module: Arc<dyn PluginModule>,
    /// Present only for the VM-sandbox tier.
    sandbox: Option<Box<dyn SandboxHandle>>,
}

/// Orchestrates plugin discovery, activation, isolation, and teardown.
pub struct PluginHost {
    config: HostConfig,
    loader: Arc<dyn ModuleLoader>,
    sandbox_factory: Arc<dyn SandboxFactory>,
    process: PluginProcessManager,
    plugins: RwLock<HashMap<String, PluginInfo>>,
    active: RwLock<HashMap<String, ActivePlugin>>,
    isolated: RwLock<HashSet<String>>,
    contributions: RwLock<ContributionRegistry>,
    storage: PluginStore,
    reload_counts: std::sync::Mutex<HashMap<String, u32>>,
    events: broadcast::Sender<HostEvent>,
}

impl PluginHost {
    pub fn new(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        sandbox_factory: Arc<dyn SandboxFactory>,
        process: PluginProcessManager,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            loader,
            sandbox_factory,
            process,
            plugins: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            contributions: RwLock::new(ContributionRegistry::new()),
            storage: PluginStore::new(),
            reload_counts: std::sync::Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to "plugin list changed" pushes.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// The per-plugin key-value storage.
    pub fn storage(&self) -> &PluginStore {
        &self.storage
    }

    /// The process manager backing the isolation tier.
    pub fn process_manager(&self) -> &PluginProcessManager {
        &self.process
    }

    // ================================================================
    // Discovery
    // ================================================================

    /// Scans the plugins directory for `<dir>/manifest.json` descriptors.
    ///
    /// Invalid manifests are logged and skipped; they never abort the
    /// scan. Re-discovery refreshes manifests of known plugins without
    /// touching their status.
    pub async fn discover_plugins(&self) -> HostResult<Vec<String>> {
        let mut discovered = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.plugins_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            let manifest_path = entry.path().join("manifest.json");
            match PluginManifest::load(&manifest_path).await {
                Ok(manifest) => {
                    let id = manifest.id.clone();
                    let mut plugins = self.plugins.write().await;
                    match plugins.get_mut(&id) {
                        Some(info) => info.manifest = manifest,
                        None => {
                            plugins.insert(
                                id.clone(),
                                PluginInfo {
                                    manifest,
                                    status: PluginStatus::Installed,
                                    error: None,
                                    loaded_at: None,
                                },
                            );
                        }
                    }
                    discovered.push(id);
                }
                Err(PluginHostError::ManifestNotFound(_)) => {
                    debug!(dir = %entry.path().display(), "no manifest; skipping directory");
                }
                Err(e) => {
                    warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "skipping plugin with invalid manifest"
                    );
                }
            }
        }

        info!(count = discovered.len(), "plugin discovery complete");
        self.notify();
        Ok(discovered)
    }

    /// Registers a plugin from an already-parsed manifest (built-ins,
    /// tests).
    pub async fn register_plugin(&self, manifest: PluginManifest) {
        let id = manifest.id.clone();
        self.plugins.write().await.insert(
            id.clone(),
            PluginInfo {
                manifest,
                status: PluginStatus::Installed,
                error: None,
                loaded_at: None,
            },
        );
        debug!(plugin_id = %id, "plugin registered");
        self.notify();
    }

    // ================================================================
    // Queries
    // ================================================================

    /// All known plugins, sorted by id.
    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self.plugins.read().await.values().cloned().collect();
        plugins.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        plugins
    }

    pub async fn plugin_info(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.plugins.read().await.get(plugin_id).cloned()
    }

    pub async fn plugin_count(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Whether the plugin is live in either activation set.
    pub async fn is_active(&self, plugin_id: &str) -> bool {
        if self.active.read().await.contains_key(plugin_id) {
            return true;
        }
        self.isolated.read().await.contains(plugin_id)
    }

    /// Read access to the contribution registry.
    pub async fn contributions(&self) -> RwLockReadGuard<'_, ContributionRegistry> {
        self.contributions.read().await
    }

    // ================================================================
    // Activation
    // ================================================================

    /// Resolves the isolation tier for a manifest, in fixed priority
    /// order.
    pub fn resolve_isolation(&self, manifest: &PluginManifest) -> IsolationTier {
        if !manifest.sandboxed {
            return IsolationTier::DirectLoad;
        }
        if self.config.process_isolation && self.process.is_ready() {
            return IsolationTier::ProcessIsolated;
        }
        IsolationTier::VmSandboxed
    }

    /// Activates a plugin under its resolved isolation tier.
    ///
    /// Idempotent: a plugin that is already live in either set is left
    /// untouched and its entry point never runs twice. Failures are
    /// recorded as the plugin's error status and re-thrown.
    pub async fn activate_plugin(&self, plugin_id: &str) -> HostResult<()> {
        if self.is_active(plugin_id).await {
            debug!(plugin_id = %plugin_id, "plugin already active; skipping activation");
            return Ok(());
        }

        let manifest = self
            .plugin_info(plugin_id)
            .await
            .map(|info| info.manifest)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;

        let tier = self.resolve_isolation(&manifest);
        info!(plugin_id = %plugin_id, ?tier, "activating plugin");

        match self.activate_with_tier(&manifest, tier).await {
            Ok(()) => {
                self.set_status(plugin_id, PluginStatus::Active, None, Some(wall_ms()))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.set_status(plugin_id, PluginStatus::Error, Some(e.to_string()), None)
                    .await;
                Err(e)
            }
        }
    }

    async fn activate_with_tier(
        &self,
        manifest: &PluginManifest,
        tier: IsolationTier,
    ) -> HostResult<()> {
        let plugin_id = manifest.id.clone();
        let entry = self
            .config
            .plugins_dir
            .join(&plugin_id)
            .join(&manifest.main);

        match tier {
            IsolationTier::DirectLoad => {
                // Security-relevant: the plugin gets full host access.
                warn!(plugin_id = %plugin_id, "loading trusted plugin without a sandbox");
                let cache_bust = self.reload_count(&plugin_id);
                let module = self.loader.load(&entry, cache_bust).await?;

                let context = PluginContext::new(plugin_id.clone(), self.storage.clone());
                self.register_contributions(&plugin_id, &manifest.contributes)
                    .await;
                if let Err(e) = module.activate(&context).await {
                    self.unregister_contributions(&plugin_id).await;
                    return Err(e);
                }
                self.active
                    .write()
                    .await
                    .insert(plugin_id, ActivePlugin {
                        module,
                        sandbox: None,
                    });
            }

            IsolationTier::ProcessIsolated => {
                let source = read_entry_source(&plugin_id, &entry).await?;
                self.register_contributions(&plugin_id, &manifest.contributes)
                    .await;
                if let Err(e) = self
                    .process
                    .activate_plugin(&plugin_id, source, manifest.permissions.clone())
                    .await
                {
                    self.unregister_contributions(&plugin_id).await;
                    return Err(e);
                }
                self.isolated.write().await.insert(plugin_id);
            }

            IsolationTier::VmSandboxed => {
                let source = read_entry_source(&plugin_id, &entry).await?;
                let spec = SandboxSpec {
                    plugin_id: plugin_id.clone(),
                    permissions: PermissionSet::from_declared(&manifest.permissions),
                    timeout: self.config.sandbox_timeout,
                };
                let sandbox = self.sandbox_factory.create(spec).await?;
                let module = match sandbox.load_module(&source).await {
                    Ok(module) => module,
                    Err(e) => {
                        sandbox.dispose().await;
                        return Err(e);
                    }
                };

                let context = PluginContext::new(plugin_id.clone(), self.storage.clone());
                self.register_contributions(&plugin_id, &manifest.contributes)
                    .await;
                if let Err(e) = module.activate(&context).await {
                    self.unregister_contributions(&plugin_id).await;
                    sandbox.dispose().await;
                    return Err(e);
                }
                self.active
                    .write()
                    .await
                    .insert(plugin_id, ActivePlugin {
                        module,
                        sandbox: Some(sandbox),
                    });
            }
        }
        Ok(())
    }

    // ================================================================
    // Deactivation / reload
    // ================================================================

    /// Deactivates a plugin.
    ///
    /// The plugin's own deactivate hook may fail; contribution teardown
    /// happens regardless and is never skipped.
    pub async fn deactivate_plugin(&self, plugin_id: &str) -> HostResult<()> {
        if !self.plugins.read().await.contains_key(plugin_id) {
            return Err(PluginHostError::PluginNotFound(plugin_id.to_string()));
        }

        let was_isolated = self.isolated.write().await.remove(plugin_id);
        if was_isolated {
            if let Err(e) = self.process.deactivate_plugin(plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "worker deactivation failed");
            }
        } else {
            let removed = self.active.write().await.remove(plugin_id);
            if let Some(active) = removed {
                if let Err(e) = active.module.deactivate().await {
                    warn!(plugin_id = %plugin_id, error = %e, "plugin deactivate hook failed");
                }
                if let Some(sandbox) = active.sandbox {
                    sandbox.dispose().await;
                }
            }
        }

        self.unregister_contributions(plugin_id).await;
        self.set_status(plugin_id, PluginStatus::Disabled, None, None)
            .await;
        info!(plugin_id = %plugin_id, "plugin deactivated");
        Ok(())
    }

    /// Hot-reload: deactivate, re-read the manifest, reactivate.
    ///
    /// A manifest re-read failure aborts the reload; the host never
    /// reactivates from stale state. A reactivation failure is caught
    /// and logged (the plugin's status records it); it does not affect
    /// other plugins.
    pub async fn reload_plugin(&self, plugin_id: &str) -> HostResult<()> {
        info!(plugin_id = %plugin_id, "reloading plugin");
        if self.is_active(plugin_id).await {
            self.deactivate_plugin(plugin_id).await?;
        }

        let manifest_path = self
            .config
            .plugins_dir
            .join(plugin_id)
            .join("manifest.json");
        let manifest = PluginManifest::load(&manifest_path).await?;
        if manifest.id != plugin_id {
            return Err(PluginHostError::ManifestInvalid(format!(
                "manifest id '{}' does not match plugin '{plugin_id}'",
                manifest.id
            )));
        }
        if let Some(info) = self.plugins.write().await.get_mut(plugin_id) {
            info.manifest = manifest;
        }

        if let Ok(mut counts) = self.reload_counts.lock() {
            *counts.entry(plugin_id.to_string()).or_insert(0) += 1;
        }

        if let Err(e) = self.activate_plugin(plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "reactivation after reload failed");
        }
        Ok(())
    }

    // ================================================================
    // Internals
    // ================================================================

    fn reload_count(&self, plugin_id: &str) -> u32 {
        self.reload_counts
            .lock()
            .map(|counts| counts.get(plugin_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    async fn register_contributions(&self, plugin_id: &str, contributes: &Contributions) {
        self.contributions
            .write()
            .await
            .register_all(plugin_id, contributes);
    }

    async fn unregister_contributions(&self, plugin_id: &str) {
        self.contributions
            .write()
            .await
            .unregister_plugin(plugin_id);
    }

    async fn set_status(
        &self,
        plugin_id: &str,
        status: PluginStatus,
        error: Option<String>,
        loaded_at: Option<u64>,
    ) {
        if let Some(info) = self.plugins.write().await.get_mut(plugin_id) {
            info.status = status;
            info.error = error;
            info.loaded_at = loaded_at;
        }
        self.notify();
    }

    fn notify(&self) {
        // No receivers is fine; the UI subscribes when it cares.
        let _ = self.events.send(HostEvent::PluginListChanged);
    }
}

async fn read_entry_source(plugin_id: &str, entry: &std::path::Path) -> HostResult<String> {
    tokio::fs::read_to_string(entry)
        .await
        .map_err(|e| PluginHostError::ActivationFailed {
            plugin_id: plugin_id.to_string(),
            message: format!("failed to read {}: {e}", entry.display()),
        })
}
