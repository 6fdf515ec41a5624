//! Trusted module loading and the plugin-facing context.
//!
//! Direct (unsandboxed) loading is an external collaborator: the host
//! only decides *when* to load, via [`ModuleLoader`], and what a loaded
//! module must expose, via [`PluginModule`]. The [`PluginContext`] passed
//! to a module's activate hook scopes host services to that plugin.

use crate::error::HostResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Flat per-plugin key-value storage, held in host memory only.
///
/// Not persisted across host restarts. Cheap to clone; clones share the
/// same storage.
#[derive(Debug, Clone, Default)]
pub struct PluginStore {
    inner: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.inner
            .read()
            .ok()?
            .get(plugin_id)
            .and_then(|ns| ns.get(key).cloned())
    }

    pub fn set(&self, plugin_id: &str, key: &str, value: Value) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .entry(plugin_id.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
    }

    pub fn remove(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.inner
            .write()
            .ok()?
            .get_mut(plugin_id)
            .and_then(|ns| ns.remove(key))
    }

    /// Drops a plugin's entire namespace.
    pub fn clear_plugin(&self, plugin_id: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.remove(plugin_id);
        }
    }

    pub fn keys(&self, plugin_id: &str) -> Vec<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.get(plugin_id).map(|ns| ns.keys().cloned().collect()))
            .unwrap_or_default()
    }
}

/// What a plugin's `activate` hook receives: host services scoped to
/// that plugin id.
#[derive(Debug, Clone)]
pub struct PluginContext {
    plugin_id: String,
    store: PluginStore,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>, store: PluginStore) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            store,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn storage_get(&self, key: &str) -> Option<Value> {
        self.store.get(&self.plugin_id, key)
    }

    pub fn storage_set(&self, key: &str, value: Value) {
        self.store.set(&self.plugin_id, key, value);
    }

    pub fn storage_remove(&self, key: &str) -> Option<Value> {
        self.store.remove(&self.plugin_id, key)
    }

    /// Plugin-tagged log line.
    pub fn log(&self, message: &str) {
        info!(plugin_id = %self.plugin_id, "{message}");
    }
}

/// A loaded plugin module's lifecycle hooks.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Runs the plugin's activation entry point.
    async fn activate(&self, context: &PluginContext) -> HostResult<()>;

    /// Runs the plugin's deactivation entry point.
    async fn deactivate(&self) -> HostResult<()>;
}

/// Loads trusted plugin entry files directly into the host process.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Loads the module at `entry`.
    ///
    /// `cache_bust` increments on every hot-reload of the same plugin so
    /// the loader's own module cache cannot serve a stale copy.
    async fn load(&self, entry: &Path, cache_bust: u32) -> HostResult<Arc<dyn PluginModule>>;
}

/// Test doubles for the loader seam.
pub mod mock {
    use super::*;
    use crate::error::PluginHostError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A plugin module spy: counts hook invocations, optionally fails.
    #[derive(Debug, Default)]
    pub struct MockModule {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        fail_activate: AtomicBool,
        fail_deactivate: AtomicBool,
    }

    impl MockModule {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing_activate() -> Arc<Self> {
            let module = Self::default();
            module.fail_activate.store(true, Ordering::SeqCst);
            Arc::new(module)
        }

        pub fn failing_deactivate() -> Arc<Self> {
            let module = Self::default();
            module.fail_deactivate.store(true, Ordering::SeqCst);
            Arc::new(module)
        }

        pub fn activations(&self) -> usize {
            self.activations.load(Ordering::SeqCst)
        }

        pub fn deactivations(&self) -> usize {
            self.deactivations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PluginModule for MockModule {
        async fn activate(&self, context: &PluginContext) -> HostResult<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.fail_activate.load(Ordering::SeqCst) {
                return Err(PluginHostError::ActivationFailed {
                    plugin_id: context.plugin_id().to_string(),
                    message: "mock activate failure".into(),
                });
            }
            Ok(())
        }

        async fn deactivate(&self) -> HostResult<()> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            if self.fail_deactivate.load(Ordering::SeqCst) {
                return Err(PluginHostError::ActivationFailed {
                    plugin_id: "mock".into(),
                    message: "mock deactivate failure".into(),
                });
            }
            Ok(())
        }
    }

    /// Records every load and hands out fresh [`MockModule`]s.
    #[derive(Debug, Default)]
    pub struct MockLoader {
        loads: Mutex<Vec<(PathBuf, u32, Arc<MockModule>)>>,
        fail_activate_next: AtomicBool,
        fail_deactivate_next: AtomicBool,
    }

    impl MockLoader {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Makes the next loaded module fail its activate hook.
        pub fn fail_activate_next(&self) {
            self.fail_activate_next.store(true, Ordering::SeqCst);
        }

        /// Makes the next loaded module fail its deactivate hook.
        pub fn fail_deactivate_next(&self) {
            self.fail_deactivate_next.store(true, Ordering::SeqCst);
        }

        pub fn load_count(&self) -> usize {
            self.loads.lock().map(|l| l.len()).unwrap_or(0)
        }

        /// The module produced by the most recent load.
        pub fn last_module(&self) -> Option<Arc<MockModule>> {
            self.loads
                .lock()
                .ok()
                .and_then(|l| l.last().map(|(_, _, m)| m.clone()))
        }

        /// Cache-bust values observed, in load order.
        pub fn cache_busts(&self) -> Vec<u32> {
            self.loads
                .lock()
                .map(|l| l.iter().map(|(_, bust, _)| *bust).collect())
                .unwrap_or_default()
        }

        /// Entry paths observed, in load order.
        pub fn entries(&self) -> Vec<PathBuf> {
            self.loads
                .lock()
                .map(|l| l.iter().map(|(path, _, _)| path.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModuleLoader for MockLoader {
        async fn load(&self, entry: &Path, cache_bust: u32) -> HostResult<Arc<dyn PluginModule>> {
            let module = if self.fail_activate_next.swap(false, Ordering::SeqCst) {
                MockModule::failing_activate()
            } else if self.fail_deactivate_next.swap(false, Ordering::SeqCst) {
                MockModule::failing_deactivate()
            } else {
                MockModule::new()
            };
            if let Ok(mut loads) = self.loads.lock() {
                loads.push((entry.to_path_buf(), cache_bust, module.clone()));
            }
            Ok(module)
        }
    }
}
