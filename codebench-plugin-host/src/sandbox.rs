//! The in-process VM sandbox seam.
//!
//! The restricted execution context itself (interpreter, capability
//! shims) is an external collaborator. The host describes what it needs
//! via [`SandboxSpec`] (permission scoping and a hard execution timeout)
//! and drives the returned [`SandboxHandle`] through module load and
//! disposal.

use crate::error::HostResult;
use crate::loader::PluginModule;
use crate::permissions::PermissionSet;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// What the host asks of a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Plugin this sandbox belongs to.
    pub plugin_id: String,
    /// Capabilities exposed inside the context.
    pub permissions: PermissionSet,
    /// Hard wall-clock bound on plugin execution inside the sandbox.
    pub timeout: Duration,
}

/// A live restricted execution context for one plugin.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Wraps `source` in a module-export shim, executes it inside the
    /// sandbox, and returns the resulting module.
    async fn load_module(&self, source: &str) -> HostResult<Arc<dyn PluginModule>>;

    /// Tears the context down. Idempotent.
    async fn dispose(&self);
}

/// Creates sandboxes on demand.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, spec: SandboxSpec) -> HostResult<Box<dyn SandboxHandle>>;
}

/// Test doubles for the sandbox seam.
pub mod mock {
    use super::*;
    use crate::error::PluginHostError;
    use crate::loader::mock::MockModule;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Observable state of one created mock sandbox.
    #[derive(Debug)]
    pub struct SandboxProbe {
        /// The spec the host asked for.
        pub spec: SandboxSpec,
        /// The module served from this sandbox.
        pub module: Arc<MockModule>,
        disposed: AtomicBool,
    }

    impl SandboxProbe {
        pub fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
    }

    /// Records every sandbox it creates for later inspection.
    #[derive(Debug, Default)]
    pub struct MockSandboxFactory {
        probes: Mutex<Vec<Arc<SandboxProbe>>>,
        fail_create: AtomicBool,
        fail_activate_next: AtomicBool,
    }

    impl MockSandboxFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Makes every subsequent `create` fail.
        pub fn fail_create(&self) {
            self.fail_create.store(true, Ordering::SeqCst);
        }

        /// Makes the next created sandbox serve a module whose activate
        /// hook fails.
        pub fn fail_activate_next(&self) {
            self.fail_activate_next.store(true, Ordering::SeqCst);
        }

        pub fn created_count(&self) -> usize {
            self.probes.lock().map(|p| p.len()).unwrap_or(0)
        }

        pub fn last_probe(&self) -> Option<Arc<SandboxProbe>> {
            self.probes.lock().ok().and_then(|p| p.last().cloned())
        }
    }

    #[async_trait]
    impl SandboxFactory for MockSandboxFactory {
        async fn create(&self, spec: SandboxSpec) -> HostResult<Box<dyn SandboxHandle>> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(PluginHostError::Sandbox {
                    plugin_id: spec.plugin_id.clone(),
                    message: "mock sandbox creation failure".into(),
                });
            }
            let module = if self.fail_activate_next.swap(false, Ordering::SeqCst) {
                MockModule::failing_activate()
            } else {
                MockModule::new()
            };
            let probe = Arc::new(SandboxProbe {
                spec,
                module,
                disposed: AtomicBool::new(false),
            });
            if let Ok(mut probes) = self.probes.lock() {
                probes.push(probe.clone());
            }
            Ok(Box::new(MockSandbox { probe }))
        }
    }

    struct MockSandbox {
        probe: Arc<SandboxProbe>,
    }

    #[async_trait]
    impl SandboxHandle for MockSandbox {
        async fn load_module(&self, _source: &str) -> HostResult<Arc<dyn PluginModule>> {
            Ok(self.probe.module.clone())
        }

        async fn dispose(&self) {
            self.probe.disposed.store(true, Ordering::SeqCst);
        }
    }
}
