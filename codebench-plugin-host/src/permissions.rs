//! Capability-based permission model for playground plugins.
//!
//! Three tiers:
//! - Tier 1: Always granted (logger, storage, commands)
//! - Tier 2: Just-in-time prompted (editor, ui, clipboard)
//! - Tier 3: Install-time reviewed (filesystem, network, shell)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Individual capability a plugin may hold.
///
/// The kebab-case form is what appears in `permissions` arrays in plugin
/// manifests and on the worker wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    // Tier 1 — always granted
    Logger,
    Storage,
    Commands,

    // Tier 2 — just-in-time
    Editor,
    Ui,
    Clipboard,

    // Tier 3 — install-time
    Filesystem,
    Network,
    Shell,
}

impl Permission {
    /// Returns the tier for this permission.
    pub fn tier(&self) -> PermissionTier {
        match self {
            Self::Logger | Self::Storage | Self::Commands => PermissionTier::AlwaysGranted,
            Self::Editor | Self::Ui | Self::Clipboard => PermissionTier::JustInTime,
            Self::Filesystem | Self::Network | Self::Shell => PermissionTier::InstallTime,
        }
    }

    /// Returns the capability name used in manifests and on the wire.
    pub fn capability_name(&self) -> &'static str {
        match self {
            Self::Logger => "logger",
            Self::Storage => "storage",
            Self::Commands => "commands",
            Self::Editor => "editor",
            Self::Ui => "ui",
            Self::Clipboard => "clipboard",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Shell => "shell",
        }
    }
}

/// Permission tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    AlwaysGranted,
    JustInTime,
    InstallTime,
}

/// Set of permissions granted to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: HashSet<Permission>,
    /// Permissions denied by user or policy (never prompt again).
    denied: HashSet<Permission>,
}

impl PermissionSet {
    /// Creates a set with only Tier 1 permissions granted.
    pub fn baseline() -> Self {
        let granted = [Permission::Logger, Permission::Storage, Permission::Commands]
            .into_iter()
            .collect();
        Self {
            granted,
            denied: HashSet::new(),
        }
    }

    /// Creates a set from a manifest's declared permissions, on top of
    /// the always-granted baseline.
    pub fn from_declared(declared: &[Permission]) -> Self {
        let mut set = Self::baseline();
        for permission in declared {
            set.grant(*permission);
        }
        set
    }

    /// Creates a set with every permission granted (trusted plugins,
    /// tests).
    pub fn all_granted() -> Self {
        let granted = [
            Permission::Logger,
            Permission::Storage,
            Permission::Commands,
            Permission::Editor,
            Permission::Ui,
            Permission::Clipboard,
            Permission::Filesystem,
            Permission::Network,
            Permission::Shell,
        ]
        .into_iter()
        .collect();
        Self {
            granted,
            denied: HashSet::new(),
        }
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn is_denied(&self, permission: Permission) -> bool {
        self.denied.contains(&permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.denied.remove(&permission);
        self.granted.insert(permission);
    }

    pub fn deny(&mut self, permission: Permission) {
        self.granted.remove(&permission);
        self.denied.insert(permission);
    }

    /// Check if a permission needs JIT prompting (Tier 2, not yet decided).
    pub fn needs_jit_prompt(&self, permission: Permission) -> bool {
        permission.tier() == PermissionTier::JustInTime
            && !self.granted.contains(&permission)
            && !self.denied.contains(&permission)
    }

    /// Returns all granted permissions.
    pub fn granted_permissions(&self) -> &HashSet<Permission> {
        &self.granted
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::baseline()
    }
}
