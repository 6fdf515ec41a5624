//! Integration tests for plugin lifecycle and isolation-tier routing.

use codebench_plugin_host::loader_mock::MockLoader;
use codebench_plugin_host::process_mock::{ScriptedLauncher, WorkerBehavior};
use codebench_plugin_host::sandbox_mock::MockSandboxFactory;
use codebench_plugin_host::{
    HostConfig, HostEvent, IsolationTier, PluginHost, PluginHostError, PluginProcessManager,
    PluginStatus, ProcessManagerConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _dir: tempfile::TempDir,
    host: PluginHost,
    loader: Arc<MockLoader>,
    sandboxes: Arc<MockSandboxFactory>,
    launcher: Arc<ScriptedLauncher>,
}

fn fixture(process_isolation: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let loader = MockLoader::new();
    let sandboxes = MockSandboxFactory::new();
    let launcher = ScriptedLauncher::new(WorkerBehavior::Responsive);
    let manager = PluginProcessManager::new(
        launcher.clone(),
        ProcessManagerConfig {
            request_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(100),
            max_restart_attempts: 3,
            restart_delay: Duration::from_millis(10),
        },
    );

    let mut config = HostConfig::new(dir.path());
    config.process_isolation = process_isolation;
    let host = PluginHost::new(config, loader.clone(), sandboxes.clone(), manager);

    Fixture {
        _dir: dir,
        host,
        loader,
        sandboxes,
        launcher,
    }
}

/// Writes `<plugins_dir>/<id>/manifest.json` plus an entry file.
fn write_plugin(plugins_dir: &Path, id: &str, sandboxed: bool, contributes: &str) {
    let plugin_dir = plugins_dir.join(id);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let manifest = format!(
        r#"{{
            "id": "{id}",
            "name": "Test plugin {id}",
            "version": "1.0.0",
            "main": "index.js",
            "sandboxed": {sandboxed},
            "permissions": ["editor"],
            "contributes": {contributes}
        }}"#
    );
    std::fs::write(plugin_dir.join("manifest.json"), manifest).unwrap();
    std::fs::write(
        plugin_dir.join("index.js"),
        "module.exports = { activate() {}, deactivate() {} };",
    )
    .unwrap();
}

fn plugins_dir(fixture: &Fixture) -> std::path::PathBuf {
    fixture._dir.path().to_path_buf()
}

const NO_CONTRIBUTIONS: &str = "{}";
const COMMAND_CONTRIBUTIONS: &str = r#"{
    "commands": [{"id": "test.run", "title": "Run Test"}],
    "keybindings": [{"key": "ctrl+t", "command": "test.run"}]
}"#;

#[tokio::test]
async fn activation_is_idempotent() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "acme.tool", true, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    fx.host.activate_plugin("acme.tool").await.unwrap();
    fx.host.activate_plugin("acme.tool").await.unwrap();

    // Exactly one sandbox, exactly one activate-hook invocation.
    assert_eq!(fx.sandboxes.created_count(), 1);
    let probe = fx.sandboxes.last_probe().unwrap();
    assert_eq!(probe.module.activations(), 1);
    assert!(fx.host.is_active("acme.tool").await);
    assert_eq!(
        fx.host.plugin_info("acme.tool").await.unwrap().status,
        PluginStatus::Active
    );
}

#[tokio::test]
async fn trusted_manifest_routes_to_direct_load() {
    let fx = fixture(true);
    write_plugin(&plugins_dir(&fx), "core.builtin", false, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    let manifest = fx
        .host
        .plugin_info("core.builtin")
        .await
        .unwrap()
        .manifest;
    assert_eq!(
        fx.host.resolve_isolation(&manifest),
        IsolationTier::DirectLoad
    );

    fx.host.activate_plugin("core.builtin").await.unwrap();

    assert_eq!(fx.loader.load_count(), 1);
    assert_eq!(fx.sandboxes.created_count(), 0);
    assert_eq!(fx.launcher.launch_count(), 0);
    assert_eq!(fx.loader.last_module().unwrap().activations(), 1);
}

#[tokio::test]
async fn sandboxed_manifest_routes_to_worker_when_ready() {
    let fx = fixture(true);
    write_plugin(&plugins_dir(&fx), "acme.iso", true, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();
    fx.host.process_manager().start().await.unwrap();

    let manifest = fx.host.plugin_info("acme.iso").await.unwrap().manifest;
    assert_eq!(
        fx.host.resolve_isolation(&manifest),
        IsolationTier::ProcessIsolated
    );

    fx.host.activate_plugin("acme.iso").await.unwrap();

    assert!(fx.host.is_active("acme.iso").await);
    // Nothing ran in-process.
    assert_eq!(fx.loader.load_count(), 0);
    assert_eq!(fx.sandboxes.created_count(), 0);

    fx.host.deactivate_plugin("acme.iso").await.unwrap();
    assert!(!fx.host.is_active("acme.iso").await);
    assert_eq!(
        fx.host.plugin_info("acme.iso").await.unwrap().status,
        PluginStatus::Disabled
    );
}

#[tokio::test]
async fn sandboxed_manifest_falls_back_to_vm_sandbox() {
    // Process isolation disabled: the VM sandbox is the fallback.
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "acme.vm", true, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    let manifest = fx.host.plugin_info("acme.vm").await.unwrap().manifest;
    assert_eq!(
        fx.host.resolve_isolation(&manifest),
        IsolationTier::VmSandboxed
    );

    fx.host.activate_plugin("acme.vm").await.unwrap();

    assert_eq!(fx.sandboxes.created_count(), 1);
    let probe = fx.sandboxes.last_probe().unwrap();
    assert_eq!(probe.spec.plugin_id, "acme.vm");
    assert_eq!(probe.spec.timeout, Duration::from_secs(30));
    assert!(probe
        .spec
        .permissions
        .is_granted(codebench_plugin_host::Permission::Editor));
}

#[tokio::test]
async fn vm_sandbox_is_disposed_on_deactivation() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "acme.vm", true, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    fx.host.activate_plugin("acme.vm").await.unwrap();
    let probe = fx.sandboxes.last_probe().unwrap();
    assert!(!probe.is_disposed());

    fx.host.deactivate_plugin("acme.vm").await.unwrap();
    assert!(probe.is_disposed());
    assert_eq!(probe.module.deactivations(), 1);
}

#[tokio::test]
async fn activation_failure_is_recorded_and_rethrown() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "core.flaky", false, COMMAND_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();
    fx.loader.fail_activate_next();

    let result = fx.host.activate_plugin("core.flaky").await;
    assert!(matches!(
        result,
        Err(PluginHostError::ActivationFailed { .. })
    ));

    let info = fx.host.plugin_info("core.flaky").await.unwrap();
    assert_eq!(info.status, PluginStatus::Error);
    assert!(info.error.is_some());
    assert!(!fx.host.is_active("core.flaky").await);

    // The partially registered contributions were rolled back.
    assert!(fx.host.contributions().await.command("test.run").is_none());

    // Error state permits reactivation.
    fx.host.activate_plugin("core.flaky").await.unwrap();
    assert_eq!(
        fx.host.plugin_info("core.flaky").await.unwrap().status,
        PluginStatus::Active
    );
}

#[tokio::test]
async fn contributions_follow_activation_lifecycle() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "acme.cmds", true, COMMAND_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    assert!(fx.host.contributions().await.is_empty());

    fx.host.activate_plugin("acme.cmds").await.unwrap();
    {
        let contributions = fx.host.contributions().await;
        assert_eq!(contributions.command("test.run").unwrap().title, "Run Test");
        assert!(contributions.keybinding("ctrl+t").is_some());
        assert_eq!(contributions.count_for_plugin("acme.cmds"), 2);
    }

    fx.host.deactivate_plugin("acme.cmds").await.unwrap();
    assert!(fx.host.contributions().await.is_empty());
}

#[tokio::test]
async fn contribution_teardown_survives_failing_deactivate_hook() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "core.rude", false, COMMAND_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();
    fx.loader.fail_deactivate_next();

    fx.host.activate_plugin("core.rude").await.unwrap();
    assert_eq!(fx.host.contributions().await.len(), 2);

    // The hook throws, the cleanup still runs.
    fx.host.deactivate_plugin("core.rude").await.unwrap();
    assert_eq!(fx.loader.last_module().unwrap().deactivations(), 1);
    assert!(fx.host.contributions().await.is_empty());
    assert_eq!(
        fx.host.plugin_info("core.rude").await.unwrap().status,
        PluginStatus::Disabled
    );
}

#[tokio::test]
async fn reload_busts_the_module_cache() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "core.dev", false, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();

    fx.host.activate_plugin("core.dev").await.unwrap();
    let first_module = fx.loader.last_module().unwrap();

    fx.host.reload_plugin("core.dev").await.unwrap();

    assert_eq!(fx.loader.cache_busts(), vec![0, 1]);
    assert_eq!(first_module.deactivations(), 1);
    let second_module = fx.loader.last_module().unwrap();
    assert_eq!(second_module.activations(), 1);
    assert_eq!(
        fx.host.plugin_info("core.dev").await.unwrap().status,
        PluginStatus::Active
    );
}

#[tokio::test]
async fn reload_aborts_when_manifest_reread_fails() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "core.gone", false, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();
    fx.host.activate_plugin("core.gone").await.unwrap();

    std::fs::remove_file(plugins_dir(&fx).join("core.gone").join("manifest.json")).unwrap();

    let result = fx.host.reload_plugin("core.gone").await;
    assert!(matches!(result, Err(PluginHostError::ManifestNotFound(_))));

    // Deactivated but never reactivated with stale state.
    assert!(!fx.host.is_active("core.gone").await);
    assert_eq!(fx.loader.load_count(), 1);
}

#[tokio::test]
async fn reload_reactivation_failure_is_caught_and_logged() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "core.flaky", false, NO_CONTRIBUTIONS);
    fx.host.discover_plugins().await.unwrap();
    fx.host.activate_plugin("core.flaky").await.unwrap();

    fx.loader.fail_activate_next();
    fx.host.reload_plugin("core.flaky").await.unwrap();

    let info = fx.host.plugin_info("core.flaky").await.unwrap();
    assert_eq!(info.status, PluginStatus::Error);
    assert!(!fx.host.is_active("core.flaky").await);
}

#[tokio::test]
async fn status_transitions_push_list_changed_events() {
    let fx = fixture(false);
    write_plugin(&plugins_dir(&fx), "acme.tool", true, NO_CONTRIBUTIONS);
    let mut events = fx.host.subscribe();

    fx.host.discover_plugins().await.unwrap();
    fx.host.activate_plugin("acme.tool").await.unwrap();
    fx.host.deactivate_plugin("acme.tool").await.unwrap();

    let mut received = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event, HostEvent::PluginListChanged);
        received += 1;
    }
    // Discovery, activation, and deactivation each push at least once.
    assert!(received >= 3);
}

#[tokio::test]
async fn discovery_skips_invalid_manifests() {
    let fx = fixture(false);
    let dir = plugins_dir(&fx);
    write_plugin(&dir, "acme.good", true, NO_CONTRIBUTIONS);
    write_plugin(&dir, "acme.other", true, NO_CONTRIBUTIONS);

    let broken = dir.join("broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("manifest.json"), "{definitely not json").unwrap();

    let mut discovered = fx.host.discover_plugins().await.unwrap();
    discovered.sort();
    assert_eq!(discovered, vec!["acme.good", "acme.other"]);
    assert_eq!(fx.host.plugin_count().await, 2);
}

#[tokio::test]
async fn unknown_plugin_operations_fail() {
    let fx = fixture(false);
    assert!(matches!(
        fx.host.activate_plugin("ghost").await,
        Err(PluginHostError::PluginNotFound(_))
    ));
    assert!(matches!(
        fx.host.deactivate_plugin("ghost").await,
        Err(PluginHostError::PluginNotFound(_))
    ));
}

#[tokio::test]
async fn per_plugin_storage_is_namespaced() {
    let fx = fixture(false);
    fx.host
        .storage()
        .set("p1", "layout", serde_json::json!("split"));
    fx.host
        .storage()
        .set("p2", "layout", serde_json::json!("tabs"));

    assert_eq!(
        fx.host.storage().get("p1", "layout"),
        Some(serde_json::json!("split"))
    );
    assert_eq!(
        fx.host.storage().get("p2", "layout"),
        Some(serde_json::json!("tabs"))
    );
}
