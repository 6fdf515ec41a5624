//! Integration tests for the persistent two-tier script cache.

use codebench_cache::mock::CountingCompiler;
use codebench_cache::{PersistentCacheConfig, PersistentScriptCache, SmartCacheConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn test_config(dir: &Path) -> PersistentCacheConfig {
    PersistentCacheConfig {
        cache_dir: dir.to_path_buf(),
        memory: SmartCacheConfig::default(),
        max_disk_bytes: 1024 * 1024,
        persist_threshold: 2,
        // Long interval: tests drive flushes explicitly.
        flush_interval: Duration::from_secs(3600),
        file_extension: "js".to_string(),
    }
}

fn test_cache(dir: &Path) -> (PersistentScriptCache, Arc<CountingCompiler>) {
    let compiler = CountingCompiler::new();
    let cache = PersistentScriptCache::new(test_config(dir), compiler.clone());
    (cache, compiler)
}

/// Accesses `source` enough times to cross the persistence threshold.
async fn warm(cache: &PersistentScriptCache, source: &str) {
    cache.get_or_create(source).await.unwrap();
    cache.get_or_create(source).await.unwrap();
}

#[tokio::test]
async fn disk_tier_roundtrip_survives_cache_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const greeting = 'hello';";

    {
        let (cache, _compiler) = test_cache(dir.path());
        warm(&cache, source).await;
        assert_eq!(cache.metrics().await.pending_writes, 1);
        cache.flush().await.unwrap();
        assert_eq!(cache.metrics().await.disk_entries, 1);
        cache.shutdown().await.unwrap();
    }

    // Fresh instance over the same directory: the memory tier is cold,
    // so the lookup must come from disk.
    let (cache, _compiler) = test_cache(dir.path());
    let compiled = cache.get_or_create(source).await.unwrap();

    let metrics = cache.metrics().await;
    assert_eq!(metrics.disk_hits, 1);
    assert!(compiled.code.contains(source));

    // Now resident in memory: the next call is a memory hit.
    cache.get_or_create(source).await.unwrap();
    assert_eq!(cache.metrics().await.disk_hits, 1);
    assert_eq!(cache.metrics().await.memory.hits, 1);
}

#[tokio::test]
async fn below_threshold_sources_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _compiler) = test_cache(dir.path());

    cache.get_or_create("const once = 1;").await.unwrap();
    cache.flush().await.unwrap();

    let metrics = cache.metrics().await;
    assert_eq!(metrics.pending_writes, 0);
    assert_eq!(metrics.disk_entries, 0);
    assert_eq!(metrics.disk_writes, 0);
}

#[tokio::test]
async fn manifest_self_heals_when_backing_file_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const doomed = true;";
    let hash = codebench_cache::content_hash(source);

    {
        let (cache, _compiler) = test_cache(dir.path());
        warm(&cache, source).await;
        cache.flush().await.unwrap();
        assert_eq!(cache.metrics().await.disk_entries, 1);
        cache.shutdown().await.unwrap();
    }

    std::fs::remove_file(dir.path().join(format!("{hash}.js"))).unwrap();

    let (cache, _compiler) = test_cache(dir.path());
    cache.initialize().await.unwrap();

    let metrics = cache.metrics().await;
    assert_eq!(metrics.disk_entries, 0);
    assert_eq!(metrics.disk_bytes, 0);

    // The pruned entry is a full miss, not an error.
    cache.get_or_create(source).await.unwrap();
    assert_eq!(cache.metrics().await.disk_hits, 0);
}

#[tokio::test]
async fn corrupt_manifest_is_nonfatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("manifest.json"), "{not json at all").unwrap();

    let (cache, _compiler) = test_cache(dir.path());
    cache.initialize().await.unwrap();
    assert_eq!(cache.metrics().await.disk_entries, 0);

    let compiled = cache.get_or_create("const fine = 1;").await.unwrap();
    assert!(!compiled.code.is_empty());
}

#[tokio::test]
async fn tampered_disk_entry_falls_through_to_miss() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const honest = 1;";
    let hash = codebench_cache::content_hash(source);

    {
        let (cache, _compiler) = test_cache(dir.path());
        warm(&cache, source).await;
        cache.flush().await.unwrap();
        cache.shutdown().await.unwrap();
    }

    std::fs::write(
        dir.path().join(format!("{hash}.js")),
        "const tampered = 666;",
    )
    .unwrap();

    let (cache, compiler) = test_cache(dir.path());
    let compiled = cache.get_or_create(source).await.unwrap();

    // Verification failed: entry pruned, source recompiled from scratch.
    assert!(compiled.code.contains(source));
    assert_eq!(compiler.compile_count(), 1);
    let metrics = cache.metrics().await;
    assert_eq!(metrics.disk_hits, 0);
    assert_eq!(metrics.disk_entries, 0);
}

#[tokio::test]
async fn disk_eviction_removes_oldest_entries_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Room for roughly two persisted sources.
    config.max_disk_bytes = 60;
    let compiler = CountingCompiler::new();
    let cache = PersistentScriptCache::new(config, compiler);

    let first = "const a = 'aaaaaaaaaaaaaa';"; // 27 bytes
    let second = "const b = 'bbbbbbbbbbbbbb';";
    let third = "const c = 'cccccccccccccc';";

    // Spread the writes across distinct milliseconds so `lastUsed`
    // ordering between them is unambiguous.
    warm(&cache, first).await;
    cache.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    warm(&cache, second).await;
    cache.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    warm(&cache, third).await;
    cache.flush().await.unwrap();

    let metrics = cache.metrics().await;
    assert_eq!(metrics.disk_writes, 3);
    assert!(metrics.disk_evictions >= 1);
    assert!(metrics.disk_bytes <= 60);

    // The first (oldest) entry's backing file is gone.
    let first_hash = codebench_cache::content_hash(first);
    assert!(!dir.path().join(format!("{first_hash}.js")).exists());
}

#[tokio::test]
async fn clear_empties_both_tiers_and_deletes_files() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const transient = 0;";
    let hash = codebench_cache::content_hash(source);
    let (cache, _compiler) = test_cache(dir.path());

    warm(&cache, source).await;
    cache.flush().await.unwrap();
    assert!(dir.path().join(format!("{hash}.js")).exists());

    cache.clear().await.unwrap();

    let metrics = cache.metrics().await;
    assert_eq!(metrics.disk_entries, 0);
    assert_eq!(metrics.disk_bytes, 0);
    assert_eq!(metrics.memory.entry_count, 0);
    assert!(!dir.path().join(format!("{hash}.js")).exists());

    // The persisted manifest reflects the cleared state.
    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["totalSize"], 0);
    assert_eq!(manifest["entries"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn concurrent_initialization_is_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let (cache, _compiler) = test_cache(dir.path());

    let (a, b, c) = tokio::join!(cache.initialize(), cache.initialize(), cache.initialize());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    // Initialization stays idempotent after completion too.
    cache.initialize().await.unwrap();
}

#[tokio::test]
async fn manifest_file_matches_documented_layout() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const layout = 'stable';";
    let hash = codebench_cache::content_hash(source);
    let (cache, _compiler) = test_cache(dir.path());

    warm(&cache, source).await;
    cache.flush().await.unwrap();

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).unwrap())
            .unwrap();

    assert_eq!(manifest["version"], 1);
    assert_eq!(manifest["totalSize"], source.len() as u64);
    assert!(manifest["lastUpdated"].as_u64().unwrap() > 0);

    let entries = manifest["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0][0], hash.as_str());
    assert_eq!(entries[0][1]["hash"], hash.as_str());
    assert_eq!(entries[0][1]["size"], source.len() as u64);
    assert!(entries[0][1]["lastUsed"].as_u64().unwrap() > 0);
    assert_eq!(entries[0][1]["accessCount"], 2);

    // The backing file holds the raw source, not the compiled form.
    let on_disk = std::fs::read_to_string(dir.path().join(format!("{hash}.js"))).unwrap();
    assert_eq!(on_disk, source);
}

#[tokio::test]
async fn shutdown_flushes_pending_writes() {
    let dir = tempfile::tempdir().unwrap();
    let source = "const parting = 'gift';";

    let (cache, _compiler) = test_cache(dir.path());
    warm(&cache, source).await;
    assert_eq!(cache.metrics().await.pending_writes, 1);

    cache.shutdown().await.unwrap();
    assert_eq!(cache.metrics().await.disk_entries, 1);
    assert!(dir.path().join("manifest.json").exists());
}
