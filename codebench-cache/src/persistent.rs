//! Two-tier persistent script cache.
//!
//! Wraps the in-memory [`ScriptCache`] with a disk tier under a cache
//! directory:
//!
//! - `manifest.json` is the authoritative index of disk-resident entries,
//!   validated against the actual files at load time
//! - each persisted entry lives at `<sha256-hex>.<ext>` holding the raw
//!   source text (never the compiled form)
//! - sources become persistence candidates after `persist_threshold`
//!   accesses and are spilled by the next periodic or explicit `flush()`
//! - the disk tier is bounded; the globally-oldest entries (by `lastUsed`)
//!   are evicted to make room
//!
//! Disk-tier failures never reach the caller: a corrupt or missing entry
//! is pruned and treated as a miss.

use crate::error::CacheResult;
use crate::script::{content_hash, CompiledScript, ScriptCache, ScriptCompiler};
use crate::smart::{wall_ms, CacheMetrics, SmartCacheConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Manifest schema version; older or newer manifests are discarded.
const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";

/// Configuration for a [`PersistentScriptCache`].
#[derive(Debug, Clone)]
pub struct PersistentCacheConfig {
    /// Directory holding the manifest and persisted sources.
    pub cache_dir: PathBuf,
    /// Configuration for the in-memory tier.
    pub memory: SmartCacheConfig,
    /// Disk budget in bytes.
    pub max_disk_bytes: u64,
    /// Accesses before a hash becomes a disk-persistence candidate.
    pub persist_threshold: u32,
    /// Interval between periodic flushes.
    pub flush_interval: Duration,
    /// Extension for persisted source files.
    pub file_extension: String,
}

impl PersistentCacheConfig {
    /// Default configuration rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            memory: SmartCacheConfig::default(),
            max_disk_bytes: 64 * 1024 * 1024, // 64MB
            persist_threshold: 3,
            flush_interval: Duration::from_secs(30),
            file_extension: "js".to_string(),
        }
    }
}

/// A disk-resident entry as recorded in the manifest.
///
/// The source body is not stored here, only on disk at `<hash>.<ext>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskCacheEntry {
    /// Content hash of the persisted source.
    pub hash: String,
    /// Last access time (epoch milliseconds); drives disk LRU eviction.
    pub last_used: u64,
    /// Total recorded accesses for this hash.
    pub access_count: u64,
    /// Size of the persisted source in bytes.
    pub size: u64,
}

/// The on-disk manifest envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheManifest {
    version: u32,
    entries: Vec<(String, DiskCacheEntry)>,
    total_size: u64,
    last_updated: u64,
}

/// In-memory view of the disk tier.
#[derive(Debug, Default)]
struct DiskIndex {
    entries: HashMap<String, DiskCacheEntry>,
    total_size: u64,
    /// Whether the manifest needs rewriting at the next flush.
    dirty: bool,
}

#[derive(Debug, Default)]
struct DiskStats {
    disk_hits: AtomicU64,
    disk_writes: AtomicU64,
    disk_evictions: AtomicU64,
}

/// Combined metrics for both tiers.
#[derive(Debug, Clone, Serialize)]
pub struct PersistentCacheMetrics {
    /// Memory-tier metrics.
    pub memory: CacheMetrics,
    /// Verified disk-tier hits.
    pub disk_hits: u64,
    /// Entries spilled to disk.
    pub disk_writes: u64,
    /// Entries removed by disk LRU eviction.
    pub disk_evictions: u64,
    /// Current disk-resident entry count.
    pub disk_entries: usize,
    /// Current disk-resident bytes.
    pub disk_bytes: u64,
    /// Hashes waiting for the next flush.
    pub pending_writes: usize,
}

struct PersistentInner {
    config: PersistentCacheConfig,
    memory: Mutex<ScriptCache>,
    disk: Mutex<DiskIndex>,
    /// hash → source side-table for entries awaiting spill. The source is
    /// held here so flush never has to re-derive it from the memory tier.
    pending: Mutex<HashMap<String, String>>,
    /// Per-hash access counts feeding the persistence threshold.
    access_counts: Mutex<HashMap<String, u32>>,
    stats: DiskStats,
    init: OnceCell<()>,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PersistentInner {
    fn entry_path(&self, hash: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{hash}.{}", self.config.file_extension))
    }
}

/// A content-addressed script cache with a persistent disk tier.
///
/// Lookup order: memory tier, then verified disk tier, then compile.
/// All operations initialize the cache on first use; concurrent
/// initializers await the same in-flight load.
pub struct PersistentScriptCache {
    inner: Arc<PersistentInner>,
}

impl PersistentScriptCache {
    /// Creates a cache. No I/O happens until first use or `initialize`.
    pub fn new(config: PersistentCacheConfig, compiler: Arc<dyn ScriptCompiler>) -> Self {
        let memory = ScriptCache::new(config.memory.clone(), compiler);
        Self {
            inner: Arc::new(PersistentInner {
                config,
                memory: Mutex::new(memory),
                disk: Mutex::new(DiskIndex::default()),
                pending: Mutex::new(HashMap::new()),
                access_counts: Mutex::new(HashMap::new()),
                stats: DiskStats::default(),
                init: OnceCell::new(),
                flush_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Loads the disk tier and starts the periodic flush task.
    ///
    /// Idempotent and concurrent-call-safe: a second caller awaits the
    /// same in-flight initialization rather than starting a duplicate
    /// load. Manifest corruption is non-fatal: the disk tier starts
    /// empty and the condition is logged.
    pub async fn initialize(&self) -> CacheResult<()> {
        self.inner
            .init
            .get_or_try_init(|| async {
                load_disk_index(&self.inner).await?;

                let weak = Arc::downgrade(&self.inner);
                let interval = self.inner.config.flush_interval;
                let handle = tokio::spawn(flush_loop(weak, interval));
                if let Ok(mut slot) = self.inner.flush_task.lock() {
                    *slot = Some(handle);
                }
                Ok(())
            })
            .await
            .map(|_: &()| ())
    }

    /// Returns the compiled handle for `source`.
    ///
    /// Checks the memory tier, then the disk tier (verifying the stored
    /// source against the request), then compiles. A verified disk hit
    /// also populates the memory tier.
    pub async fn get_or_create(&self, source: &str) -> CacheResult<CompiledScript> {
        self.initialize().await?;
        let hash = content_hash(source);

        if let Some(compiled) = self.inner.memory.lock().await.lookup(&hash, source) {
            self.note_access(&hash, source).await;
            return Ok(compiled);
        }

        if let Some(compiled) = self.disk_lookup(&hash, source).await? {
            self.note_access(&hash, source).await;
            return Ok(compiled);
        }

        let compiled = self
            .inner
            .memory
            .lock()
            .await
            .compile_and_insert(&hash, source)?;
        self.note_access(&hash, source).await;
        Ok(compiled)
    }

    /// Spills pending writes to disk and persists the manifest.
    ///
    /// Disk space is ensured per pending write by evicting the
    /// globally-oldest entries first. Individual write failures are
    /// logged and skipped; they do not abort the flush.
    pub async fn flush(&self) -> CacheResult<()> {
        self.initialize().await?;
        flush_inner(&self.inner).await
    }

    /// Empties both tiers and deletes all persisted files.
    pub async fn clear(&self) -> CacheResult<()> {
        self.initialize().await?;

        self.inner.memory.lock().await.clear();
        self.inner.pending.lock().await.clear();
        self.inner.access_counts.lock().await.clear();

        let hashes: Vec<String> = {
            let mut disk = self.inner.disk.lock().await;
            let hashes = disk.entries.keys().cloned().collect();
            disk.entries.clear();
            disk.total_size = 0;
            disk.dirty = true;
            hashes
        };
        for hash in hashes {
            let path = self.inner.entry_path(&hash);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(hash = %hash, error = %e, "failed to remove cache file during clear");
                }
            }
        }
        persist_manifest_if_dirty(&self.inner).await
    }

    /// Final flush, then stops the periodic flush task.
    pub async fn shutdown(&self) -> CacheResult<()> {
        let result = if self.inner.init.get().is_some() {
            flush_inner(&self.inner).await
        } else {
            Ok(())
        };
        if let Ok(mut slot) = self.inner.flush_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        result
    }

    /// Combined metrics for both tiers.
    pub async fn metrics(&self) -> PersistentCacheMetrics {
        let memory = self.inner.memory.lock().await.metrics();
        let (disk_entries, disk_bytes) = {
            let disk = self.inner.disk.lock().await;
            (disk.entries.len(), disk.total_size)
        };
        let pending_writes = self.inner.pending.lock().await.len();

        PersistentCacheMetrics {
            memory,
            disk_hits: self.inner.stats.disk_hits.load(Ordering::Relaxed),
            disk_writes: self.inner.stats.disk_writes.load(Ordering::Relaxed),
            disk_evictions: self.inner.stats.disk_evictions.load(Ordering::Relaxed),
            disk_entries,
            disk_bytes,
            pending_writes,
        }
    }

    /// Records an access and schedules persistence once the threshold is
    /// reached for a hash that is neither disk-resident nor pending.
    async fn note_access(&self, hash: &str, source: &str) {
        let count = {
            let mut counts = self.inner.access_counts.lock().await;
            let count = counts.entry(hash.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count < self.inner.config.persist_threshold {
            return;
        }
        if self.inner.disk.lock().await.entries.contains_key(hash) {
            return;
        }
        let mut pending = self.inner.pending.lock().await;
        if !pending.contains_key(hash) {
            debug!(hash = %hash, count, "scheduling script for disk persistence");
            pending.insert(hash.to_string(), source.to_string());
        }
    }

    /// Disk-tier lookup with content verification.
    ///
    /// Read failures and source mismatches prune the entry and fall
    /// through to a miss; they are never surfaced to the caller.
    async fn disk_lookup(&self, hash: &str, source: &str) -> CacheResult<Option<CompiledScript>> {
        if !self.inner.disk.lock().await.entries.contains_key(hash) {
            return Ok(None);
        }

        let path = self.inner.entry_path(hash);
        let stored = match tokio::fs::read_to_string(&path).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(hash = %hash, error = %e, "failed to read disk cache entry; pruning");
                self.prune_disk_entry(hash).await;
                return Ok(None);
            }
        };
        if stored != source {
            warn!(hash = %hash, "disk cache entry does not match requested source; pruning");
            self.prune_disk_entry(hash).await;
            return Ok(None);
        }

        {
            let mut disk = self.inner.disk.lock().await;
            if let Some(entry) = disk.entries.get_mut(hash) {
                entry.last_used = wall_ms();
                entry.access_count += 1;
                disk.dirty = true;
            }
        }
        self.inner.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
        debug!(hash = %hash, "disk tier hit");

        let compiled = self
            .inner
            .memory
            .lock()
            .await
            .compile_and_insert(hash, source)?;
        Ok(Some(compiled))
    }

    async fn prune_disk_entry(&self, hash: &str) {
        let mut disk = self.inner.disk.lock().await;
        if let Some(entry) = disk.entries.remove(hash) {
            disk.total_size = disk.total_size.saturating_sub(entry.size);
            disk.dirty = true;
        }
    }
}

impl Drop for PersistentScriptCache {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.inner.flush_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Loads and validates the manifest, pruning entries whose backing file
/// is gone and recomputing the tracked total size from the survivors.
async fn load_disk_index(inner: &Arc<PersistentInner>) -> CacheResult<()> {
    tokio::fs::create_dir_all(&inner.config.cache_dir).await?;

    let manifest_path = inner.config.cache_dir.join(MANIFEST_FILE);
    let mut index = DiskIndex::default();

    match tokio::fs::read_to_string(&manifest_path).await {
        Ok(text) => match serde_json::from_str::<CacheManifest>(&text) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => {
                for (hash, entry) in manifest.entries {
                    let path = inner.entry_path(&hash);
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_file() => {
                            index.total_size += entry.size;
                            index.entries.insert(hash, entry);
                        }
                        _ => {
                            warn!(hash = %hash, "pruning manifest entry with missing backing file");
                            index.dirty = true;
                        }
                    }
                }
            }
            Ok(manifest) => {
                warn!(
                    version = manifest.version,
                    "unsupported cache manifest version; starting with empty disk tier"
                );
            }
            Err(e) => {
                warn!(error = %e, "corrupt cache manifest; starting with empty disk tier");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no cache manifest found; starting with empty disk tier");
        }
        Err(e) => {
            warn!(error = %e, "failed to read cache manifest; starting with empty disk tier");
        }
    }

    info!(
        dir = %inner.config.cache_dir.display(),
        entries = index.entries.len(),
        bytes = index.total_size,
        "persistent script cache initialized"
    );
    *inner.disk.lock().await = index;
    Ok(())
}

/// Periodic flush driver. Holds only a weak reference so the timer never
/// keeps the cache alive; it exits once the cache is dropped.
async fn flush_loop(inner: Weak<PersistentInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        if let Err(e) = flush_inner(&inner).await {
            warn!(error = %e, "periodic cache flush failed");
        }
    }
}

async fn flush_inner(inner: &Arc<PersistentInner>) -> CacheResult<()> {
    let pending: Vec<(String, String)> = inner.pending.lock().await.drain().collect();

    for (hash, source) in pending {
        let size = source.len() as u64;
        if size > inner.config.max_disk_bytes {
            warn!(hash = %hash, size, "script exceeds disk budget; not persisting");
            continue;
        }

        loop {
            let needs_room = {
                let disk = inner.disk.lock().await;
                disk.total_size + size > inner.config.max_disk_bytes && !disk.entries.is_empty()
            };
            if !needs_room {
                break;
            }
            evict_oldest_disk_entry(inner).await;
        }

        let path = inner.entry_path(&hash);
        if let Err(e) = tokio::fs::write(&path, &source).await {
            warn!(hash = %hash, error = %e, "failed to write disk cache entry");
            continue;
        }

        let access_count = inner
            .access_counts
            .lock()
            .await
            .get(&hash)
            .copied()
            .unwrap_or(0) as u64;
        {
            let mut disk = inner.disk.lock().await;
            disk.total_size += size;
            disk.entries.insert(
                hash.clone(),
                DiskCacheEntry {
                    hash: hash.clone(),
                    last_used: wall_ms(),
                    access_count,
                    size,
                },
            );
            disk.dirty = true;
        }
        inner.stats.disk_writes.fetch_add(1, Ordering::Relaxed);
        debug!(hash = %hash, size, "persisted script to disk");
    }

    persist_manifest_if_dirty(inner).await
}

/// Evicts the disk entry with the oldest `last_used`. A missing backing
/// file is tolerated; already-gone is not an error.
async fn evict_oldest_disk_entry(inner: &Arc<PersistentInner>) {
    let removed = {
        let mut disk = inner.disk.lock().await;
        let victim = disk
            .entries
            .values()
            .min_by_key(|entry| entry.last_used)
            .map(|entry| entry.hash.clone());
        victim.and_then(|hash| {
            disk.entries.remove(&hash).map(|entry| {
                disk.total_size = disk.total_size.saturating_sub(entry.size);
                disk.dirty = true;
                entry
            })
        })
    };

    if let Some(entry) = removed {
        inner.stats.disk_evictions.fetch_add(1, Ordering::Relaxed);
        let path = inner.entry_path(&entry.hash);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(hash = %entry.hash, error = %e, "failed to remove evicted cache file");
            }
        }
        debug!(hash = %entry.hash, size = entry.size, "evicted disk cache entry");
    }
}

/// Serializes the manifest via a temp file + rename so a crash mid-write
/// never leaves a truncated manifest behind.
async fn persist_manifest_if_dirty(inner: &Arc<PersistentInner>) -> CacheResult<()> {
    let manifest = {
        let mut disk = inner.disk.lock().await;
        if !disk.dirty {
            return Ok(());
        }
        disk.dirty = false;
        let mut entries: Vec<(String, DiskCacheEntry)> = disk
            .entries
            .iter()
            .map(|(hash, entry)| (hash.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        CacheManifest {
            version: MANIFEST_VERSION,
            entries,
            total_size: disk.total_size,
            last_updated: wall_ms(),
        }
    };

    let result = write_manifest(inner, &manifest).await;
    if result.is_err() {
        inner.disk.lock().await.dirty = true;
    }
    result
}

async fn write_manifest(inner: &PersistentInner, manifest: &CacheManifest) -> CacheResult<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    let path = inner.config.cache_dir.join(MANIFEST_FILE);
    let tmp = inner.config.cache_dir.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!(entries = manifest.entries.len(), "cache manifest persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serializes_with_camel_case_keys() {
        let manifest = CacheManifest {
            version: 1,
            entries: vec![(
                "abc".to_string(),
                DiskCacheEntry {
                    hash: "abc".to_string(),
                    last_used: 42,
                    access_count: 3,
                    size: 10,
                },
            )],
            total_size: 10,
            last_updated: 99,
        };

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"totalSize\":10"));
        assert!(json.contains("\"lastUpdated\":99"));
        assert!(json.contains("\"lastUsed\":42"));
        assert!(json.contains("\"accessCount\":3"));
    }

    #[test]
    fn manifest_roundtrips() {
        let manifest = CacheManifest {
            version: 1,
            entries: Vec::new(),
            total_size: 0,
            last_updated: 7,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: CacheManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.last_updated, 7);
    }

    #[test]
    fn entry_path_uses_configured_extension() {
        let config = PersistentCacheConfig::new("/tmp/cache");
        let inner = PersistentInner {
            config,
            memory: Mutex::new(ScriptCache::new(
                SmartCacheConfig::default(),
                crate::mock::CountingCompiler::new(),
            )),
            disk: Mutex::new(DiskIndex::default()),
            pending: Mutex::new(HashMap::new()),
            access_counts: Mutex::new(HashMap::new()),
            stats: DiskStats::default(),
            init: OnceCell::new(),
            flush_task: std::sync::Mutex::new(None),
        };
        assert_eq!(
            inner.entry_path("deadbeef"),
            PathBuf::from("/tmp/cache/deadbeef.js")
        );
    }
}
