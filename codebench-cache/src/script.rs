//! Content-addressed compiled-script cache.
//!
//! Source text is keyed by its SHA-256 hash, so byte-identical code always
//! maps to the same entry. The compiler itself is an external collaborator
//! behind [`ScriptCompiler`]; this layer only decides when to invoke it.
//!
//! Each cached entry retains its source text: a lookup only counts as a
//! hit when the stored source matches the requested source exactly, which
//! guards against hash collisions and poisoned entries.

use crate::error::CacheResult;
use crate::smart::{wall_ms, CacheMetrics, CacheSize, SmartCache, SmartCacheConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Fixed overhead charged per compiled handle, on top of the source text.
pub const SCRIPT_BASE_OVERHEAD: usize = 1024;

/// Hex-encoded SHA-256 of source text, used as the cache key.
pub fn content_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// An opaque handle to compiled code.
///
/// Cheap to clone; the prepared code is shared.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    /// Content hash of the source this was compiled from.
    pub hash: String,
    /// The prepared code, ready for execution.
    pub code: Arc<str>,
    /// When the handle was produced (epoch milliseconds).
    pub compiled_at_ms: u64,
}

/// The transpiler seam.
///
/// The playground's actual compiler lives outside this crate; the cache
/// only needs a way to turn source text into executable code.
pub trait ScriptCompiler: Send + Sync {
    /// Compiles source text into executable code.
    fn compile(&self, source: &str) -> CacheResult<String>;
}

/// What the memory tier stores per hash: the compiled handle plus the
/// source it came from, for the collision guard.
#[derive(Debug, Clone)]
struct CachedScript {
    source: Arc<str>,
    compiled: CompiledScript,
}

impl CacheSize for CachedScript {
    fn cache_size(&self) -> usize {
        SCRIPT_BASE_OVERHEAD + self.source.encode_utf16().count() * 2
    }
}

/// The in-memory compiled-script cache.
pub struct ScriptCache {
    cache: SmartCache<CachedScript>,
    compiler: Arc<dyn ScriptCompiler>,
}

impl ScriptCache {
    /// Creates a script cache over the given compiler.
    pub fn new(config: SmartCacheConfig, compiler: Arc<dyn ScriptCompiler>) -> Self {
        Self {
            cache: SmartCache::new(config),
            compiler,
        }
    }

    /// Returns the compiled handle for `source`, compiling at most once.
    ///
    /// Identical source text always yields an equivalent handle without
    /// recompilation, for as long as the entry survives eviction.
    pub fn get_or_create(&mut self, source: &str) -> CacheResult<CompiledScript> {
        let hash = content_hash(source);
        if let Some(compiled) = self.lookup(&hash, source) {
            return Ok(compiled);
        }
        self.compile_and_insert(&hash, source)
    }

    /// Looks up a hash, returning the handle only if the stored source
    /// matches `source` exactly.
    pub fn lookup(&mut self, hash: &str, source: &str) -> Option<CompiledScript> {
        let entry = self.cache.get(hash)?;
        if entry.source.as_ref() == source {
            Some(entry.compiled.clone())
        } else {
            warn!(hash = %hash, "cached source mismatch for hash; treating as miss");
            None
        }
    }

    /// Compiles `source` and inserts it under `hash`.
    pub fn compile_and_insert(&mut self, hash: &str, source: &str) -> CacheResult<CompiledScript> {
        let code = self.compiler.compile(source)?;
        let compiled = CompiledScript {
            hash: hash.to_string(),
            code: code.into(),
            compiled_at_ms: wall_ms(),
        };
        let entry = CachedScript {
            source: source.into(),
            compiled: compiled.clone(),
        };
        self.cache.set(hash, entry, None);
        Ok(compiled)
    }

    /// Whether a hash is currently resident in memory.
    pub fn has(&self, hash: &str) -> bool {
        self.cache.has(hash)
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Memory-tier metrics.
    pub fn metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }
}

/// Test doubles for the compiler seam.
pub mod mock {
    use super::*;
    use crate::error::CacheError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A compiler spy: counts invocations, prefixes the source.
    #[derive(Debug, Default)]
    pub struct CountingCompiler {
        compiles: AtomicUsize,
    }

    impl CountingCompiler {
        /// Creates a shareable counting compiler.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Number of times `compile` has been invoked.
        pub fn compile_count(&self) -> usize {
            self.compiles.load(Ordering::SeqCst)
        }
    }

    impl ScriptCompiler for CountingCompiler {
        fn compile(&self, source: &str) -> CacheResult<String> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(format!("\"use strict\";{source}"))
        }
    }

    /// A compiler that always fails.
    #[derive(Debug, Default)]
    pub struct FailingCompiler;

    impl ScriptCompiler for FailingCompiler {
        fn compile(&self, source: &str) -> CacheResult<String> {
            let _ = source;
            Err(CacheError::Compile("synthetic failure".into()))
        }
    }
}
