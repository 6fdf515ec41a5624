//! Script caching for the codebench playground.
//!
//! Execution requests hash the source text and look it up here before
//! touching the compiler, so repeated runs of unchanged code never
//! recompile. Three layers, leaf first:
//!
//! - [`SmartCache`]: generic memory-bounded cache with LRU-K eviction
//!   and exact memory accounting
//! - [`ScriptCache`]: content-addressed compiled-script specialization
//!   (SHA-256 keys, collision guard)
//! - [`PersistentScriptCache`]: adds a disk tier with a JSON manifest,
//!   periodic flushing, and LRU disk eviction
//!
//! Cache misses are never errors, and disk-tier corruption is always
//! demoted to a miss; callers only ever observe compilation latency.

mod error;
mod persistent;
mod script;
mod smart;

pub use error::{CacheError, CacheResult};
pub use persistent::{
    DiskCacheEntry, PersistentCacheConfig, PersistentCacheMetrics, PersistentScriptCache,
};
pub use script::{
    content_hash, mock, CompiledScript, ScriptCache, ScriptCompiler, SCRIPT_BASE_OVERHEAD,
};
pub use smart::{
    estimate_json_size, AgeHistogram, CacheMetrics, CacheSize, SmartCache, SmartCacheConfig,
    DEFAULT_SIZE_ESTIMATE,
};
