use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::utils::canonical::{canonical_json, canonicalize_arguments, sha256_hex};

pub mod singleflight;
pub mod store;

pub use singleflight::{Flight, Singleflight};
use store::SqliteStore;

/// A live cache entry as exposed by `dump()`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryRecord {
    pub namespace: String,
    pub version: String,
    pub key: String,
    pub value: Value,
    pub created_at_ms: i64,
    pub expires_at_ms: Option<i64>,
    pub hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub size: usize,
    pub capacity: Option<usize>,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub memory: TierStats,
    pub persistent: Option<TierStats>,
}

struct MemoryEntry {
    value: Value,
    expires_at_ms: Option<i64>,
}

/// Derive the argument digest half of a cache key: sha256 over the
/// canonical argument JSON (recursive key sort, null-valued keys removed).
pub fn argument_digest(arguments: &Value) -> String {
    sha256_hex(&canonical_json(&canonicalize_arguments(arguments)))
}

fn storage_key(namespace: &str, version: &str, digest: &str) -> String {
    format!("{}@{}:{}", namespace, version, digest)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Two-tier result cache: a bounded in-memory LRU in front of an optional
/// SQLite file shared across co-located processes, plus a singleflight
/// registry for in-flight deduplication.
///
/// The version tag participates in every key, so a version mismatch is
/// indistinguishable from a miss — bumping a tool's cache version
/// invalidates its entries without a purge. TTLs are observed lazily at
/// read time.
pub struct ResultCacheManager {
    enabled: bool,
    memory: Mutex<LruCache<String, MemoryEntry>>,
    memory_capacity: usize,
    mem_hits: AtomicU64,
    mem_misses: AtomicU64,
    store: Option<SqliteStore>,
    /// Set after the first persistent-tier I/O error; the engine then runs
    /// memory-only for the rest of its life (spec'd CacheError semantics:
    /// never surfaced to callers).
    degraded: AtomicBool,
    flights: Singleflight,
    default_ttl_seconds: Option<u64>,
}

impl ResultCacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = config.memory_size.max(1);
        let store = if config.enabled && config.persist {
            let path = config.resolved_path();
            match SqliteStore::open(&path) {
                Ok(store) => {
                    debug!("persistent cache open at {}", path.display());
                    Some(store)
                }
                Err(e) => {
                    warn!(
                        "failed to open persistent cache at {}: {}; running memory-only",
                        path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            enabled: config.enabled,
            memory: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            memory_capacity: capacity,
            mem_hits: AtomicU64::new(0),
            mem_misses: AtomicU64::new(0),
            store,
            degraded: AtomicBool::new(false),
            flights: Singleflight::new(),
            default_ttl_seconds: config.default_ttl_seconds,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn flights(&self) -> &Singleflight {
        &self.flights
    }

    /// Full storage key for singleflight identity.
    pub fn flight_key(namespace: &str, version: &str, digest: &str) -> String {
        storage_key(namespace, version, digest)
    }

    fn store_if_healthy(&self) -> Option<&SqliteStore> {
        if self.degraded.load(Ordering::Relaxed) {
            return None;
        }
        self.store.as_ref()
    }

    fn degrade(&self, context: &str, err: &anyhow::Error) {
        warn!(
            "persistent cache error during {}: {}; degrading to memory-only",
            context, err
        );
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Look up the value last stored under this key that has not expired.
    /// Persistent-tier hits are promoted into the memory tier.
    pub fn get(&self, namespace: &str, version: &str, digest: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let key = storage_key(namespace, version, digest);
        let now = now_ms();

        {
            let mut memory = self
                .memory
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(entry) = memory.get(&key) {
                if entry.expires_at_ms.is_none_or(|at| now <= at) {
                    self.mem_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                memory.pop(&key);
            }
            self.mem_misses.fetch_add(1, Ordering::Relaxed);
        }

        let store = self.store_if_healthy()?;
        match store.get(namespace, version, digest, now) {
            Ok(Some((value, expires_at_ms))) => {
                // Promote so subsequent reads stay off the disk tier.
                let mut memory = self
                    .memory
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                memory.put(
                    key,
                    MemoryEntry {
                        value: value.clone(),
                        expires_at_ms,
                    },
                );
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                self.degrade("get", &e);
                None
            }
        }
    }

    /// Store a value in both tiers. `ttl_seconds` falls back to the
    /// configured default; `None` means the entry never expires.
    pub fn set(
        &self,
        namespace: &str,
        version: &str,
        digest: &str,
        value: &Value,
        ttl_seconds: Option<u64>,
    ) {
        if !self.enabled {
            return;
        }
        let created = now_ms();
        let ttl = ttl_seconds.or(self.default_ttl_seconds);
        let expires_at = ttl.map(|t| created + (t as i64) * 1000);
        let key = storage_key(namespace, version, digest);

        {
            let mut memory = self
                .memory
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            memory.put(
                key,
                MemoryEntry {
                    value: value.clone(),
                    expires_at_ms: expires_at,
                },
            );
        }

        if let Some(store) = self.store_if_healthy()
            && let Err(e) = store.set(namespace, version, digest, value, created, expires_at)
        {
            self.degrade("set", &e);
        }
    }

    /// Flush cached entries, optionally scoped to one namespace.
    pub fn clear(&self, namespace: Option<&str>) {
        {
            let mut memory = self
                .memory
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match namespace {
                Some(ns) => {
                    let prefix = format!("{}@", ns);
                    let keys: Vec<String> = memory
                        .iter()
                        .filter(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in keys {
                        memory.pop(&key);
                    }
                }
                None => memory.clear(),
            }
        }
        if let Some(store) = self.store_if_healthy()
            && let Err(e) = store.clear(namespace)
        {
            self.degrade("clear", &e);
        }
    }

    /// All live persistent entries, for ops tooling. Memory-only engines
    /// return an empty list.
    pub fn dump(&self) -> Vec<CacheEntryRecord> {
        let Some(store) = self.store_if_healthy() else {
            return Vec::new();
        };
        match store.dump(now_ms()) {
            Ok(entries) => entries,
            Err(e) => {
                self.degrade("dump", &e);
                Vec::new()
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let memory_size = self
            .memory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        let persistent = self.store_if_healthy().map(|store| TierStats {
            size: store.len().unwrap_or(0),
            capacity: None,
            hits: store.hit_count(),
            misses: store.miss_count(),
        });
        CacheStats {
            enabled: self.enabled,
            memory: TierStats {
                size: memory_size,
                capacity: Some(self.memory_capacity),
                hits: self.mem_hits.load(Ordering::Relaxed),
                misses: self.mem_misses.load(Ordering::Relaxed),
            },
            persistent,
        }
    }

    /// Teardown: flush the persistent tier. Safe to call more than once.
    pub fn close(&self) {
        if let Some(store) = self.store_if_healthy() {
            store.checkpoint();
        }
    }
}
