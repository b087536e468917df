//! LRU + TTL response cache for idempotent reads
//!
//! Keys are a BLAKE3 digest over the canonical triple
//! `(endpoint_id, path, sorted-params JSON)`; the params map is ordered, so
//! equal logical requests always canonicalize to the same key.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::gateway::endpoint::EndpointId;

/// Canonical cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    endpoint: EndpointId,
    digest: [u8; 32],
}

impl CacheKey {
    /// Build the canonical key for a request
    pub fn for_request(
        endpoint: EndpointId,
        path: &str,
        params: &BTreeMap<String, String>,
    ) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(endpoint.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(path.as_bytes());
        hasher.update(b"\x1f");
        // BTreeMap serializes with sorted keys, giving the canonical form.
        let params_json = serde_json::to_string(params).unwrap_or_default();
        hasher.update(params_json.as_bytes());
        CacheKey {
            endpoint,
            digest: *hasher.finalize().as_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries
    pub size: usize,
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses
    pub misses: u64,
    /// hits / (hits + misses), zero when never queried
    pub hit_rate: f64,
}

struct Inner {
    store: LruCache<CacheKey, CacheEntry>,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

/// Bounded LRU+TTL store for GET responses
pub struct ResponseCache {
    inner: Mutex<Inner>,
}

impl ResponseCache {
    /// Create a cache from configuration
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store: LruCache::new(non_zero(config.max_size)),
                ttl: config.ttl(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace TTL and capacity; surplus entries are evicted LRU-first
    pub fn configure(&self, config: CacheConfig) {
        let mut inner = self.lock();
        inner.ttl = config.ttl();
        inner.store.resize(non_zero(config.max_size));
    }

    /// Look up a key; expired entries are dropped and count as misses
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let mut inner = self.lock();
        let now = Instant::now();
        // Fully resolve the lookup before mutating counters; the store
        // borrow must end first.
        let lookup = match inner.store.get(key) {
            Some(entry) if entry.expires_at > now => Some(Some(entry.value.clone())),
            Some(_) => Some(None),
            None => None,
        };
        match lookup {
            Some(Some(value)) => {
                inner.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.store.pop(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store a value under a key with the configured TTL
    pub fn insert(&self, key: CacheKey, value: serde_json::Value) {
        let mut inner = self.lock();
        let expires_at = Instant::now() + inner.ttl;
        inner.store.put(key, CacheEntry { value, expires_at });
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.store.clear();
    }

    /// Drop every entry belonging to one endpoint (endpoint deletion)
    pub fn purge_endpoint(&self, id: EndpointId) {
        let mut inner = self.lock();
        let stale: Vec<CacheKey> = inner
            .store
            .iter()
            .filter(|(key, _)| key.endpoint == id)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            inner.store.pop(&key);
        }
    }

    /// Current settings
    pub fn config(&self) -> CacheConfig {
        let inner = self.lock();
        CacheConfig {
            ttl_ms: inner.ttl.as_millis() as u64,
            max_size: inner.store.cap().get(),
        }
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.store.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

fn non_zero(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size.max(1)).unwrap_or(NonZeroUsize::MIN)
}
