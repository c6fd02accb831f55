//! Metadata cache with TTL support
//!
//! Memoizes introspection and synthesis results keyed by method, model,
//! requesting identity and parameters. Values are type-erased so one cache
//! serves descriptors, operation listings and anything else the engine
//! derives from model structure.

pub mod invalidation;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::models::ModelKey;

pub use invalidation::{
    ChangeClass, ChangeEvent, ChangeKind, ChangeNotifier, ChangeOrigin, StructureChangeDetector,
};

/// Cache key: method + model identity + identity hash + parameter hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: &'static str,
    pub model: Option<ModelKey>,
    pub identity: String,
    pub params: String,
}

impl CacheKey {
    pub fn new(method: &'static str, model: Option<&ModelKey>) -> Self {
        Self {
            method,
            model: model.cloned(),
            identity: String::new(),
            params: String::new(),
        }
    }

    pub fn for_identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(short_hash).unwrap_or_default();
        self
    }

    pub fn with_params<P: Serialize>(mut self, params: &P) -> Self {
        let encoded = serde_json::to_string(params).unwrap_or_default();
        self.params = short_hash(&encoded);
        self
    }
}

/// First 16 hex chars of the SHA-256 digest.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// A cached entry with expiration time
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub invalidations: u64,
}

/// Process-wide metadata cache.
pub struct MetadataCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    /// Bumped under the entries lock by every invalidation
    epoch: AtomicU64,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MetadataCache {
    /// `default_ttl` of `None` keeps entries until invalidated.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Get a cached value if it exists, hasn't expired and has type `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &CacheKey) -> Option<T> {
        let entries = self.entries.read();
        let found = entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .and_then(|entry| entry.value.downcast_ref::<T>().cloned());
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or atomically replace the entry for `key`.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, key: CacheKey, value: T, ttl: Option<Duration>) {
        let entry = self.entry(value, ttl);
        self.entries.write().insert(key, entry);
    }

    fn entry<T: Clone + Send + Sync + 'static>(&self, value: T, ttl: Option<Duration>) -> CacheEntry {
        CacheEntry {
            value: Arc::new(value),
            expires_at: ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl),
        }
    }

    /// Insert a value computed while the cache was at `epoch`. Dropped when
    /// an invalidation ran in between, since it may describe the old structure.
    fn insert_computed<T: Clone + Send + Sync + 'static>(
        &self,
        key: CacheKey,
        value: T,
        ttl: Option<Duration>,
        epoch: u64,
    ) {
        let entry = self.entry(value, ttl);
        let mut entries = self.entries.write();
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(method = key.method, "Discarded value computed across an invalidation");
            return;
        }
        entries.insert(key, entry);
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_or_compute<T, F>(&self, key: CacheKey, ttl: Option<Duration>, compute: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(&key) {
            return value;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let value = compute();
        self.insert_computed(key, value.clone(), ttl, epoch);
        value
    }

    /// Like [MetadataCache::get_or_compute]; failures are not cached.
    pub fn try_get_or_compute<T, E, F>(&self, key: CacheKey, ttl: Option<Duration>, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get::<T>(&key) {
            return Ok(value);
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let value = compute()?;
        self.insert_computed(key, value.clone(), ttl, epoch);
        Ok(value)
    }

    /// Drop every entry bound to `model`. Returns the number removed.
    pub fn invalidate_model(&self, model: &ModelKey) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.model.as_ref() != Some(model));
        let removed = before - entries.len();
        self.bump_epoch();
        debug!(model = %model, removed, "Invalidated cached metadata");
        removed
    }

    /// Drop every entry computed by `method` regardless of model.
    pub fn invalidate_method(&self, method: &'static str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.method != method);
        self.bump_epoch();
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        self.bump_epoch();
        removed
    }

    /// Full clear so nothing computed against a previous structural generation survives.
    pub fn on_startup(&self) {
        let removed = self.clear();
        info!(removed, "Metadata cache cleared at startup");
    }

    /// Remove all expired entries
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            hits,
            misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn key(model: &str) -> CacheKey {
        CacheKey::new("describe", Some(&ModelKey::new("catalog", model)))
    }

    #[test]
    fn test_get_or_compute_memoizes() {
        let cache = MetadataCache::default();
        let mut calls = 0;
        let first: String = cache.get_or_compute(key("Product"), None, || {
            calls += 1;
            "value".to_string()
        });
        let second: String = cache.get_or_compute(key("Product"), None, || {
            calls += 1;
            "other".to_string()
        });
        assert_eq!(first, second);
        assert_eq!(calls, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_cache_expiration() {
        let cache = MetadataCache::new(Some(Duration::from_millis(50)));
        cache.insert(key("Product"), 7u32, None);
        assert_eq!(cache.get::<u32>(&key("Product")), Some(7));

        sleep(Duration::from_millis(60));
        assert_eq!(cache.get::<u32>(&key("Product")), None);
    }

    #[test]
    fn test_invalidate_model_is_selective() {
        let cache = MetadataCache::default();
        cache.insert(key("Product"), 1u8, None);
        cache.insert(key("Category"), 2u8, None);
        assert_eq!(cache.invalidate_model(&ModelKey::new("catalog", "Product")), 1);
        assert_eq!(cache.get::<u8>(&key("Category")), Some(2));
    }

    #[test]
    fn test_compute_racing_an_invalidation_is_not_kept() {
        let cache = MetadataCache::default();
        let model = ModelKey::new("catalog", "Product");
        let value: String = cache.get_or_compute(key("Product"), None, || {
            cache.invalidate_model(&model);
            "old-shape".to_string()
        });
        assert_eq!(value, "old-shape");
        assert_eq!(cache.get::<String>(&key("Product")), None);

        let value: Result<String, ()> = cache.try_get_or_compute(key("Product"), None, || {
            cache.clear();
            Ok("old-shape".to_string())
        });
        assert_eq!(value, Ok("old-shape".to_string()));
        assert!(cache.is_empty());

        let fresh: String = cache.get_or_compute(key("Product"), None, || "new-shape".to_string());
        assert_eq!(cache.get::<String>(&key("Product")), Some(fresh));
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let cache = MetadataCache::default();
        let result: Result<u8, &str> = cache.try_get_or_compute(key("Product"), None, || Err("nope"));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_identity_hash_separates_entries() {
        let anon = key("Product");
        let alice = key("Product").for_identity(Some("alice"));
        assert_ne!(anon, alice);
        assert_eq!(alice.identity.len(), 16);
    }
}
