//! Typed cache manager (ambient A4), grounded on `original_source`'s
//! `core/utils/cache/config.py`: a per-`CacheType` configuration
//! (strategy, TTL, max size) backing a shared, process-wide cache
//! keyed by arbitrary string keys.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Eviction strategy for a given [`CacheType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Pure time-based expiry, unbounded size.
    Ttl,
    /// TTL expiry plus an LRU cap on entry count.
    TtlLru,
    /// Fixed-size LRU with no time-based expiry.
    FixedSize,
}

/// The kinds of data this gateway caches, each with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Intent-router decisions, keyed by `(device_id, text)` (§4.10).
    IntentResult,
    /// Cached wake-word audio responses (§4.2/§9 WakeupResponse).
    WakeupResponse,
    /// IP geolocation / device metadata lookups.
    DeviceMetadata,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,
    pub ttl: Duration,
    pub max_size: usize,
}

impl CacheConfig {
    /// Preset configuration per cache type, mirroring `CacheConfig.for_type`
    /// in the Python original.
    pub fn for_type(cache_type: CacheType) -> Self {
        match cache_type {
            CacheType::IntentResult => Self {
                strategy: CacheStrategy::TtlLru,
                ttl: Duration::from_secs(600),
                max_size: 1000,
            },
            CacheType::WakeupResponse => Self {
                strategy: CacheStrategy::Ttl,
                ttl: Duration::from_secs(300),
                max_size: usize::MAX,
            },
            CacheType::DeviceMetadata => Self {
                strategy: CacheStrategy::FixedSize,
                ttl: Duration::from_secs(3600),
                max_size: 512,
            },
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

enum Store<V> {
    Plain(HashMap<String, Entry<V>>),
    Lru(LruCache<String, Entry<V>>),
}

/// A single typed cache instance for one [`CacheType`].
pub struct TypedCache<V> {
    config: CacheConfig,
    store: Mutex<Store<V>>,
}

impl<V: Clone> TypedCache<V> {
    pub fn new(cache_type: CacheType) -> Self {
        let config = CacheConfig::for_type(cache_type);
        let store = match config.strategy {
            CacheStrategy::Ttl => Store::Plain(HashMap::new()),
            CacheStrategy::TtlLru | CacheStrategy::FixedSize => {
                let cap = std::num::NonZeroUsize::new(config.max_size.max(1)).unwrap();
                Store::Lru(LruCache::new(cap))
            }
        };
        Self { config, store: Mutex::new(store) }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut store = self.store.lock().unwrap();
        match &mut *store {
            Store::Plain(map) => {
                let expired = map.get(key).map(|e| self.is_expired(e)).unwrap_or(false);
                if expired {
                    map.remove(key);
                    return None;
                }
                map.get(key).map(|e| e.value.clone())
            }
            Store::Lru(lru) => {
                let expired = lru.peek(key).map(|e| self.is_expired(e)).unwrap_or(false);
                if expired {
                    lru.pop(key);
                    return None;
                }
                lru.get(key).map(|e| e.value.clone())
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        let entry = Entry { value, inserted_at: Instant::now() };
        let mut store = self.store.lock().unwrap();
        match &mut *store {
            Store::Plain(map) => {
                map.insert(key.into(), entry);
            }
            Store::Lru(lru) => {
                lru.put(key.into(), entry);
            }
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        if self.config.strategy == CacheStrategy::FixedSize {
            return false;
        }
        entry.inserted_at.elapsed() > self.config.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_cache_hit_and_miss() {
        let cache: TypedCache<String> = TypedCache::new(CacheType::IntentResult);
        assert!(cache.get("k").is_none());
        cache.put("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[test]
    fn ttl_entries_expire() {
        let mut config = CacheConfig::for_type(CacheType::IntentResult);
        config.ttl = Duration::from_millis(1);
        let cache: TypedCache<String> = TypedCache { config, store: Mutex::new(Store::Lru(LruCache::new(std::num::NonZeroUsize::new(10).unwrap()))) };
        cache.put("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn fixed_size_cache_does_not_expire() {
        let cache: TypedCache<u32> = TypedCache::new(CacheType::DeviceMetadata);
        cache.put("k", 1);
        assert_eq!(cache.get("k"), Some(1));
    }
}
