use crate::constants::cache::EVICTION_PERCENT;
use crate::errors::RequestError;
use crate::services::logger::Logger;
use crate::utils::pattern::KeyPattern;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    #[default]
    Lru,
    Lfu,
    Ttl,
}

impl EvictionStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "lru" => Some(EvictionStrategy::Lru),
            "lfu" => Some(EvictionStrategy::Lfu),
            "ttl" | "ttl_oldest" | "ttl-oldest" => Some(EvictionStrategy::Ttl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) sets: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) errors: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, backend: &'static str, size: usize, max_size: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            backend,
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            size,
            max_size,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Async cache contract the pipeline talks to. Backends that do I/O map unavailability to a
/// miss on `get`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), RequestError>;
    async fn delete(&self, key: &str) -> bool;
    async fn has(&self, key: &str) -> bool;
    async fn invalidate_pattern(&self, pattern: &str) -> usize;
    async fn clear(&self);
    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed_at: Instant,
    // Monotonic tick of the last touch; orders entries whose instants coincide.
    touched: u64,
}

impl<V> CacheEntry<V> {
    pub fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    fn eviction_rank(&self, strategy: EvictionStrategy) -> (u64, Instant, u64) {
        match strategy {
            EvictionStrategy::Lru => (0, self.last_accessed_at, self.touched),
            EvictionStrategy::Lfu => (self.access_count, self.last_accessed_at, self.touched),
            EvictionStrategy::Ttl => (0, self.expires_at(), self.touched),
        }
    }
}

pub struct MemoryCache<V> {
    logger: Logger,
    entries: DashMap<String, CacheEntry<V>>,
    max_size: usize,
    strategy: EvictionStrategy,
    capacity_lock: Mutex<()>,
    tick: AtomicU64,
    counters: CacheCounters,
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    pub fn new(logger: Logger, max_size: usize, strategy: EvictionStrategy) -> Self {
        Self {
            logger: logger.child("cache"),
            entries: DashMap::new(),
            max_size,
            strategy,
            capacity_lock: Mutex::new(()),
            tick: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.access_count += 1;
                    entry.last_accessed_at = now;
                    entry.touched = self.next_tick();
                    let value = entry.value.clone();
                    drop(entry);
                    CacheCounters::bump(&self.counters.hits, 1);
                    return Some(value);
                }
            }
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        CacheCounters::bump(&self.counters.misses, 1);
        None
    }

    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        if self.max_size == 0 {
            return;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            stored_at: now,
            ttl,
            access_count: 0,
            last_accessed_at: now,
            touched: self.next_tick(),
        };
        if let Some(mut existing) = self.entries.get_mut(key) {
            *existing = entry;
            drop(existing);
            CacheCounters::bump(&self.counters.sets, 1);
            return;
        }

        // New keys only grow the map under the capacity lock.
        let _guard = self
            .capacity_lock
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_size {
            self.make_room(now);
        }
        self.entries.insert(key.to_string(), entry);
        CacheCounters::bump(&self.counters.sets, 1);
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            CacheCounters::bump(&self.counters.deletes, 1);
        }
        removed
    }

    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            return false;
        }
        true
    }

    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = KeyPattern::new(pattern);
        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            if matcher.is_match(key) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            CacheCounters::bump(&self.counters.deletes, removed as u64);
            self.logger.debug(
                "Invalidated cache entries",
                Some(&serde_json::json!({"pattern": matcher.as_str(), "removed": removed})),
            );
        }
        removed
    }

    pub fn clear(&self) {
        let removed = self.entries.len();
        self.entries.clear();
        CacheCounters::bump(&self.counters.deletes, removed as u64);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    fn make_room(&self, now: Instant) {
        let expired = {
            let mut removed = 0u64;
            self.entries.retain(|_, entry| {
                if entry.is_expired(now) {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            removed
        };
        if self.entries.len() < self.max_size {
            CacheCounters::bump(&self.counters.evictions, expired);
            return;
        }

        let batch = ((self.max_size * EVICTION_PERCENT) + 99) / 100;
        let batch = batch.max(1);
        let mut ranked: Vec<(String, (u64, Instant, u64))> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().eviction_rank(self.strategy)))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1));

        let mut evicted = 0u64;
        for (key, _) in ranked.into_iter().take(batch) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        CacheCounters::bump(&self.counters.evictions, expired + evicted);
        self.logger.debug(
            "Evicted cache entries",
            Some(&serde_json::json!({
                "strategy": self.strategy,
                "evicted": evicted,
                "expired": expired,
            })),
        );
    }

    pub fn stats(&self) -> CacheStats {
        self.counters
            .snapshot("memory", self.entries.len(), self.max_size)
    }

    /// Periodically purges expired entries until the cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    CacheCounters::bump(&cache.counters.evictions, removed as u64);
                    cache.logger.debug(
                        "Cache cleanup",
                        Some(&serde_json::json!({"removed": removed, "size": cache.len()})),
                    );
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCache<Value> {
    async fn get(&self, key: &str) -> Option<Value> {
        MemoryCache::get(self, key)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), RequestError> {
        MemoryCache::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> bool {
        MemoryCache::delete(self, key)
    }

    async fn has(&self, key: &str) -> bool {
        MemoryCache::has(self, key)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> usize {
        MemoryCache::invalidate_pattern(self, pattern)
    }

    async fn clear(&self) {
        MemoryCache::clear(self)
    }

    fn stats(&self) -> CacheStats {
        MemoryCache::stats(self)
    }
}
