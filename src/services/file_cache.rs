use crate::constants::cache::EVICTION_PERCENT;
use crate::errors::RequestError;
use crate::services::cache::{CacheCounters, CacheStats, CacheStore, EvictionStrategy};
use crate::services::logger::Logger;
use crate::utils::fs_atomic::atomic_write;
use crate::utils::pattern::KeyPattern;
use crate::utils::stable_json::sha256_hex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// What `set` does when the backing store cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetFailureMode {
    #[default]
    Ignore,
    Propagate,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    stored_at: String,
    stored_at_ms: i64,
    ttl_ms: u64,
    value: Value,
}

impl StoredEntry {
    fn expires_at_ms(&self) -> i64 {
        self.stored_at_ms
            .saturating_add(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX))
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// In-memory view of one file on disk; drives sizing and eviction without touching the disk.
#[derive(Debug, Clone)]
struct IndexEntry {
    expires_at_ms: i64,
    last_access_ms: i64,
    access_count: u64,
    touched: u64,
}

impl IndexEntry {
    fn eviction_rank(&self, strategy: EvictionStrategy) -> (u64, i64, u64) {
        match strategy {
            EvictionStrategy::Lru => (0, self.last_access_ms, self.touched),
            EvictionStrategy::Lfu => (self.access_count, self.last_access_ms, self.touched),
            EvictionStrategy::Ttl => (0, self.expires_at_ms, self.touched),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

/// Disk-backed cache: one JSON document per key, named by the key's sha256. Bounded by
/// `max_entries`; the index is rebuilt from the directory on construction.
pub struct FileCache {
    logger: Logger,
    cache_dir: PathBuf,
    max_entries: usize,
    strategy: EvictionStrategy,
    on_set_failure: SetFailureMode,
    index: Mutex<HashMap<String, IndexEntry>>,
    tick: AtomicU64,
    counters: CacheCounters,
}

impl FileCache {
    pub fn new(
        logger: Logger,
        cache_dir: impl Into<PathBuf>,
        max_entries: usize,
        strategy: EvictionStrategy,
        on_set_failure: SetFailureMode,
    ) -> Self {
        let cache = Self {
            logger: logger.child("file_cache"),
            cache_dir: cache_dir.into(),
            max_entries: max_entries.max(1),
            strategy,
            on_set_failure,
            index: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
            counters: CacheCounters::default(),
        };
        cache.load_index();
        cache
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn lock_index(&self) -> MutexGuard<'_, HashMap<String, IndexEntry>> {
        self.index.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", sha256_hex(key)))
    }

    /// Startup scan. Expired and unreadable entries are dropped.
    fn load_index(&self) {
        let Ok(dir) = std::fs::read_dir(&self.cache_dir) else {
            return;
        };
        let now = now_ms();
        let mut loaded = Vec::new();
        for item in dir.filter_map(|item| item.ok()) {
            let path = item.path();
            if !is_entry_file(&path) {
                continue;
            }
            let entry = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<StoredEntry>(&raw).ok());
            match entry {
                Some(entry) if !entry.is_expired(now) && path == self.entry_path(&entry.key) => {
                    loaded.push(entry);
                }
                _ => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        loaded.sort_by_key(|entry| entry.stored_at_ms);

        let mut index = self.lock_index();
        for entry in loaded {
            index.insert(
                entry.key.clone(),
                IndexEntry {
                    expires_at_ms: entry.expires_at_ms(),
                    last_access_ms: entry.stored_at_ms,
                    access_count: 0,
                    touched: self.next_tick(),
                },
            );
        }
        let overflow = index.len().saturating_sub(self.max_entries);
        drop(index);
        if overflow > 0 {
            let victims = self.take_victims(overflow);
            for key in &victims {
                let _ = std::fs::remove_file(self.entry_path(key));
            }
        }
    }

    /// Removes the `count` lowest-ranked keys from the index and returns them.
    fn take_victims(&self, count: usize) -> Vec<String> {
        let mut index = self.lock_index();
        Self::pick_victims(&mut index, self.strategy, count)
    }

    fn pick_victims(
        index: &mut HashMap<String, IndexEntry>,
        strategy: EvictionStrategy,
        count: usize,
    ) -> Vec<String> {
        let mut ranked: Vec<(String, (u64, i64, u64))> = index
            .iter()
            .map(|(key, entry)| (key.clone(), entry.eviction_rank(strategy)))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1));
        ranked
            .into_iter()
            .take(count)
            .map(|(key, _)| {
                index.remove(&key);
                key
            })
            .collect()
    }

    async fn remove_files(&self, keys: &[String]) {
        for key in keys {
            let _ = tokio::fs::remove_file(self.entry_path(key)).await;
        }
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<StoredEntry>, std::io::Error> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(serde_json::from_str::<StoredEntry>(&raw).ok())
    }

    /// Reads the entry for `key`, deleting it when expired. I/O failures are logged misses.
    async fn load_live(&self, key: &str, touch: bool) -> Option<StoredEntry> {
        let path = self.entry_path(key);
        let entry = match self.read_entry(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.lock_index().remove(key);
                return None;
            }
            Err(err) => {
                CacheCounters::bump(&self.counters.errors, 1);
                self.logger.warn(
                    "Cache read failed",
                    Some(&serde_json::json!({"error": err.to_string()})),
                );
                return None;
            }
        };
        if entry.key != key {
            return None;
        }
        let now = now_ms();
        if entry.is_expired(now) {
            self.lock_index().remove(key);
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        if touch {
            if let Some(indexed) = self.lock_index().get_mut(key) {
                indexed.access_count += 1;
                indexed.last_access_ms = now;
                indexed.touched = self.next_tick();
            }
        }
        Some(entry)
    }

    async fn json_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.cache_dir).await else {
            return out;
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            if is_entry_file(&path) {
                out.push(path);
            }
        }
        out
    }

    /// Drops every expired entry from the index and the disk; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = {
            let mut index = self.lock_index();
            let keys: Vec<String> = index
                .iter()
                .filter(|(_, entry)| now >= entry.expires_at_ms)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        self.remove_files(&expired).await;
        expired.len()
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
                let removed = cache.purge_expired().await;
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

    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }
}

#[async_trait]
impl CacheStore for FileCache {
    async fn get(&self, key: &str) -> Option<Value> {
        match self.load_live(key, true).await {
            Some(entry) => {
                CacheCounters::bump(&self.counters.hits, 1);
                Some(entry.value)
            }
            None => {
                CacheCounters::bump(&self.counters.misses, 1);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), RequestError> {
        let now = chrono::Utc::now();
        let entry = StoredEntry {
            key: key.to_string(),
            stored_at: now.to_rfc3339(),
            stored_at_ms: now.timestamp_millis(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            value,
        };
        let tick = self.next_tick();

        // Reserve the slot before touching the disk so concurrent writers cannot overshoot.
        let (victims, previous) = {
            let mut index = self.lock_index();
            let mut victims = Vec::new();
            if !index.contains_key(key) && index.len() >= self.max_entries {
                let expired: Vec<String> = index
                    .iter()
                    .filter(|(_, indexed)| entry.stored_at_ms >= indexed.expires_at_ms)
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &expired {
                    index.remove(k);
                }
                victims = expired;
                if index.len() >= self.max_entries {
                    let batch = ((self.max_entries * EVICTION_PERCENT) + 99) / 100;
                    victims.extend(Self::pick_victims(&mut index, self.strategy, batch.max(1)));
                }
            }
            let previous = index.insert(
                key.to_string(),
                IndexEntry {
                    expires_at_ms: entry.expires_at_ms(),
                    last_access_ms: entry.stored_at_ms,
                    access_count: 0,
                    touched: tick,
                },
            );
            (victims, previous)
        };
        if !victims.is_empty() {
            CacheCounters::bump(&self.counters.evictions, victims.len() as u64);
            self.remove_files(&victims).await;
            self.logger.debug(
                "Evicted cache entries",
                Some(&serde_json::json!({"strategy": self.strategy, "evicted": victims.len()})),
            );
        }

        let path = self.entry_path(key);
        let written = match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                let target = path.clone();
                tokio::task::spawn_blocking(move || atomic_write(target, &bytes, 0o600))
                    .await
                    .map_err(|err| err.to_string())
                    .and_then(|res| res.map_err(|err| err.to_string()))
            }
            Err(err) => Err(err.to_string()),
        };
        match written {
            Ok(()) => {
                // Evicted or deleted while the write was in flight.
                let orphaned = !self.lock_index().contains_key(key);
                if orphaned {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                CacheCounters::bump(&self.counters.sets, 1);
                Ok(())
            }
            Err(message) => {
                {
                    let mut index = self.lock_index();
                    let ours = index.get(key).map(|e| e.touched == tick).unwrap_or(false);
                    if ours {
                        match previous {
                            Some(previous) => {
                                index.insert(key.to_string(), previous);
                            }
                            None => {
                                index.remove(key);
                            }
                        }
                    }
                }
                CacheCounters::bump(&self.counters.errors, 1);
                self.logger.warn(
                    "Cache write failed",
                    Some(&serde_json::json!({"error": message, "mode": self.on_set_failure})),
                );
                match self.on_set_failure {
                    SetFailureMode::Ignore => Ok(()),
                    SetFailureMode::Propagate => Err(RequestError::network(format!(
                        "Cache backend write failed: {}",
                        message
                    ))
                    .with_retryable(false)
                    .with_detail("cache_backend", Value::String("file".to_string()))),
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        self.lock_index().remove(key);
        let removed = tokio::fs::remove_file(self.entry_path(key)).await.is_ok();
        if removed {
            CacheCounters::bump(&self.counters.deletes, 1);
        }
        removed
    }

    async fn has(&self, key: &str) -> bool {
        self.load_live(key, false).await.is_some()
    }

    async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = KeyPattern::new(pattern);
        let matched: Vec<String> = {
            let mut index = self.lock_index();
            let keys: Vec<String> = index
                .keys()
                .filter(|key| matcher.is_match(key))
                .cloned()
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        self.remove_files(&matched).await;
        CacheCounters::bump(&self.counters.deletes, matched.len() as u64);
        matched.len()
    }

    async fn clear(&self) {
        let removed = {
            let mut index = self.lock_index();
            let removed = index.len();
            index.clear();
            removed
        };
        for path in self.json_files().await {
            let _ = tokio::fs::remove_file(&path).await;
        }
        CacheCounters::bump(&self.counters.deletes, removed as u64);
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot("file", self.len(), self.max_entries)
    }
}
