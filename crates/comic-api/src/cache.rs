//! Two-tier cache for API responses.
//!
//! Reads check a bounded in-memory tier first, then the persistent key/value
//! store; a persistent hit is copied back into memory. Writes go to both tiers
//! with the same expiry. Persistent failures are logged and swallowed: the
//! cache is advisory and never fails a caller.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::config::CacheConfig;
use shared::{Config, KeyValueStore, SqliteStore, StoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const EXPIRY_SUFFIX: &str = "_expiry";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Non-finite values disable the persistent sweep
fn sweep_probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: i64,
}

impl MemoryEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Capacity-bounded map that evicts in insertion order
#[derive(Debug)]
struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str, now: i64) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            self.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Overwriting keeps the key's original position in the eviction order
    fn insert(&mut self, key: &str, entry: MemoryEntry) {
        if self.capacity == 0 {
            return;
        }

        if let Some(existing) = self.entries.get_mut(key) {
            *existing = entry;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!(key = %oldest, "Evicted oldest memory cache entry");
            }
        }

        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), entry);
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&str, &MemoryEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, e| keep(k, e));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub persistent_entries: usize,
}

/// Two-tier cache manager for API responses
pub struct CacheManager {
    memory: Mutex<MemoryTier>,
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    default_ttl: Duration,
    enabled: bool,
    cleanup_interval: Duration,
    sweep_probability: f64,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create a cache manager over an already opened store
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(config.memory_capacity)),
            store,
            prefix: config.key_prefix.clone(),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            enabled: config.enabled,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            sweep_probability: sweep_probability(config.persistent_sweep_probability),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Open the SQLite store named in the configuration
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.store_path();
        let store = SqliteStore::open(&path, config.cache.quota_bytes)
            .with_context(|| format!("Failed to open cache store: {}", path.display()))?;

        info!(
            store = %path.display(),
            capacity = config.cache.memory_capacity,
            enabled = config.cache.enabled,
            "Cache initialized"
        );

        Ok(Self::new(Arc::new(store), &config.cache))
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a cached value if present and not expired
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        let now = now_millis();
        if let Some(value) = self.lock_memory().get(key, now) {
            debug!(key = key, "Memory cache hit");
            return Some(value);
        }

        let entry = self.read_persistent(key, now)?;
        debug!(key = key, "Persistent cache hit");
        let value = entry.value.clone();
        self.lock_memory().insert(key, entry);
        Some(value)
    }

    /// Get a cached value and decode it
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key = key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Store a value in both tiers
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to serialize cache value");
                return;
            }
        };

        let expires_at = now_millis().saturating_add(ttl_millis(ttl));
        self.write_persistent(key, &value, expires_at);
        self.lock_memory()
            .insert(key, MemoryEntry { value, expires_at });

        debug!(key = key, ttl_ms = ttl.as_millis() as u64, "Cache stored");
    }

    /// Store a value with the configured default TTL
    pub fn set_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove one key from both tiers
    pub fn remove(&self, key: &str) {
        self.lock_memory().remove(key);
        self.remove_persistent(key);
        debug!(key = key, "Cache entry removed");
    }

    /// Remove every key matching `pattern` from both tiers
    ///
    /// Returns the number of distinct keys removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut removed: Vec<String> = {
            let mut memory = self.lock_memory();
            let matching: Vec<String> = memory
                .entries
                .keys()
                .filter(|k| pattern.is_match(k))
                .cloned()
                .collect();
            for key in &matching {
                memory.remove(key);
            }
            matching
        };

        for key in self.persistent_keys() {
            if pattern.is_match(&key) {
                self.remove_persistent(&key);
                removed.push(key);
            }
        }

        removed.sort();
        removed.dedup();

        info!(pattern = %pattern, removed = removed.len(), "Cache pattern invalidated");
        removed.len()
    }

    /// Clear all cache entries owned by this manager
    pub fn clear(&self) {
        self.lock_memory().clear();
        for key in self.persistent_keys() {
            self.remove_persistent(&key);
        }
        info!("Cache cleared");
    }

    /// Drop expired entries
    ///
    /// The memory tier is always swept; the persistent tier only with the
    /// configured probability. Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = now_millis();
        let mut removed = self.lock_memory().retain(|_, e| !e.is_expired(now));

        if rand::rng().random_bool(self.sweep_probability) {
            removed += self.sweep_persistent(now);
        }

        if removed > 0 {
            debug!(removed = removed, "Cache cleanup complete");
        }
        removed
    }

    /// Whether `key` currently sits in the memory tier
    pub fn in_memory(&self, key: &str) -> bool {
        self.lock_memory().entries.contains_key(key)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let memory = self.lock_memory();
        CacheStats {
            memory_entries: memory.entries.len(),
            memory_capacity: memory.capacity,
            persistent_entries: self.persistent_keys().len(),
        }
    }

    /// Start the periodic cleanup task
    ///
    /// The task holds only a weak reference and ends when the manager is
    /// dropped or [`dispose`](Self::dispose) is called. Calling this twice is
    /// a no-op.
    pub fn init(self: &Arc<Self>) {
        let mut slot = self.lock_cleanup_task();
        if slot.is_some() {
            return;
        }

        let period = self.cleanup_interval.max(Duration::from_millis(1));
        let cache = Arc::downgrade(self);

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.cleanup();
            }
        }));

        info!(interval_secs = period.as_secs(), "Cache cleanup scheduled");
    }

    /// Stop the periodic cleanup task
    pub fn dispose(&self) {
        if let Some(handle) = self.lock_cleanup_task().take() {
            handle.abort();
            info!("Cache cleanup stopped");
        }
    }

    /// Whether the periodic cleanup task is running
    pub fn is_running(&self) -> bool {
        self.lock_cleanup_task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cleanup_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn value_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn expiry_key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, EXPIRY_SUFFIX)
    }

    fn read_persistent(&self, key: &str, now: i64) -> Option<MemoryEntry> {
        let read = || -> Result<Option<(String, String)>, StoreError> {
            let Some(expiry) = self.store.get(&self.expiry_key(key))? else {
                return Ok(None);
            };
            let Some(raw) = self.store.get(&self.value_key(key))? else {
                return Ok(None);
            };
            Ok(Some((expiry, raw)))
        };

        let (expiry, raw) = match read() {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(key = key, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read persistent cache");
                return None;
            }
        };

        let expires_at = match expiry.parse::<i64>() {
            Ok(expires_at) if now <= expires_at => expires_at,
            Ok(_) => {
                debug!(key = key, "Persistent cache entry expired");
                self.remove_persistent(key);
                return None;
            }
            Err(_) => {
                warn!(key = key, "Corrupt expiry in persistent cache");
                self.remove_persistent(key);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(MemoryEntry { value, expires_at }),
            Err(e) => {
                warn!(key = key, error = %e, "Corrupt value in persistent cache");
                self.remove_persistent(key);
                None
            }
        }
    }

    fn try_write(&self, key: &str, raw: &str, expires_at: i64) -> Result<(), StoreError> {
        self.store.set(&self.value_key(key), raw)?;
        if let Err(e) = self.store.set(&self.expiry_key(key), &expires_at.to_string()) {
            // A value without its expiry would never be readable
            let _ = self.store.remove(&self.value_key(key));
            return Err(e);
        }
        Ok(())
    }

    fn write_persistent(&self, key: &str, value: &Value, expires_at: i64) {
        let raw = value.to_string();

        let err = match self.try_write(key, &raw, expires_at) {
            Ok(()) => return,
            Err(e) => e,
        };

        if !err.is_quota_exceeded() {
            warn!(key = key, error = %err, "Failed to write persistent cache");
            return;
        }

        warn!(key = key, "Persistent cache quota exceeded, cleaning up");
        self.make_room(now_millis());

        if let Err(e) = self.try_write(key, &raw, expires_at) {
            warn!(key = key, error = %e, "Persistent cache write failed after cleanup");
        }
    }

    fn remove_persistent(&self, key: &str) {
        for store_key in [self.value_key(key), self.expiry_key(key)] {
            if let Err(e) = self.store.remove(&store_key) {
                warn!(key = %store_key, error = %e, "Failed to remove persistent cache entry");
            }
        }
    }

    /// Cache keys (without prefix) present in the persistent store
    fn persistent_keys(&self) -> Vec<String> {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list persistent cache keys");
                return Vec::new();
            }
        };

        keys.into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| !k.ends_with(EXPIRY_SUFFIX))
            .collect()
    }

    /// Persistent keys with their stored expiry, oldest first
    fn persistent_expiries(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .persistent_keys()
            .into_iter()
            .map(|key| {
                let expires_at = self
                    .store
                    .get(&self.expiry_key(&key))
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(i64::MIN);
                (key, expires_at)
            })
            .collect();
        entries.sort_by_key(|(_, expires_at)| *expires_at);
        entries
    }

    fn sweep_persistent(&self, now: i64) -> usize {
        let expired: Vec<String> = self
            .persistent_expiries()
            .into_iter()
            .filter(|(_, expires_at)| now > *expires_at)
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.remove_persistent(key);
        }
        expired.len()
    }

    /// Free persistent space: expired entries first, else the oldest quarter
    fn make_room(&self, now: i64) {
        let expired = self.sweep_persistent(now);
        if expired > 0 {
            info!(removed = expired, "Removed expired persistent cache entries");
            return;
        }

        let entries = self.persistent_expiries();
        let count = entries.len().div_ceil(4);
        for (key, _) in entries.iter().take(count) {
            self.remove_persistent(key);
        }
        info!(removed = count, "Removed oldest persistent cache entries");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
