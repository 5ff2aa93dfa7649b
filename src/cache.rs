//! Bounded TTL cache with pluggable eviction and single-flight loading
//!
//! Entries live in a keyed map capped at `max_size`; inserting beyond
//! capacity evicts one victim chosen by the configured strategy (LRU,
//! LFU, or FIFO). An optional TTL expires entries relative to their
//! creation time; expired entries are evicted lazily on access and in
//! bulk through [`Cache::clean_up`].
//!
//! Lookup, access-order maintenance, and hit/miss accounting happen in
//! one critical section. Listener events are collected during the
//! transaction and dispatched after the lock is released.
//!
//! [`Cache::get_or_load`] gives single-flight loading: concurrent callers
//! missing the same key serialize on a per-key slot, the winner runs the
//! loader and populates the cache, and the others observe the cached
//! value when they re-check.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// How the cache picks a victim when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionStrategy {
    /// Evict the least recently accessed entry
    #[default]
    Lru,
    /// Evict the least frequently accessed entry (ties: oldest)
    Lfu,
    /// Evict the oldest entry
    Fifo,
}

/// Why an entry was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The entry's TTL elapsed
    Expired,
    /// The cache was full and the entry was the chosen victim
    Size,
}

/// Observable cache events
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<K, V> {
    /// A value was inserted or replaced
    Put {
        /// Key that was written
        key: K,
    },
    /// A value was removed explicitly
    Remove {
        /// Key that was removed
        key: K,
    },
    /// A value was evicted by TTL or capacity pressure
    Evicted {
        /// Key that was evicted
        key: K,
        /// The evicted value
        value: V,
        /// Why the entry was evicted
        reason: EvictionReason,
    },
}

/// Configuration for cache behavior
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// Entry time-to-live; `None` means entries never expire
    pub ttl: Option<Duration>,
    /// Victim choice when the cache is full
    pub eviction: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: None,
            eviction: EvictionStrategy::Lru,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_size == 0 {
            return Err(ResilienceError::InvalidArgument(
                "max_size must be > 0".to_string(),
            ));
        }
        if let Some(ttl) = self.ttl {
            if ttl.is_zero() {
                return Err(ResilienceError::InvalidArgument(
                    "ttl must be > 0 when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry)
    pub misses: u64,
    /// Entries evicted by TTL or capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, in `[0, 1]`
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    access_order: VecDeque<K>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K, V> CacheState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            access_order: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }
}

/// Keyed, bounded, TTL-scoped cache
///
/// # Example
/// ```no_run
/// use parapet::cache::{Cache, CacheConfig, EvictionStrategy};
/// use std::time::Duration;
///
/// let cache: Cache<String, u64> = Cache::new(CacheConfig {
///     max_size: 100,
///     ttl: Some(Duration::from_secs(60)),
///     eviction: EvictionStrategy::Lru,
/// })
/// .unwrap();
///
/// cache.put("answer".to_string(), 42);
/// assert_eq!(cache.get(&"answer".to_string()), Some(42));
/// ```
pub struct Cache<K, V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState<K, V>>,
    inflight: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
    listeners: Listeners<CacheEvent<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with the given configuration
    pub fn new(config: CacheConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: default_clock(),
            state: Mutex::new(CacheState::new()),
            inflight: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
        })
    }

    /// Create a cache with default configuration
    pub fn new_default() -> Self {
        Self {
            config: CacheConfig::default(),
            clock: default_clock(),
            state: Mutex::new(CacheState::new()),
            inflight: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
        }
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a listener for cache events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent<K, V>) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the cache's statistics
    pub fn statistics(&self) -> CacheStats {
        let state = self.state.lock().expect("cache state poisoned");
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        let mut state = self.state.lock().expect("cache state poisoned");
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
    }

    /// Look up a key, refreshing its access metadata on a hit
    ///
    /// An expired entry counts as a miss and is evicted on the spot.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let found = {
            let mut guard = self.state.lock().expect("cache state poisoned");
            let state = &mut *guard;

            let expired = match state.entries.get(key) {
                None => {
                    state.misses += 1;
                    return None;
                }
                Some(entry) => self.is_expired(entry, now),
            };

            if expired {
                if let Some(entry) = state.entries.remove(key) {
                    state.access_order.retain(|k| k != key);
                    state.evictions += 1;
                    events.push(CacheEvent::Evicted {
                        key: key.clone(),
                        value: entry.value,
                        reason: EvictionReason::Expired,
                    });
                }
                state.misses += 1;
                None
            } else if let Some(entry) = state.entries.get_mut(key) {
                entry.last_access = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                state.hits += 1;
                state.access_order.retain(|k| k != key);
                state.access_order.push_back(key.clone());
                Some(value)
            } else {
                None
            }
        };

        for event in &events {
            self.listeners.emit(event);
        }
        found
    }

    /// Insert or replace a value
    ///
    /// Inserting a new key into a full cache evicts one victim per the
    /// configured strategy.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut events = Vec::new();

        {
            let mut guard = self.state.lock().expect("cache state poisoned");
            let state = &mut *guard;

            if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_size {
                if let Some(victim) = self.choose_victim(state) {
                    if let Some(entry) = state.entries.remove(&victim) {
                        state.access_order.retain(|k| k != &victim);
                        state.evictions += 1;
                        events.push(CacheEvent::Evicted {
                            key: victim,
                            value: entry.value,
                            reason: EvictionReason::Size,
                        });
                    }
                }
            }

            state.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    created_at: now,
                    last_access: now,
                    access_count: 0,
                },
            );
            state.access_order.retain(|k| k != &key);
            state.access_order.push_back(key.clone());
            events.push(CacheEvent::Put { key });
        }

        for event in &events {
            self.listeners.emit(event);
        }
    }

    /// Remove a key, returning its value if present
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = {
            let mut guard = self.state.lock().expect("cache state poisoned");
            let state = &mut *guard;
            let removed = state.entries.remove(key);
            if removed.is_some() {
                state.access_order.retain(|k| k != key);
            }
            removed
        };

        removed.map(|entry| {
            self.listeners.emit(&CacheEvent::Remove { key: key.clone() });
            entry.value
        })
    }

    /// Remove every entry
    pub fn clear(&self) {
        let keys: Vec<K> = {
            let mut guard = self.state.lock().expect("cache state poisoned");
            let state = &mut *guard;
            state.access_order.clear();
            state.entries.drain().map(|(key, _)| key).collect()
        };

        for key in keys {
            self.listeners.emit(&CacheEvent::Remove { key });
        }
    }

    /// Purge every expired entry, returning how many were removed
    pub fn clean_up(&self) -> usize {
        let now = self.clock.now();
        let mut events = Vec::new();

        let removed = {
            let mut guard = self.state.lock().expect("cache state poisoned");
            let state = &mut *guard;

            let expired: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired {
                if let Some(entry) = state.entries.remove(key) {
                    state.access_order.retain(|k| k != key);
                    state.evictions += 1;
                    events.push(CacheEvent::Evicted {
                        key: key.clone(),
                        value: entry.value,
                        reason: EvictionReason::Expired,
                    });
                }
            }
            expired.len()
        };

        if removed > 0 {
            tracing::debug!(removed, "cache clean-up purged expired entries");
        }
        for event in &events {
            self.listeners.emit(event);
        }
        removed
    }

    /// Whether a live (non-expired) entry exists for the key
    pub fn contains_key(&self, key: &K) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().expect("cache state poisoned");
        state
            .entries
            .get(key)
            .map(|entry| !self.is_expired(entry, now))
            .unwrap_or(false)
    }

    /// Every key currently stored, expired or not
    pub fn keys(&self) -> Vec<K> {
        let state = self.state.lock().expect("cache state poisoned");
        state.entries.keys().cloned().collect()
    }

    /// Every key with a live (non-expired) entry
    pub fn valid_keys(&self) -> Vec<K> {
        let now = self.clock.now();
        let state = self.state.lock().expect("cache state poisoned");
        state
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of stored entries, expired or not
    pub fn size(&self) -> usize {
        self.state.lock().expect("cache state poisoned").entries.len()
    }

    /// Number of live (non-expired) entries
    pub fn valid_size(&self) -> usize {
        let now = self.clock.now();
        let state = self.state.lock().expect("cache state poisoned");
        state
            .entries
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .count()
    }

    /// Whether the cache has no entries
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Look up a key, running the loader on a miss with single-flight
    /// semantics
    ///
    /// Concurrent callers for the same missing key serialize: exactly one
    /// runs the loader, populates the cache, and the others observe the
    /// cached value when they re-check. If the loader fails, its error is
    /// returned to its caller and the next waiter retries independently.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let slot = {
            let mut inflight = self.inflight.lock().expect("inflight map poisoned");
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        // Only the per-key slot is held across the loader; the cache's
        // state lock never is.
        let _leader = slot.lock().await;

        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let result = loader().await;

        // The cache must be populated before the slot is retired.
        let outcome = match result {
            Ok(value) => {
                self.put(key.clone(), value.clone());
                Ok(value)
            }
            Err(error) => Err(ResilienceError::Underlying(error)),
        };

        {
            let mut inflight = self.inflight.lock().expect("inflight map poisoned");
            inflight.remove(&key);
        }

        outcome
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.config.ttl {
            Some(ttl) => now.saturating_duration_since(entry.created_at) >= ttl,
            None => false,
        }
    }

    /// Pick the victim for a size eviction; must run inside the state lock
    fn choose_victim(&self, state: &CacheState<K, V>) -> Option<K> {
        match self.config.eviction {
            EvictionStrategy::Lru => state.access_order.front().cloned(),
            EvictionStrategy::Lfu => state
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.access_count
                        .cmp(&b.access_count)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|(key, _)| key.clone()),
            EvictionStrategy::Fifo => state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone()),
        }
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cache paired with a fixed loader
///
/// Every lookup goes through [`Cache::get_or_load`] with the stored
/// loader, so misses are loaded single-flight.
pub struct LoadingCache<K, V, E> {
    cache: Arc<Cache<K, V>>,
    loader: Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync>,
}

impl<K, V, E> LoadingCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Pair a cache with a loader
    pub fn new<F>(cache: Arc<Cache<K, V>>, loader: F) -> Self
    where
        F: Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync + 'static,
    {
        Self {
            cache,
            loader: Arc::new(loader),
        }
    }

    /// Look up a key, loading it on a miss
    pub async fn get(&self, key: K) -> Result<V, ResilienceError<E>> {
        let loader = Arc::clone(&self.loader);
        let load_key = key.clone();
        self.cache
            .get_or_load(key, move || loader(load_key))
            .await
    }

    /// Drop a key so the next lookup reloads it
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.cache.remove(key)
    }

    /// The underlying cache
    pub fn cache(&self) -> &Arc<Cache<K, V>> {
        &self.cache
    }
}

impl<K, V, E> std::fmt::Debug for LoadingCache<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache").finish_non_exhaustive()
    }
}
