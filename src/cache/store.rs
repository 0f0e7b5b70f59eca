//! Entry Store
//!
//! Bounded key/value storage with lazy TTL expiry and a fixed eviction policy.
//! The store is not synchronized; [`LocalCache`](super::l1::LocalCache) wraps
//! each instance in a shard lock.
//!
//! # Design
//!
//! - Capacity is bounded by entry count and/or total bytes (0 disables a bound)
//! - Victims are chosen before a new key goes in, so a fresh key is never its own victim
//! - Every entry carries a TTL; writes without one get the store default

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::entry::{CacheEntry, Lookup};
use super::policy::{EvictionPolicy, EvictionTracker};

/// Entry store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of entries (0 = unbounded)
    pub max_entries: usize,
    /// Maximum total size in bytes (0 = unbounded)
    pub max_bytes: u64,
    /// TTL applied when a write carries none
    pub default_ttl: Duration,
    /// Victim selection strategy
    pub policy: EvictionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 0,
            default_ttl: Duration::from_secs(300),
            policy: EvictionPolicy::Lru,
        }
    }
}

/// Counters kept by a single store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Bounded entry store
pub struct EntryStore<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tracker: EvictionTracker,
    config: StoreConfig,
    current_bytes: u64,
    next_version: u64,
    stats: StoreStats,
}

impl<V> EntryStore<V> {
    /// Create a new store
    pub fn new(config: StoreConfig) -> Self {
        let tracker = EvictionTracker::new(config.policy);
        Self::with_tracker(config, tracker)
    }

    /// Create a store whose random eviction is reproducible
    pub fn with_seed(config: StoreConfig, seed: u64) -> Self {
        let tracker = EvictionTracker::with_seed(config.policy, seed);
        Self::with_tracker(config, tracker)
    }

    fn with_tracker(config: StoreConfig, tracker: EvictionTracker) -> Self {
        Self {
            entries: HashMap::new(),
            tracker,
            config,
            current_bytes: 0,
            next_version: 0,
            stats: StoreStats::default(),
        }
    }

    /// Look up a key, distinguishing expired entries from plain misses
    pub fn lookup(&mut self, key: &str) -> Lookup<V>
    where
        V: Clone,
    {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            None => {
                self.stats.misses += 1;
                return Lookup::Miss;
            }
            Some(entry) if entry.is_expired_at(now) => true,
            Some(entry) => {
                entry.record_access(now);
                false
            }
        };

        if expired {
            self.stats.misses += 1;
            self.stats.expirations += 1;
            return match self.detach(key) {
                Some(entry) => Lookup::Expired(entry.into_value()),
                None => Lookup::Miss,
            };
        }

        self.stats.hits += 1;
        self.tracker.on_access(key);
        match self.entries.get(key) {
            Some(entry) => Lookup::Hit(entry.value().clone()),
            None => Lookup::Miss,
        }
    }

    /// Get a live value
    pub fn get(&mut self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.lookup(key).hit()
    }

    /// Insert a value using its in-memory size as weight
    pub fn put(&mut self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> bool {
        let size = std::mem::size_of::<V>() as u64;
        self.put_weighted(key, value, size, ttl)
    }

    /// Insert a value with an explicit byte weight.
    ///
    /// Returns false when the TTL is zero or the value alone exceeds `max_bytes`.
    pub fn put_weighted(
        &mut self,
        key: impl Into<String>,
        value: V,
        size: u64,
        ttl: Option<Duration>,
    ) -> bool {
        let key = key.into();
        if self.config.max_bytes > 0 && size > self.config.max_bytes {
            return false;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.next_version += 1;
        let Some(entry) = CacheEntry::new(
            key.clone(),
            value,
            size,
            Some(ttl),
            self.next_version,
            Instant::now(),
        ) else {
            return false;
        };

        let replaced_size = self.entries.get(&key).map(CacheEntry::size);
        let incoming_entries = usize::from(replaced_size.is_none());
        let incoming_bytes = size.saturating_sub(replaced_size.unwrap_or(0));
        self.make_room(&key, incoming_entries, incoming_bytes);

        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.current_bytes -= old.size();
        }
        self.current_bytes += size;
        self.tracker.on_insert(&key);
        true
    }

    /// Remove a key, returning its value
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.detach(key).map(CacheEntry::into_value)
    }

    /// Check presence without touching recency or expiry
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Borrow an entry without recording an access
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Evict until both bounds hold; returns the number evicted
    pub fn evict_if_needed(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_capacity(0, 0) {
            if !self.evict_one(None) {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Drop every expired entry; returns the number removed
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().to_string())
            .collect();

        for key in &expired {
            self.detach(key);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    /// Number of stored entries (including not-yet-purged expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total weight of stored entries
    pub fn size_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tracker.clear();
        self.current_bytes = 0;
    }

    fn over_capacity(&self, extra_entries: usize, extra_bytes: u64) -> bool {
        let over_count = self.config.max_entries > 0
            && self.entries.len() + extra_entries > self.config.max_entries;
        let over_bytes =
            self.config.max_bytes > 0 && self.current_bytes + extra_bytes > self.config.max_bytes;
        over_count || over_bytes
    }

    fn make_room(&mut self, incoming: &str, extra_entries: usize, extra_bytes: u64) {
        while self.over_capacity(extra_entries, extra_bytes) {
            if !self.evict_one(Some(incoming)) {
                break;
            }
        }
    }

    fn evict_one(&mut self, protect: Option<&str>) -> bool {
        // The key being overwritten must survive its own write
        let Some(victim) = self.tracker.victim_except(protect) else {
            return false;
        };
        if self.detach(&victim).is_some() {
            self.stats.evictions += 1;
        } else {
            self.tracker.on_remove(&victim);
        }
        true
    }

    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.current_bytes -= entry.size();
        self.tracker.on_remove(key);
        Some(entry)
    }
}

impl<V> std::fmt::Debug for EntryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.len())
            .field("bytes", &self.current_bytes)
            .field("policy", &self.config.policy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
