//! L1 Cache - Process-Local Sharded Store
//!
//! Per-node cache in front of the shared store. Keys are routed to one of N
//! shards, each a mutex-guarded [`EntryStore`], so lookups on different keys
//! rarely contend.
//!
//! ```text
//!            key ──fx_hash──▶ shard index
//!                                 │
//!   ┌──────────┬──────────┬───────┴──┬──────────┐
//!   │ shard 0  │ shard 1  │   ...    │ shard N-1│
//!   │ Mutex<   │ Mutex<   │          │ Mutex<   │
//!   │  Store>  │  Store>  │          │  Store>  │
//!   └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Capacity bounds are divided exactly across shards, and the eviction policy
//! is applied within each shard.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::entry::{shard_index, Lookup};
use super::policy::EvictionPolicy;
use super::store::{EntryStore, StoreConfig};
use crate::config::CacheConfig;

/// L1 cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct L1Stats {
    /// Number of entries
    pub entries: usize,
    /// Current size in bytes
    pub size_bytes: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Eviction count
    pub evictions: u64,
    /// Expired entries removed, lazily or by the sweeper
    pub expirations: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

/// Sharded process-local cache
pub struct LocalCache<V> {
    shards: Box<[Mutex<EntryStore<V>>]>,
    policy: EvictionPolicy,
}

impl<V> LocalCache<V> {
    /// Build from engine configuration
    pub fn new(config: &CacheConfig) -> Self {
        let store = StoreConfig {
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            default_ttl: config.default_ttl,
            policy: config.eviction_policy,
        };
        Self::with_shards(store, config.shard_count)
    }

    /// Build with an explicit shard count (rounded down to a power of two).
    ///
    /// The shard count is reduced when the entry or byte bound is smaller, so
    /// every shard gets at least one entry and one byte of the exact split.
    pub fn with_shards(store: StoreConfig, shard_count: usize) -> Self {
        let mut shard_count = floor_power_of_two(shard_count.max(1));
        if store.max_entries > 0 {
            shard_count = shard_count.min(floor_power_of_two(store.max_entries));
        }
        if store.max_bytes > 0 {
            let max_bytes = usize::try_from(store.max_bytes).unwrap_or(usize::MAX);
            shard_count = shard_count.min(floor_power_of_two(max_bytes));
        }

        let shards: Vec<_> = (0..shard_count)
            .map(|i| {
                let config = StoreConfig {
                    max_entries: split(store.max_entries as u64, shard_count, i) as usize,
                    max_bytes: split(store.max_bytes, shard_count, i),
                    ..store.clone()
                };
                Mutex::new(EntryStore::new(config))
            })
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            policy: store.policy,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<EntryStore<V>> {
        &self.shards[shard_index(key, self.shards.len())]
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Eviction policy applied in every shard
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Look up a key, reporting expired entries separately
    pub fn lookup(&self, key: &str) -> Lookup<V>
    where
        V: Clone,
    {
        self.shard(key).lock().lookup(key)
    }

    /// Get a live value
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.lookup(key).hit()
    }

    /// Store a value with an explicit byte weight
    pub fn set(&self, key: &str, value: V, size: u64, ttl: Option<Duration>) -> bool {
        let stored = self.shard(key).lock().put_weighted(key, value, size, ttl);
        if !stored {
            trace!(key, size, "L1 rejected entry");
        }
        stored
    }

    /// Remove a key; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.shard(key).lock().remove(key).is_some()
    }

    /// Presence check that does not count as an access
    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().contains(key)
    }

    /// Remaining TTL of a stored entry
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = tokio::time::Instant::now();
        self.shard(key)
            .lock()
            .peek(key)
            .and_then(|entry| entry.remaining_ttl(now))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|shard| shard.lock().size_bytes()).sum()
    }

    /// Clear every shard
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Remove expired entries from every shard
    pub fn purge_expired(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().purge_expired())
            .sum()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> L1Stats {
        let mut stats = L1Stats::default();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            let counters = shard.stats();
            stats.entries += shard.len();
            stats.size_bytes += shard.size_bytes();
            stats.hits += counters.hits;
            stats.misses += counters.misses;
            stats.evictions += counters.evictions;
            stats.expirations += counters.expirations;
        }
        let total = stats.hits + stats.misses;
        if total > 0 {
            stats.hit_ratio = stats.hits as f64 / total as f64;
        }
        stats
    }
}

impl<V: Send + 'static> LocalCache<V> {
    /// Spawn a task that purges expired entries on an interval until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("L1 sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Swept expired L1 entries");
                        }
                    }
                }
            }
        })
    }
}

impl<V> std::fmt::Debug for LocalCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("shards", &self.shards.len())
            .field("policy", &self.policy)
            .finish()
    }
}

fn floor_power_of_two(n: usize) -> usize {
    if n.is_power_of_two() {
        n
    } else {
        n.next_power_of_two() >> 1
    }
}

/// Share of `total` for shard `index`; 0 stays unbounded
fn split(total: u64, shards: usize, index: usize) -> u64 {
    if total == 0 {
        return 0;
    }
    let shards = shards as u64;
    let base = total / shards;
    let extra = u64::from((index as u64) < total % shards);
    base + extra
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, shards: usize) -> LocalCache<String> {
        LocalCache::with_shards(
            StoreConfig {
                max_entries,
                ..Default::default()
            },
            shards,
        )
    }

    #[test]
    fn test_shard_count_rounding() {
        assert_eq!(cache(1000, 16).shard_count(), 16);
        assert_eq!(cache(1000, 12).shard_count(), 8);
        assert_eq!(cache(5, 16).shard_count(), 4);
        assert_eq!(cache(0, 16).shard_count(), 16);
        assert_eq!(cache(1, 0).shard_count(), 1);
    }

    #[test]
    fn test_capacity_split_is_exact() {
        for (total, shards) in [(100u64, 16usize), (5, 4), (1, 1), (17, 8)] {
            let sum: u64 = (0..shards).map(|i| split(total, shards, i)).sum();
            assert_eq!(sum, total);
        }
        assert_eq!(split(0, 8, 3), 0);

        let tiny = LocalCache::<String>::with_shards(
            StoreConfig {
                max_entries: 1000,
                max_bytes: 4,
                ..Default::default()
            },
            16,
        );
        assert_eq!(tiny.shard_count(), 4);
        let bytes: u64 = tiny
            .shards
            .iter()
            .map(|shard| shard.lock().config().max_bytes)
            .sum();
        assert_eq!(bytes, 4);
        let entries: usize = tiny
            .shards
            .iter()
            .map(|shard| shard.lock().config().max_entries)
            .sum();
        assert_eq!(entries, 1000);
    }

    #[test]
    fn test_set_get_delete() {
        let cache = cache(100, 4);
        assert!(cache.set("u:1", "alice".to_string(), 5, None));
        assert_eq!(cache.get("u:1").as_deref(), Some("alice"));
        assert!(cache.contains("u:1"));
        assert_eq!(cache.size_bytes(), 5);

        assert!(cache.delete("u:1"));
        assert!(!cache.delete("u:1"));
        assert_eq!(cache.get("u:1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_total_entries_bounded() {
        let cache = cache(64, 16);
        for i in 0..1000 {
            cache.set(&format!("k{}", i), i.to_string(), 1, None);
        }
        assert!(cache.len() <= 64);
        assert!(cache.stats().evictions >= 1000 - 64);
    }

    #[test]
    fn test_single_shard_lru_order() {
        let cache = cache(3, 1);
        cache.set("a", "1".into(), 1, None);
        cache.set("b", "2".into(), 1, None);
        cache.set("c", "3".into(), 1, None);
        cache.get("a");
        cache.set("d", "4".into(), 1, None);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_stats_aggregate() {
        let cache = cache(100, 8);
        cache.set("a", "1".into(), 1, None);
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lookup() {
        let cache = cache(100, 4);
        cache.set("a", "1".into(), 1, Some(Duration::from_secs(5)));
        assert_eq!(cache.remaining_ttl("a"), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.lookup("a"), Lookup::Expired("1".to_string()));
        assert_eq!(cache.lookup("a"), Lookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_and_stops() {
        let cache = Arc::new(cache(100, 4));
        cache.set("short", "1".into(), 1, Some(Duration::from_secs(1)));
        cache.set("long", "2".into(), 1, Some(Duration::from_secs(3600)));

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("long"));
        assert_eq!(cache.stats().expirations, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
