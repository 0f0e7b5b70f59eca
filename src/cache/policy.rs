//! Cache Eviction Policies
//!
//! A closed set of victim-selection strategies behind one tracker. The policy
//! is chosen when the store is built and never swapped afterwards.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the least recently touched key
    #[default]
    Lru,
    /// Evict the least frequently used key, ties broken by recency
    Lfu,
    /// Evict the earliest inserted key
    Fifo,
    /// Evict a uniformly sampled key
    Random,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "LRU"),
            EvictionPolicy::Lfu => write!(f, "LFU"),
            EvictionPolicy::Fifo => write!(f, "FIFO"),
            EvictionPolicy::Random => write!(f, "Random"),
        }
    }
}

impl std::str::FromStr for EvictionPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            "random" => Ok(EvictionPolicy::Random),
            other => Err(crate::error::Error::Config(format!(
                "unknown eviction policy: {}",
                other
            ))),
        }
    }
}

/// Ordered index of keys by a monotonically increasing tick
#[derive(Debug, Default)]
struct TickOrder {
    by_tick: BTreeMap<u64, String>,
    ticks: HashMap<String, u64>,
}

impl TickOrder {
    fn place(&mut self, key: &str, tick: u64) {
        if let Some(old) = self.ticks.insert(key.to_string(), tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(tick, key.to_string());
    }

    fn contains(&self, key: &str) -> bool {
        self.ticks.contains_key(key)
    }

    fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    fn oldest_except(&self, skip: Option<&str>) -> Option<&str> {
        self.by_tick
            .values()
            .map(String::as_str)
            .find(|key| Some(*key) != skip)
    }

    fn clear(&mut self) {
        self.by_tick.clear();
        self.ticks.clear();
    }
}

/// Keys ordered by (frequency, last-touch tick)
#[derive(Debug, Default)]
struct FrequencyOrder {
    by_rank: BTreeMap<(u64, u64), String>,
    ranks: HashMap<String, (u64, u64)>,
}

impl FrequencyOrder {
    fn bump(&mut self, key: &str, tick: u64) {
        let freq = match self.ranks.get(key) {
            Some(rank) => {
                self.by_rank.remove(rank);
                rank.0 + 1
            }
            None => 1,
        };
        self.ranks.insert(key.to_string(), (freq, tick));
        self.by_rank.insert((freq, tick), key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(rank) = self.ranks.remove(key) {
            self.by_rank.remove(&rank);
        }
    }

    fn coldest_except(&self, skip: Option<&str>) -> Option<&str> {
        self.by_rank
            .values()
            .map(String::as_str)
            .find(|key| Some(*key) != skip)
    }

    fn frequency(&self, key: &str) -> Option<u64> {
        self.ranks.get(key).map(|rank| rank.0)
    }

    fn clear(&mut self) {
        self.by_rank.clear();
        self.ranks.clear();
    }
}

/// Dense key set with O(1) uniform sampling
#[derive(Debug)]
struct SampleSet {
    keys: Vec<String>,
    positions: HashMap<String, usize>,
    rng: StdRng,
}

impl SampleSet {
    fn new(rng: StdRng) -> Self {
        Self {
            keys: Vec::new(),
            positions: HashMap::new(),
            rng,
        }
    }

    fn insert(&mut self, key: &str) {
        if !self.positions.contains_key(key) {
            self.positions.insert(key.to_string(), self.keys.len());
            self.keys.push(key.to_string());
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(pos) = self.positions.remove(key) {
            self.keys.swap_remove(pos);
            if let Some(moved) = self.keys.get(pos) {
                self.positions.insert(moved.clone(), pos);
            }
        }
    }

    fn sample_except(&mut self, skip: Option<&str>) -> Option<String> {
        let skip_pos = skip.and_then(|key| self.positions.get(key).copied());
        let candidates = self.keys.len() - usize::from(skip_pos.is_some());
        if candidates == 0 {
            return None;
        }
        let mut idx = self.rng.gen_range(0..candidates);
        if matches!(skip_pos, Some(pos) if idx >= pos) {
            idx += 1;
        }
        self.keys.get(idx).cloned()
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.positions.clear();
    }
}

#[derive(Debug)]
enum Order {
    Lru(TickOrder),
    Lfu(FrequencyOrder),
    Fifo(TickOrder),
    Random(SampleSet),
}

/// Per-store bookkeeping that answers "which key goes next"
#[derive(Debug)]
pub struct EvictionTracker {
    policy: EvictionPolicy,
    order: Order,
    tick: u64,
}

impl EvictionTracker {
    /// Create a tracker for the given policy
    pub fn new(policy: EvictionPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Create a tracker whose random sampling is reproducible
    pub fn with_seed(policy: EvictionPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: EvictionPolicy, rng: StdRng) -> Self {
        let order = match policy {
            EvictionPolicy::Lru => Order::Lru(TickOrder::default()),
            EvictionPolicy::Lfu => Order::Lfu(FrequencyOrder::default()),
            EvictionPolicy::Fifo => Order::Fifo(TickOrder::default()),
            EvictionPolicy::Random => Order::Random(SampleSet::new(rng)),
        };
        Self {
            policy,
            order,
            tick: 0,
        }
    }

    /// Policy this tracker implements
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// A key was written (new or overwritten)
    pub fn on_insert(&mut self, key: &str) {
        let tick = self.next_tick();
        match &mut self.order {
            Order::Lru(order) => order.place(key, tick),
            Order::Lfu(order) => order.bump(key, tick),
            // Overwrites keep their original queue position
            Order::Fifo(order) => {
                if !order.contains(key) {
                    order.place(key, tick);
                }
            }
            Order::Random(set) => set.insert(key),
        }
    }

    /// A key was read
    pub fn on_access(&mut self, key: &str) {
        let tick = self.next_tick();
        match &mut self.order {
            Order::Lru(order) => order.place(key, tick),
            Order::Lfu(order) => order.bump(key, tick),
            Order::Fifo(_) | Order::Random(_) => {}
        }
    }

    /// A key left the store
    pub fn on_remove(&mut self, key: &str) {
        match &mut self.order {
            Order::Lru(order) | Order::Fifo(order) => order.remove(key),
            Order::Lfu(order) => order.remove(key),
            Order::Random(set) => set.remove(key),
        }
    }

    /// Next victim, without removing it
    pub fn victim(&mut self) -> Option<String> {
        self.victim_except(None)
    }

    /// Next victim other than `skip`
    pub fn victim_except(&mut self, skip: Option<&str>) -> Option<String> {
        match &mut self.order {
            Order::Lru(order) | Order::Fifo(order) => order.oldest_except(skip).map(str::to_string),
            Order::Lfu(order) => order.coldest_except(skip).map(str::to_string),
            Order::Random(set) => set.sample_except(skip),
        }
    }

    /// Recorded use count under LFU
    pub fn frequency(&self, key: &str) -> Option<u64> {
        match &self.order {
            Order::Lfu(order) => order.frequency(key),
            _ => None,
        }
    }

    /// Forget every key
    pub fn clear(&mut self) {
        match &mut self.order {
            Order::Lru(order) | Order::Fifo(order) => order.clear(),
            Order::Lfu(order) => order.clear(),
            Order::Random(set) => set.clear(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse_and_display() {
        assert_eq!("LRU".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert_eq!("lfu".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lfu);
        assert_eq!("Fifo".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Fifo);
        assert_eq!(
            "random".parse::<EvictionPolicy>().unwrap(),
            EvictionPolicy::Random
        );
        assert!("arc".parse::<EvictionPolicy>().is_err());
        assert_eq!(EvictionPolicy::Lfu.to_string(), "LFU");
    }

    #[test]
    fn test_policy_serde_lowercase() {
        let json = serde_json::to_string(&EvictionPolicy::Fifo).unwrap();
        assert_eq!(json, "\"fifo\"");
        let parsed: EvictionPolicy = serde_json::from_str("\"random\"").unwrap();
        assert_eq!(parsed, EvictionPolicy::Random);
    }

    #[test]
    fn test_lru_victim_follows_access() {
        let mut tracker = EvictionTracker::new(EvictionPolicy::Lru);
        tracker.on_insert("a");
        tracker.on_insert("b");
        tracker.on_insert("c");
        assert_eq!(tracker.victim().as_deref(), Some("a"));

        tracker.on_access("a");
        assert_eq!(tracker.victim().as_deref(), Some("b"));

        tracker.on_remove("b");
        assert_eq!(tracker.victim().as_deref(), Some("c"));
    }

    #[test]
    fn test_fifo_ignores_access_and_overwrite() {
        let mut tracker = EvictionTracker::new(EvictionPolicy::Fifo);
        tracker.on_insert("a");
        tracker.on_insert("b");
        tracker.on_access("a");
        tracker.on_insert("a");
        assert_eq!(tracker.victim().as_deref(), Some("a"));

        tracker.on_remove("a");
        assert_eq!(tracker.victim().as_deref(), Some("b"));
    }

    #[test]
    fn test_lfu_victim_is_least_frequent() {
        let mut tracker = EvictionTracker::new(EvictionPolicy::Lfu);
        tracker.on_insert("a");
        tracker.on_insert("b");
        tracker.on_insert("c");
        tracker.on_access("a");
        tracker.on_access("a");
        tracker.on_access("c");

        assert_eq!(tracker.frequency("a"), Some(3));
        assert_eq!(tracker.frequency("b"), Some(1));
        assert_eq!(tracker.victim().as_deref(), Some("b"));
    }

    #[test]
    fn test_lfu_ties_broken_by_recency() {
        let mut tracker = EvictionTracker::new(EvictionPolicy::Lfu);
        tracker.on_insert("a");
        tracker.on_insert("b");
        tracker.on_access("b");
        tracker.on_access("a");
        // Both at frequency 2; "b" was touched less recently
        assert_eq!(tracker.victim().as_deref(), Some("b"));
    }

    #[test]
    fn test_random_victim_is_live_key() {
        let mut tracker = EvictionTracker::with_seed(EvictionPolicy::Random, 7);
        for key in ["a", "b", "c", "d"] {
            tracker.on_insert(key);
        }
        tracker.on_remove("c");

        for _ in 0..100 {
            let victim = tracker.victim().unwrap();
            assert_ne!(victim, "c");
            assert!(["a", "b", "d"].contains(&victim.as_str()));
        }
    }

    #[test]
    fn test_random_sampling_covers_all_keys() {
        let mut tracker = EvictionTracker::with_seed(EvictionPolicy::Random, 42);
        for key in ["a", "b", "c"] {
            tracker.on_insert(key);
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(tracker.victim().unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_victim_except_skips_protected_key() {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::Fifo,
            EvictionPolicy::Random,
        ] {
            let mut tracker = EvictionTracker::with_seed(policy, 3);
            tracker.on_insert("a");
            assert_eq!(tracker.victim_except(Some("a")), None);

            tracker.on_insert("b");
            for _ in 0..20 {
                assert_eq!(tracker.victim_except(Some("a")).as_deref(), Some("b"));
            }
        }
    }

    #[test]
    fn test_clear_empties_tracker() {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::Fifo,
            EvictionPolicy::Random,
        ] {
            let mut tracker = EvictionTracker::new(policy);
            tracker.on_insert("a");
            tracker.clear();
            assert_eq!(tracker.victim(), None, "policy {}", policy);
            assert_eq!(tracker.policy(), policy);
        }
    }
}
