//! In-Memory Shared Store Adapter
//!
//! Implements the `SharedStore` port on a `DashMap`, standing in for a
//! networked key/value server. Every node of a test cluster holds an `Arc` to
//! the same instance.
//!
//! Expiry is lazy: reads and conditional writes treat an expired key as
//! absent and drop it on the spot.
//!
//! Fault injection makes the store behave like an unreachable or slow
//! backend, which is how the degraded read paths are exercised.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::ports::{SharedStore, StoredValue};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Slot {
    data: Bytes,
    expires_at: Instant,
}

impl Slot {
    fn new(data: Bytes, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Operation counters, useful for asserting on traffic in tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOpCounts {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub conditional: u64,
    pub increments: u64,
    pub rejected: u64,
}

/// DashMap-backed shared store.
#[derive(Debug)]
pub struct InMemorySharedStore {
    entries: DashMap<String, Slot>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    conditional: AtomicU64,
    increments: AtomicU64,
    rejected: AtomicU64,
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            conditional: AtomicU64::new(0),
            increments: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going down (false) or coming back (true).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of stored keys, including ones that expired but were not read since.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check for a live key without counting an operation.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|slot| !slot.is_expired(now))
            .unwrap_or(false)
    }

    /// Get operation counts.
    pub fn op_counts(&self) -> StoreOpCounts {
        StoreOpCounts {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            conditional: self.conditional.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_available() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::backend(operation, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.enter("get").await?;
        self.gets.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(slot) if !slot.is_expired(now) => Some(StoredValue {
                data: slot.data.clone(),
                ttl_remaining: Some(slot.expires_at.saturating_duration_since(now)),
            }),
            Some(_) => None,
            None => return Ok(None),
        };

        if value.is_none() {
            self.entries.remove_if(key, |_, slot| slot.is_expired(now));
            trace!(key, "Dropped expired shared entry");
        }
        Ok(value)
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.enter("set").await?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.to_string(), Slot::new(data, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter("delete").await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, slot)| !slot.is_expired(now))
            .unwrap_or(false))
    }

    async fn set_if_absent(&self, key: &str, data: Bytes, ttl: Duration) -> Result<bool> {
        self.enter("set_if_absent").await?;
        self.conditional.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::new(data, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(data, ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.enter("delete_if_equals").await?;
        self.conditional.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, slot| {
                !slot.is_expired(now) && slot.data.as_ref() == expected
            })
            .is_some())
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        self.enter("increment").await?;
        self.increments.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            data: Bytes::from_static(b"0"),
            expires_at: far_future(now),
        });

        let current = if slot.is_expired(now) {
            0
        } else {
            std::str::from_utf8(&slot.data)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| Error::backend("increment", format!("{} is not a counter", key)))?
        };

        let next = current + 1;
        slot.data = Bytes::from(next.to_string());
        slot.expires_at = far_future(now);
        Ok(next)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.is_available())
    }
}

/// Counters never expire
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(100 * 365 * 86_400)
}

// =============================================================================
// Tests
// =============================================================================
