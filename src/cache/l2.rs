//! L2 Cache - Shared Store Adapter
//!
//! Thin layer over the [`SharedStore`] port that every node talks to. It owns
//! three concerns:
//!
//! - Deadlines: every call is bounded by `l2Timeout` and a timeout surfaces as
//!   [`Error::BackendUnavailable`], never as a hang
//! - Encoding: values are stored as JSON and a payload that fails to decode is
//!   deleted and reported as a miss
//! - Key layout for auxiliary records (fill locks and tag version counters)
//!
//! # Key Layout
//!
//! ```text
//! {namespace}:{id}[:v{n}]   cached value
//! lock:{key}                fill lock, value = owner id, TTL = lease
//! tagver:{tag}              tag version counter (decimal)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::ports::{LockToken, SharedStore, StoredValue};
use crate::error::{Error, Result};

const LOCK_PREFIX: &str = "lock:";
const TAG_VERSION_PREFIX: &str = "tagver:";

/// Storage key of the fill lock for `key`
pub fn lock_key(key: &str) -> String {
    format!("{}{}", LOCK_PREFIX, key)
}

/// Storage key of the version counter for `tag`
pub fn tag_version_key(tag: &str) -> String {
    format!("{}{}", TAG_VERSION_PREFIX, tag)
}

/// Decoded value read from L2
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteValue<V> {
    pub value: V,
    /// Encoded size, used as the L1 weight
    pub size: u64,
    pub ttl_remaining: Option<Duration>,
}

/// L2 statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2Stats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub malformed: u64,
}

/// Shared store client with deadlines and JSON encoding
pub struct RemoteCache {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    malformed: AtomicU64,
}

impl RemoteCache {
    /// Create a client whose every call is bounded by `timeout`
    pub fn new(store: Arc<dyn SharedStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Per-call deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(match err {
                    Error::BackendUnavailable { .. } => err,
                    other => Error::backend(operation, other.to_string()),
                })
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::backend(
                    operation,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    /// Read raw bytes
    pub async fn get_raw(&self, key: &str) -> Result<Option<StoredValue>> {
        self.call("get", self.store.get(key)).await
    }

    /// Read and decode a value.
    ///
    /// A payload that does not decode is deleted (best effort) and reported
    /// as `Ok(None)`, so the caller refetches from the source.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<RemoteValue<V>>> {
        let Some(stored) = self.get_raw(key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let decoded = self.decode_or_discard(key, stored).await;
        let counter = if decoded.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(decoded)
    }

    /// Decode a raw value, deleting it from the store when it is malformed
    pub async fn decode_or_discard<V: DeserializeOwned>(
        &self,
        key: &str,
        stored: StoredValue,
    ) -> Option<RemoteValue<V>> {
        match decode::<V>(key, &stored.data) {
            Ok(value) => Some(RemoteValue {
                value,
                size: stored.data.len() as u64,
                ttl_remaining: stored.ttl_remaining,
            }),
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %err, "Discarding malformed L2 entry");
                if let Err(delete_err) = self.delete(key).await {
                    debug!(key, error = %delete_err, "Failed to delete malformed L2 entry");
                }
                None
            }
        }
    }

    /// Encode and write a value; returns the encoded size
    pub async fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) -> Result<u64> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        let size = data.len() as u64;
        self.call("set", self.store.set(key, data, ttl)).await?;
        Ok(size)
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.call("delete", self.store.delete(key)).await
    }

    /// Try to take the fill lock for `key`
    pub async fn try_acquire_lock(&self, key: &str, lease: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new(key, lease);
        let owner = Bytes::from(token.owner.clone());
        let acquired = self
            .call(
                "set_if_absent",
                self.store.set_if_absent(&lock_key(key), owner, lease),
            )
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Release a fill lock if it is still ours; returns whether it was released
    pub async fn release_lock(&self, token: &LockToken) -> Result<bool> {
        self.call(
            "delete_if_equals",
            self.store
                .delete_if_equals(&lock_key(&token.key), token.owner.as_bytes()),
        )
        .await
    }

    /// Check whether anyone currently holds the fill lock for `key`
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(&lock_key(key)).await?.is_some())
    }

    /// Lease time left on the fill lock for `key`; `None` when unlocked or unknown
    pub async fn lock_ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .get_raw(&lock_key(key))
            .await?
            .and_then(|stored| stored.ttl_remaining))
    }

    /// Bump a tag's version counter; returns the new version
    pub async fn increment_version(&self, tag: &str) -> Result<u64> {
        self.call("increment", self.store.increment(&tag_version_key(tag)))
            .await
    }

    /// Read a tag's version counter; a missing counter is version 0
    pub async fn current_version(&self, tag: &str) -> Result<u64> {
        let key = tag_version_key(tag);
        let Some(stored) = self.get_raw(&key).await? else {
            return Ok(0);
        };
        std::str::from_utf8(&stored.data)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::MalformedEntry {
                key,
                reason: "tag version is not a decimal counter".to_string(),
            })
    }

    /// Get statistics
    pub fn stats(&self) -> L2Stats {
        L2Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

fn decode<V: DeserializeOwned>(key: &str, data: &[u8]) -> Result<V> {
    serde_json::from_slice(data).map_err(|err| Error::MalformedEntry {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemorySharedStore;
    use assert_matches::assert_matches;

    fn remote() -> (Arc<InMemorySharedStore>, RemoteCache) {
        let store = Arc::new(InMemorySharedStore::new());
        let remote = RemoteCache::new(store.clone(), Duration::from_millis(50));
        (store, remote)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip_reports_size() {
        let (_, remote) = remote();
        let size = remote
            .set("user:1", &vec![1u32, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(size, "[1,2,3]".len() as u64);

        let hit: RemoteValue<Vec<u32>> = remote.get("user:1").await.unwrap().unwrap();
        assert_eq!(hit.value, vec![1, 2, 3]);
        assert_eq!(hit.size, size);
        assert_eq!(remote.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_deleted() {
        let (store, remote) = remote();
        store
            .set("user:1", Bytes::from_static(b"{not json"), Duration::from_secs(60))
            .await
            .unwrap();

        let result: Option<RemoteValue<u32>> = remote.get("user:1").await.unwrap();
        assert!(result.is_none());
        assert!(!store.contains("user:1"));
        assert_eq!(remote.stats().malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_backend_unavailable() {
        let (store, remote) = remote();
        store.set_latency(Some(Duration::from_millis(500)));

        let result = remote.get::<u32>("user:1").await;
        assert_matches!(result, Err(Error::BackendUnavailable { operation: "get", .. }));
        assert_eq!(remote.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (store, remote) = remote();
        store.set_available(false);
        assert!(remote.delete("k").await.unwrap_err().is_recoverable());
        assert_eq!(remote.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lifecycle() {
        let (store, remote) = remote();
        let lease = Duration::from_secs(5);

        let token = remote.try_acquire_lock("user:1", lease).await.unwrap().unwrap();
        assert!(store.contains("lock:user:1"));
        assert!(remote.is_locked("user:1").await.unwrap());
        assert!(remote.try_acquire_lock("user:1", lease).await.unwrap().is_none());

        assert!(remote.release_lock(&token).await.unwrap());
        assert!(!remote.release_lock(&token).await.unwrap());
        assert!(!remote.is_locked("user:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_lease_takeover_is_noop() {
        let (_, remote) = remote();
        let lease = Duration::from_secs(5);

        let stale = remote.try_acquire_lock("k", lease).await.unwrap().unwrap();
        tokio::time::advance(lease).await;
        let fresh = remote.try_acquire_lock("k", lease).await.unwrap().unwrap();

        assert!(!remote.release_lock(&stale).await.unwrap());
        assert!(remote.is_locked("k").await.unwrap());
        assert!(remote.release_lock(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_versions() {
        let (_, remote) = remote();
        assert_eq!(remote.current_version("products").await.unwrap(), 0);
        assert_eq!(remote.increment_version("products").await.unwrap(), 1);
        assert_eq!(remote.increment_version("products").await.unwrap(), 2);
        assert_eq!(remote.current_version("products").await.unwrap(), 2);
        assert_eq!(tag_version_key("products"), "tagver:products");
    }
}
