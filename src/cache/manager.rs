//! Cache Manager - Cache-Aside Facade
//!
//! The single entry point applications use. Reads go L1 → L2 → source, with
//! the stampede guard around the source call:
//!
//! ```text
//! get(key, fetch)
//!   │
//!   ├─ L1 hit ───────────────────────────────────────────────▶ value
//!   ├─ L2 hit ──── fill L1 (remaining L2 TTL, capped) ───────▶ value
//!   │    └─ L2 down ─── fetch directly, fill L1 only ────────▶ value
//!   └─ acquire lock:{key}
//!        ├─ Filler ─── re-check L2, fetch, write L2, L1, release
//!        ├─ Contended ─ wait_for_fill
//!        │     ├─ Filled ───────── fill L1 ──────────────────▶ value
//!        │     ├─ Acquired ─────── become the filler
//!        │     └─ TimedOut ─────── stale L1 copy (flagged)
//!        │                         │ else direct fetch if allowed
//!        │                         └ else LockTimeout
//!        └─ Unavailable ── fetch directly, fill L1 only
//! ```
//!
//! Failures of L1, L2 or the lock never reach the caller on the read path;
//! only a source failure does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::Lookup;
use super::invalidation::{require_tag_versioning, InvalidationCoordinator, InvalidationOutcome};
use super::l1::LocalCache;
use super::l2::RemoteCache;
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::stampede::{Acquisition, StampedeConfig, StampedeGuard, WaitOutcome};
use crate::adapters::{InMemoryEventBus, InMemorySharedStore};
use crate::config::CacheConfig;
use crate::domain::events::InvalidationEvent;
use crate::domain::ports::{EventBus, EventHandler, LockToken, SharedStore, Source, SubscriptionId};
use crate::error::{BoxError, Error, Result};

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Process-local cache
    L1,
    /// Shared store
    L2,
    /// Freshly loaded from the source of record
    Source,
    /// Expired local copy served because the fill did not land in time
    Stale,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::L1 => write!(f, "L1"),
            Origin::L2 => write!(f, "L2"),
            Origin::Source => write!(f, "source"),
            Origin::Stale => write!(f, "stale"),
        }
    }
}

/// Value returned by a read, with provenance
#[derive(Debug, Clone, PartialEq)]
pub struct CacheValue<V> {
    pub value: V,
    pub origin: Origin,
    /// Set only when an expired value was served deliberately
    pub stale: bool,
}

impl<V> CacheValue<V> {
    fn new(value: V, origin: Origin) -> Self {
        Self {
            value,
            origin,
            stale: origin == Origin::Stale,
        }
    }

    pub fn into_inner(self) -> V {
        self.value
    }
}

struct Inner<V> {
    config: CacheConfig,
    local: Arc<LocalCache<V>>,
    remote: Arc<RemoteCache>,
    guard: StampedeGuard,
    coordinator: InvalidationCoordinator,
    metrics: CacheMetrics,
    bus: Arc<dyn EventBus>,
}

impl<V> Inner<V> {
    fn apply_event(&self, event: &InvalidationEvent) {
        if let Some(key) = self.coordinator.handle_event(event) {
            if self.local.delete(&key) {
                debug!(key, "Evicted L1 entry on invalidation event");
            }
        }
        self.metrics.record_event_applied();
    }
}

/// Cache-aside facade over L1, L2, the stampede guard and invalidation
pub struct CacheManager<V> {
    inner: Arc<Inner<V>>,
    cancel: CancellationToken,
    subscription: Option<SubscriptionId>,
    sweeper: Option<JoinHandle<()>>,
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a node attached to a shared store and event bus.
    ///
    /// Subscribes to invalidation events and starts the L1 sweeper as configured.
    pub async fn new(
        config: CacheConfig,
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        config.validate()?;

        let node_id = uuid::Uuid::new_v4().to_string();
        let remote = Arc::new(RemoteCache::new(store, config.l2_timeout));
        let local = Arc::new(LocalCache::new(&config));
        let guard = StampedeGuard::new(StampedeConfig {
            lease_ttl: config.lock_lease_ttl,
            wait_timeout: config.stampede_wait_timeout,
            poll_interval: config.poll_interval,
            poll_jitter: config.poll_jitter,
        });
        let coordinator = InvalidationCoordinator::new(
            Arc::clone(&remote),
            Arc::clone(&bus),
            config.invalidation_topic.clone(),
            node_id,
        );

        let inner = Arc::new(Inner {
            config,
            local,
            remote,
            guard,
            coordinator,
            metrics: CacheMetrics::new(),
            bus,
        });

        let subscription = if inner.config.event_invalidation_enabled {
            let weak = Arc::downgrade(&inner);
            let handler: EventHandler = Arc::new(move |event: InvalidationEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_event(&event);
                }
            });
            let id = inner
                .bus
                .subscribe(&inner.config.invalidation_topic, handler)
                .await?;
            Some(id)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let sweeper = inner
            .config
            .sweep_interval
            .map(|interval| inner.local.spawn_sweeper(interval, cancel.child_token()));

        info!(
            node = %inner.coordinator.node_id(),
            policy = %inner.config.eviction_policy,
            shards = inner.local.shard_count(),
            "Cache node started"
        );

        Ok(Self {
            inner,
            cancel,
            subscription,
            sweeper,
        })
    }

    /// Create a standalone node with its own in-memory store and bus
    pub async fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(InMemorySharedStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key`, loading it with `fetch` on a miss
    pub async fn get<F, Fut>(&self, key: &str, fetch: F) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        self.get_with_cancel(key, fetch, &CancellationToken::new())
            .await
    }

    /// Read `key` with a cancellation token.
    ///
    /// Cancelling while waiting on another filler returns `Cancelled` right
    /// away. Cancelling a filler releases the lock; the source call keeps
    /// running detached and its result is discarded.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn get_with_cancel<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        cancel: &CancellationToken,
    ) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                key: key.to_string(),
            });
        }

        let inner = &self.inner;
        let stale = match inner.local.lookup(key) {
            Lookup::Hit(value) => {
                inner.metrics.record_l1_hit();
                debug!(key, "L1 hit");
                return Ok(CacheValue::new(value, Origin::L1));
            }
            Lookup::Expired(value) => Some(value),
            Lookup::Miss => None,
        };
        inner.metrics.record_l1_miss();

        match inner.remote.get::<V>(key).await {
            Ok(Some(hit)) => {
                inner.metrics.record_l2_hit();
                debug!(key, "L2 hit");
                self.fill_local(key, hit.value.clone(), hit.size, hit.ttl_remaining);
                return Ok(CacheValue::new(hit.value, Origin::L2));
            }
            Ok(None) => inner.metrics.record_l2_miss(),
            Err(err) => {
                inner.metrics.record_l2_error();
                warn!(key, error = %err, "L2 read failed, fetching from source");
                return self.fetch_direct(key, fetch, cancel, true).await;
            }
        }

        match inner.guard.acquire(&inner.remote, key).await {
            Acquisition::Filler(token) => {
                inner.metrics.record_lock_acquired();
                self.fill(key, token, fetch, cancel).await
            }
            Acquisition::Contended => {
                inner.metrics.record_lock_contended();
                self.await_fill(key, stale, fetch, cancel).await
            }
            Acquisition::Unavailable(err) => {
                warn!(key, error = %err, "Fill lock unavailable, fetching from source");
                self.fetch_direct(key, fetch, cancel, true).await
            }
        }
    }

    /// Read a key that belongs to `tag`, under the tag's current version
    pub async fn get_tagged<F, Fut>(&self, tag: &str, key: &str, fetch: F) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        let versioned = self.tagged_key(tag, key).await?;
        self.get(&versioned, fetch).await
    }

    /// Read `key` using a source port
    pub async fn get_from(&self, key: &str, source: Arc<dyn Source<V>>) -> Result<CacheValue<V>> {
        let owned = key.to_string();
        self.get(key, move || async move { source.fetch(&owned).await })
            .await
    }

    /// The key `get_tagged` would read, e.g. `product:7:v3`
    pub async fn tagged_key(&self, tag: &str, key: &str) -> Result<String> {
        require_tag_versioning(self.inner.config.tag_versioning_enabled)?;
        Ok(self
            .inner
            .coordinator
            .versioned_key(tag, key)
            .await
            .to_string())
    }

    async fn fill<F, Fut>(
        &self,
        key: &str,
        token: LockToken,
        fetch: F,
        cancel: &CancellationToken,
    ) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        let inner = &self.inner;

        // A previous filler may have landed between our miss and the lock
        match inner.remote.get::<V>(key).await {
            Ok(Some(hit)) => {
                inner.guard.release(&inner.remote, &token).await;
                inner.metrics.record_l2_hit();
                self.fill_local(key, hit.value.clone(), hit.size, hit.ttl_remaining);
                return Ok(CacheValue::new(hit.value, Origin::L2));
            }
            Ok(None) => {}
            Err(err) => debug!(key, error = %err, "L2 re-check failed"),
        }

        let started = Instant::now();
        let mut task = tokio::spawn(fetch());
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = cancel.cancelled() => {
                inner.guard.release(&inner.remote, &token).await;
                inner.metrics.record_cancellation();
                debug!(key, "Filler cancelled, source call left running");
                return Err(Error::Cancelled { key: key.to_string() });
            }
        };
        let fetched = joined.unwrap_or_else(|join_err| Err(join_err.into()));
        inner
            .metrics
            .record_source_fetch(started.elapsed(), fetched.is_ok(), false);

        match fetched {
            Ok(value) => {
                let ttl = inner.config.default_ttl;
                let size = self.write_remote(key, &value, ttl).await;
                self.fill_local(key, value.clone(), size, Some(ttl));
                inner.guard.release(&inner.remote, &token).await;
                debug!(key, size, "Filled from source");
                Ok(CacheValue::new(value, Origin::Source))
            }
            Err(err) => {
                inner.guard.release(&inner.remote, &token).await;
                warn!(key, error = %err, "Source fetch failed");
                Err(Error::Source(err))
            }
        }
    }

    async fn await_fill<F, Fut>(
        &self,
        key: &str,
        stale: Option<V>,
        fetch: F,
        cancel: &CancellationToken,
    ) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        let inner = &self.inner;
        let outcome = match inner.guard.wait_for_fill(&inner.remote, key, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                inner.metrics.record_cancellation();
                debug!(key, "Waiter cancelled");
                return Err(err);
            }
        };

        match outcome {
            WaitOutcome::Filled(stored) => {
                match inner.remote.decode_or_discard::<V>(key, stored).await {
                    Some(hit) => {
                        inner.metrics.record_wait_filled();
                        self.fill_local(key, hit.value.clone(), hit.size, hit.ttl_remaining);
                        Ok(CacheValue::new(hit.value, Origin::L2))
                    }
                    None => self.fetch_direct(key, fetch, cancel, true).await,
                }
            }
            WaitOutcome::Acquired(token) => {
                inner.metrics.record_lock_takeover();
                inner.metrics.record_lock_acquired();
                self.fill(key, token, fetch, cancel).await
            }
            WaitOutcome::TimedOut { waited } => {
                inner.metrics.record_wait_timeout();
                if let Some(value) = stale {
                    inner.metrics.record_stale_served();
                    warn!(key, ?waited, "Serving stale value after wait timeout");
                    return Ok(CacheValue::new(value, Origin::Stale));
                }
                if inner.config.allow_thundering_fallback {
                    warn!(key, ?waited, "Wait timed out, calling source directly");
                    return self.fetch_direct(key, fetch, cancel, false).await;
                }
                Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited,
                })
            }
            WaitOutcome::Unavailable(err) => {
                inner.metrics.record_l2_error();
                warn!(key, error = %err, "L2 lost while waiting, fetching from source");
                self.fetch_direct(key, fetch, cancel, true).await
            }
        }
    }

    /// Call the source outside the fill lock
    async fn fetch_direct<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        cancel: &CancellationToken,
        populate_local: bool,
    ) -> Result<CacheValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
    {
        let inner = &self.inner;
        let started = Instant::now();
        let fetched = tokio::select! {
            fetched = fetch() => fetched,
            _ = cancel.cancelled() => {
                inner.metrics.record_cancellation();
                return Err(Error::Cancelled { key: key.to_string() });
            }
        };
        inner
            .metrics
            .record_source_fetch(started.elapsed(), fetched.is_ok(), true);

        let value = fetched.map_err(Error::Source)?;
        if populate_local {
            let size = encoded_size(&value);
            self.fill_local(key, value.clone(), size, Some(inner.config.default_ttl));
        }
        Ok(CacheValue::new(value, Origin::Source))
    }

    fn fill_local(&self, key: &str, value: V, size: u64, ttl: Option<Duration>) {
        let config = &self.inner.config;
        let ttl = config.local_ttl(ttl.unwrap_or(config.default_ttl));
        self.inner.local.set(key, value, size, Some(ttl));
    }

    async fn write_remote(&self, key: &str, value: &V, ttl: Duration) -> u64 {
        match self.inner.remote.set(key, value, ttl).await {
            Ok(size) => size,
            Err(err) => {
                self.inner.metrics.record_l2_error();
                warn!(key, error = %err, "L2 write failed");
                encoded_size(value)
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write-through: L2 first, then L1. An L2 failure is logged and the write continues locally.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        if ttl.is_zero() {
            return Err(Error::Config("ttl must be greater than zero".to_string()));
        }
        let size = self.write_remote(key, &value, ttl).await;
        self.fill_local(key, value, size, Some(ttl));
        Ok(())
    }

    /// Drop `key` here, in L2, and (via the event bus) on every other node.
    ///
    /// A fill already in flight for `key` is not cancelled. If its source
    /// call started before this invalidation, it writes the older value back
    /// to L2 after the delete, and that value lives until its TTL runs out.
    /// Use [`invalidate_tag`](Self::invalidate_tag) when that window matters;
    /// a late fill then lands under the retired version key.
    #[instrument(level = "debug", skip(self))]
    pub async fn invalidate(&self, key: &str) -> InvalidationOutcome {
        self.inner.local.delete(key);
        self.inner.metrics.record_invalidation();
        self.inner.coordinator.invalidate(key).await
    }

    /// Make every key under `tag` unreachable; returns the new version
    #[instrument(level = "debug", skip(self))]
    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64> {
        require_tag_versioning(self.inner.config.tag_versioning_enabled)?;
        let version = self.inner.coordinator.invalidate_tag(tag).await?;
        self.inner.metrics.record_tag_invalidation();
        Ok(version)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Get snapshot of this node's metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(&self.inner.local.stats(), &self.inner.remote.stats())
    }

    pub fn local(&self) -> &LocalCache<V> {
        &self.inner.local
    }

    pub fn remote(&self) -> &RemoteCache {
        &self.inner.remote
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Id this node stamps on the events it publishes
    pub fn node_id(&self) -> &str {
        self.inner.coordinator.node_id()
    }

    /// Unsubscribe from the bus and stop the sweeper, waiting for both
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(id) = self.subscription.take() {
            if let Err(err) = self.inner.bus.unsubscribe(id).await {
                warn!(error = %err, "Failed to unsubscribe from invalidation topic");
            }
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        debug!(node = %self.inner.coordinator.node_id(), "Cache node stopped");
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(id) = self.subscription.take() {
            let bus = Arc::clone(&self.inner.bus);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = bus.unsubscribe(id).await {
                        debug!(error = %err, "Failed to unsubscribe on drop");
                    }
                });
            }
        }
    }
}

impl<V> std::fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("node_id", &self.inner.coordinator.node_id())
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

/// L1 weight of a value: its JSON length, or its in-memory size if it does not encode
fn encoded_size<V: Serialize>(value: &V) -> u64 {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(std::mem::size_of::<V>() as u64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use assert_matches::assert_matches;

    fn config() -> CacheConfig {
        CacheConfig {
            sweep_interval: None,
            ..CacheConfig::default()
        }
    }

    type BoxedFetch = std::pin::Pin<
        Box<dyn Future<Output = std::result::Result<String, BoxError>> + Send>,
    >;

    fn counting(calls: &Arc<AtomicUsize>, value: &'static str) -> impl FnOnce() -> BoxedFetch {
        let calls = Arc::clone(calls);
        move || -> BoxedFetch {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value.to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_miss_then_l1_hit() {
        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache.get("user:1", counting(&calls, "alice")).await.unwrap();
        assert_eq!(first.origin, Origin::Source);
        assert!(!first.stale);

        let second = cache.get("user:1", counting(&calls, "alice")).await.unwrap();
        assert_eq!(second.origin, Origin::L1);
        assert_eq!(second.into_inner(), "alice");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.l1_hits, 1);
        assert_eq!(metrics.source_fetches, 1);
        assert_eq!(metrics.locks_acquired, 1);
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        cache.set("user:1", "alice".to_string(), None).await.unwrap();
        cache.local().clear();

        let calls = Arc::new(AtomicUsize::new(0));
        let hit = cache.get("user:1", counting(&calls, "other")).await.unwrap();
        assert_eq!(hit.origin, Origin::L2);
        assert_eq!(hit.value, "alice");
        assert!(cache.local().contains("user:1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        let result = cache
            .get("user:1", || async { Err::<String, BoxError>("db down".into()) })
            .await;
        assert_matches!(result, Err(Error::Source(_)));
        assert!(!cache.remote().is_locked("user:1").await.unwrap());
        assert_eq!(cache.metrics().source_errors, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token() {
        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = cache
            .get_with_cancel("user:1", counting(&calls, "x"), &cancel)
            .await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tag_operations_disabled() {
        let cache = CacheManager::<String>::in_memory(CacheConfig {
            tag_versioning_enabled: false,
            ..config()
        })
        .await
        .unwrap();
        assert_matches!(
            cache.invalidate_tag("products").await,
            Err(Error::TagVersioningDisabled)
        );
        assert_matches!(
            cache.tagged_key("products", "product:7").await,
            Err(Error::TagVersioningDisabled)
        );
    }

    #[tokio::test]
    async fn test_zero_ttl_set_rejected() {
        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        assert_matches!(
            cache.set("k", "v".to_string(), Some(Duration::ZERO)).await,
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = CacheManager::<String>::in_memory(CacheConfig {
            shard_count: 3,
            ..config()
        })
        .await;
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_get_from_source_port() {
        use crate::domain::ports::FnSource;

        let cache = CacheManager::<String>::in_memory(config()).await.unwrap();
        let source: Arc<dyn Source<String>> = Arc::new(FnSource::new(|key: String| async move {
            Ok::<String, BoxError>(format!("loaded {}", key))
        }));
        let value = cache.get_from("user:9", source).await.unwrap();
        assert_eq!(value.value, "loaded user:9");
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let store = Arc::new(InMemorySharedStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let cache = CacheManager::<String>::new(config(), store, bus.clone())
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("cache.invalidation"), 1);

        cache.shutdown().await;
        assert_eq!(bus.subscriber_count("cache.invalidation"), 0);
    }

    #[tokio::test]
    async fn test_local_ttl_cap_applies() {
        let cache = CacheManager::<String>::in_memory(CacheConfig {
            local_ttl_cap: Some(Duration::from_secs(5)),
            ..config()
        })
        .await
        .unwrap();
        cache
            .set("k", "v".to_string(), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert!(cache.local().remaining_ttl("k").unwrap() <= Duration::from_secs(5));
    }
}
