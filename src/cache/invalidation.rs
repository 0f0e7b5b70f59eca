//! Invalidation Coordinator
//!
//! Propagates invalidations to every node.
//!
//! # Direct invalidation
//!
//! The key is deleted from L2 first, then a `KeyInvalidated` event is
//! published so peers drop their L1 copies. Event delivery is best effort;
//! a node that misses the event serves its local copy until the local TTL
//! runs out, which `localTtlCap` bounds.
//!
//! # Tag versioning
//!
//! Keys belonging to a tag are composed as `{type}:{id}:v{version}`. Bumping
//! the tag's counter in L2 makes every key under older versions unreachable
//! at once; the orphaned entries expire on their own TTL.
//!
//! The coordinator remembers the highest version it has seen per tag, so
//! reads keep working (with possibly stale versions) while L2 is down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::entry::CacheKey;
use super::l2::RemoteCache;
use crate::domain::events::InvalidationEvent;
use crate::domain::ports::EventBus;
use crate::error::{Error, Result};

/// What a direct invalidation managed to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// L2 deletion succeeded
    pub remote_deleted: bool,
    /// Peers were notified
    pub published: bool,
}

impl InvalidationOutcome {
    /// Both steps succeeded
    pub fn is_complete(&self) -> bool {
        self.remote_deleted && self.published
    }
}

/// Cluster-wide invalidation
pub struct InvalidationCoordinator {
    remote: Arc<RemoteCache>,
    bus: Arc<dyn EventBus>,
    topic: String,
    node_id: String,
    known_versions: DashMap<String, u64>,
    sequence: AtomicU64,
}

impl InvalidationCoordinator {
    pub fn new(
        remote: Arc<RemoteCache>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            bus,
            topic: topic.into(),
            node_id: node_id.into(),
            known_versions: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Id stamped on events this node publishes
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Delete `key` from L2, then tell every node to drop it from L1.
    ///
    /// Neither step failing is fatal: the outcome reports what happened.
    pub async fn invalidate(&self, key: &str) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();

        match self.remote.delete(key).await {
            Ok(_) => outcome.remote_deleted = true,
            Err(err) => warn!(key, error = %err, "L2 delete failed during invalidation"),
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = InvalidationEvent::key_invalidated(key, self.node_id.clone(), sequence);
        match self.bus.publish(&self.topic, event).await {
            Ok(()) => outcome.published = true,
            Err(err) => warn!(key, error = %err, "Invalidation publish failed"),
        }

        debug!(key, ?outcome, "Key invalidated");
        outcome
    }

    /// Bump a tag's version in L2 and announce it; returns the new version.
    ///
    /// The bump is the invalidation itself, so an L2 failure is returned to
    /// the caller. A failed announcement is only logged.
    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64> {
        let version = self.remote.increment_version(tag).await?;
        self.observe_version(tag, version);

        let event = InvalidationEvent::tag_invalidated(tag, version, self.node_id.clone());
        if let Err(err) = self.bus.publish(&self.topic, event).await {
            warn!(tag, version, error = %err, "Tag invalidation publish failed");
        }

        info!(tag, version, "Tag invalidated");
        Ok(version)
    }

    /// Current version of a tag, falling back to the last one seen when L2 is unreachable
    pub async fn current_version(&self, tag: &str) -> u64 {
        match self.remote.current_version(tag).await {
            Ok(version) => {
                self.observe_version(tag, version);
                self.known_version(tag).unwrap_or(version)
            }
            Err(err) => {
                let fallback = self.known_version(tag).unwrap_or(0);
                debug!(tag, fallback, error = %err, "Using last known tag version");
                fallback
            }
        }
    }

    /// Compose `{type}:{id}:v{version}` for a key belonging to `tag`
    pub async fn versioned_key(&self, tag: &str, key: &str) -> CacheKey {
        let version = self.current_version(tag).await;
        CacheKey::parse(key).with_version(version)
    }

    /// Highest version observed locally
    pub fn known_version(&self, tag: &str) -> Option<u64> {
        self.known_versions.get(tag).map(|v| *v)
    }

    /// Record a version, never moving backwards
    pub fn observe_version(&self, tag: &str, version: u64) {
        self.known_versions
            .entry(tag.to_string())
            .and_modify(|known| *known = (*known).max(version))
            .or_insert(version);
    }

    /// Apply a received event; returns the L1 key to evict, if any
    pub fn handle_event(&self, event: &InvalidationEvent) -> Option<String> {
        match event {
            InvalidationEvent::KeyInvalidated { key, origin, .. } => {
                debug!(key, origin, "Received key invalidation");
                Some(key.clone())
            }
            InvalidationEvent::TagInvalidated { tag, version, .. } => {
                self.observe_version(tag, *version);
                None
            }
        }
    }
}

impl std::fmt::Debug for InvalidationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationCoordinator")
            .field("node_id", &self.node_id)
            .field("topic", &self.topic)
            .field("tags", &self.known_versions.len())
            .finish()
    }
}

/// Reject tag operations when versioning is switched off
pub(crate) fn require_tag_versioning(enabled: bool) -> Result<()> {
    if enabled {
        Ok(())
    } else {
        Err(Error::TagVersioningDisabled)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::domain::ports::SharedStore;

    use parking_lot::Mutex;

    use super::*;
    use crate::adapters::{InMemoryEventBus, InMemorySharedStore};
    use crate::domain::ports::EventHandler;

    struct Fixture {
        store: Arc<InMemorySharedStore>,
        bus: Arc<InMemoryEventBus>,
        coordinator: InvalidationCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySharedStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let remote = Arc::new(RemoteCache::new(store.clone(), Duration::from_millis(50)));
        let coordinator =
            InvalidationCoordinator::new(remote, bus.clone(), "cache.invalidation", "node-a");
        Fixture {
            store,
            bus,
            coordinator,
        }
    }

    async fn record(bus: &InMemoryEventBus) -> Arc<Mutex<Vec<InvalidationEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event: InvalidationEvent| sink.lock().push(event));
        bus.subscribe("cache.invalidation", handler).await.unwrap();
        seen
    }

    #[tokio::test]
    async fn test_invalidate_deletes_then_publishes() {
        let f = fixture();
        let seen = record(&f.bus).await;
        f.store
            .set("user:1", bytes::Bytes::from_static(b"1"), Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = f.coordinator.invalidate("user:1").await;
        assert!(outcome.is_complete());
        assert!(!f.store.contains("user:1"));

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(f.coordinator.handle_event(&events[0]).as_deref(), Some("user:1"));
        assert_eq!(events[0].origin(), "node-a");
    }

    #[tokio::test]
    async fn test_invalidate_publishes_when_store_down() {
        let f = fixture();
        let seen = record(&f.bus).await;
        f.store.set_available(false);

        let outcome = f.coordinator.invalidate("user:1").await;
        assert!(!outcome.remote_deleted);
        assert!(outcome.published);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_tag_invalidation_bumps_version() {
        let f = fixture();
        assert_eq!(f.coordinator.current_version("products").await, 0);
        assert_eq!(f.coordinator.invalidate_tag("products").await.unwrap(), 1);
        assert_eq!(f.coordinator.current_version("products").await, 1);

        let key = f.coordinator.versioned_key("products", "product:7").await;
        assert_eq!(key.to_string(), "product:7:v1");
    }

    #[tokio::test]
    async fn test_tag_invalidation_fails_without_store() {
        let f = fixture();
        f.store.set_available(false);
        assert!(f.coordinator.invalidate_tag("products").await.is_err());
        assert_eq!(f.coordinator.known_version("products"), None);
    }

    #[tokio::test]
    async fn test_version_fallback_when_store_down() {
        let f = fixture();
        f.coordinator.invalidate_tag("products").await.unwrap();
        f.coordinator.invalidate_tag("products").await.unwrap();

        f.store.set_available(false);
        assert_eq!(f.coordinator.current_version("products").await, 2);
    }

    #[test]
    fn test_observed_versions_never_decrease() {
        let f = fixture();
        f.coordinator.observe_version("t", 5);
        f.coordinator.observe_version("t", 3);
        assert_eq!(f.coordinator.known_version("t"), Some(5));

        let event = InvalidationEvent::tag_invalidated("t", 9, "node-b");
        assert_eq!(f.coordinator.handle_event(&event), None);
        assert_eq!(f.coordinator.known_version("t"), Some(9));
    }

    #[test]
    fn test_require_tag_versioning() {
        assert!(require_tag_versioning(true).is_ok());
        assert!(matches!(
            require_tag_versioning(false),
            Err(Error::TagVersioningDisabled)
        ));
    }
}
