//! Domain Ports
//!
//! Abstractions the cache engine depends on. Adapters implement these traits
//! to plug in a concrete shared store, event bus, or source of record.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Engine                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │      SharedStore   │   EventBus   │   Source<V>      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │   InMemorySharedStore │ InMemoryEventBus │ LoggingEventBus   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::events::InvalidationEvent;
use crate::error::{BoxError, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Value read from the shared store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    /// Encoded payload
    pub data: Bytes,
    /// Time left before the shared store drops it
    pub ttl_remaining: Option<Duration>,
}

/// Proof of holding a per-key fill lock
#[derive(Debug, Clone, PartialEq)]
pub struct LockToken {
    /// Key the lock guards (not the lock's own storage key)
    pub key: String,
    /// Unique owner value stored under the lock key
    pub owner: String,
    /// When the lock was taken
    pub acquired_at: Instant,
    /// Lease after which the shared store drops the lock
    pub lease_ttl: Duration,
}

impl LockToken {
    /// Create a token with a fresh random owner id
    pub fn new(key: impl Into<String>, lease_ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner: uuid::Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            lease_ttl,
        }
    }

    /// Whether the lease has run out
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease_ttl
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback invoked for every event delivered on a topic
pub type EventHandler = Arc<dyn Fn(InvalidationEvent) + Send + Sync>;

// =============================================================================
// Shared Store Port
// =============================================================================

/// Cluster-wide key/value store with atomic conditional operations.
///
/// Every write carries a TTL; the store drops entries once it elapses.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value and its remaining TTL
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Write a value unconditionally
    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Write only when the key is absent or expired; returns whether it was written
    async fn set_if_absent(&self, key: &str, data: Bytes, ttl: Duration) -> Result<bool>;

    /// Delete only when the current value equals `expected`
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Atomically increment a decimal counter, creating it at 1
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Check backend health
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// Event Bus Port
// =============================================================================

/// Best-effort publish/subscribe channel between nodes
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every subscriber of `topic`
    async fn publish(&self, topic: &str, event: InvalidationEvent) -> Result<()>;

    /// Register a handler for `topic`
    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Result<SubscriptionId>;

    /// Remove a handler; unknown ids are ignored
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

// =============================================================================
// Source Port
// =============================================================================

/// Authoritative system of record behind the cache
#[async_trait]
pub trait Source<V>: Send + Sync {
    /// Load the value for `key`
    async fn fetch(&self, key: &str) -> std::result::Result<V, BoxError>;
}

/// Source backed by an async closure
pub struct FnSource<F> {
    fetch: F,
}

impl<F> FnSource<F> {
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

#[async_trait]
impl<V, F, Fut> Source<V> for FnSource<F>
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<V, BoxError>> + Send + 'static,
{
    async fn fetch(&self, key: &str) -> std::result::Result<V, BoxError> {
        (self.fetch)(key.to_string()).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lock_token_lease() {
        let token = LockToken::new("user:1", Duration::from_secs(5));
        assert!(!token.is_expired());
        assert_eq!(token.owner.len(), 36);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(token.is_expired());
    }

    #[test]
    fn test_lock_owners_are_unique() {
        let a = LockToken::new("k", Duration::from_secs(1));
        let b = LockToken::new("k", Duration::from_secs(1));
        assert_ne!(a.owner, b.owner);
    }

    #[tokio::test]
    async fn test_fn_source() {
        let source = FnSource::new(|key: String| async move {
            if key == "bad" {
                Err::<String, BoxError>("not found".into())
            } else {
                Ok(key.to_uppercase())
            }
        });
        assert_eq!(source.fetch("abc").await.unwrap(), "ABC");
        assert!(source.fetch("bad").await.is_err());
    }
}
