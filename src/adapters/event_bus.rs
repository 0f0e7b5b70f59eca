//! Event Bus Adapters
//!
//! Implements the `EventBus` port with various backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::events::InvalidationEvent;
use crate::domain::ports::{EventBus, EventHandler, SubscriptionId};
use crate::error::{Error, Result};

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
}

/// In-process event bus.
///
/// Delivers each published event synchronously to every handler on the topic,
/// including the publisher's own. Publishes can be made to vanish to simulate
/// a lossy transport.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    dropping: AtomicBool,
    failing: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl InMemoryEventBus {
    /// Create a new in-memory event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently discard published events (true) or deliver them (false).
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    /// Make every publish return an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Get the number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Events accepted by `publish`.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Handler invocations performed.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("topics", &self.topics.read().len())
            .field("published", &self.published())
            .finish()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, event: InvalidationEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::EventBus(format!("publish to {} refused", topic)));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.dropping.load(Ordering::SeqCst) {
            debug!(topic, event_type = event.event_type(), "Event dropped");
            return Ok(());
        }

        // Handlers run outside the lock so they may publish or unsubscribe
        let handlers: Vec<EventHandler> = self
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.iter().map(|sub| Arc::clone(&sub.handler)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(event.clone());
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, handler });
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut topics = self.topics.write();
        for subs in topics.values_mut() {
            subs.retain(|sub| sub.id != id);
        }
        topics.retain(|_, subs| !subs.is_empty());
        Ok(())
    }
}

/// Logging decorator around another event bus.
///
/// Publishes events to the tracing system before forwarding them.
pub struct LoggingEventBus<B> {
    inner: B,
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl<B: EventBus> LoggingEventBus<B> {
    /// Wrap a bus, logging at debug level.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            info_level: false,
        }
    }

    /// Wrap a bus, logging at info level.
    pub fn info_level(inner: B) -> Self {
        Self {
            inner,
            info_level: true,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B> std::fmt::Debug for LoggingEventBus<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingEventBus")
            .field("info_level", &self.info_level)
            .finish()
    }
}

#[async_trait]
impl<B: EventBus> EventBus for LoggingEventBus<B> {
    async fn publish(&self, topic: &str, event: InvalidationEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(topic, event_type = %event_type, event = %json, "Invalidation event");
        } else {
            debug!(topic, event_type = %event_type, event = %json, "Invalidation event");
        }

        self.inner.publish(topic, event).await
    }

    async fn subscribe(&self, topic: &str, handler: EventHandler) -> Result<SubscriptionId> {
        debug!(topic, "Subscribing");
        self.inner.subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.inner.unsubscribe(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (EventHandler, Arc<RwLock<Vec<InvalidationEvent>>>) {
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event: InvalidationEvent| sink.write().push(event));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = InMemoryEventBus::new();
        let (h1, seen1) = collector();
        let (h2, seen2) = collector();
        bus.subscribe("t", h1).await.unwrap();
        bus.subscribe("t", h2).await.unwrap();

        bus.publish("t", InvalidationEvent::key_invalidated("k", "n", 1))
            .await
            .unwrap();
        bus.publish("other", InvalidationEvent::key_invalidated("k", "n", 2))
            .await
            .unwrap();

        assert_eq!(seen1.read().len(), 1);
        assert_eq!(seen2.read().len(), 1);
        assert_eq!(bus.delivered(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = InMemoryEventBus::new();
        let (handler, seen) = collector();
        let id = bus.subscribe("t", handler).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        bus.unsubscribe(id).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.publish("t", InvalidationEvent::key_invalidated("k", "n", 1))
            .await
            .unwrap();
        assert!(seen.read().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_and_failing() {
        let bus = InMemoryEventBus::new();
        let (handler, seen) = collector();
        bus.subscribe("t", handler).await.unwrap();

        bus.set_dropping(true);
        bus.publish("t", InvalidationEvent::key_invalidated("k", "n", 1))
            .await
            .unwrap();
        assert!(seen.read().is_empty());
        assert_eq!(bus.published(), 1);

        bus.set_failing(true);
        assert!(bus
            .publish("t", InvalidationEvent::key_invalidated("k", "n", 2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_logging_bus_forwards() {
        let bus = LoggingEventBus::info_level(InMemoryEventBus::new());
        let (handler, seen) = collector();
        bus.subscribe("t", handler).await.unwrap();

        bus.publish("t", InvalidationEvent::tag_invalidated("products", 2, "n"))
            .await
            .unwrap();
        assert_eq!(seen.read().len(), 1);
        assert_eq!(bus.inner().published(), 1);
    }
}
