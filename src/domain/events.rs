//! Invalidation Events
//!
//! Messages exchanged between cache nodes over the event bus. Events are
//! immutable records of an invalidation that already happened in the shared
//! store; receivers only drop their local copies.
//!
//! # Example
//!
//! ```ignore
//! let event = InvalidationEvent::key_invalidated("user:42", node_id, 7);
//! bus.publish("cache.invalidation", event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Invalidation broadcast between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvalidationEvent {
    /// A single key was deleted from the shared store
    KeyInvalidated {
        key: String,
        /// Node that performed the invalidation
        origin: String,
        /// Per-origin sequence number
        sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tag's version was bumped; keys under older versions are unreachable
    TagInvalidated {
        tag: String,
        version: u64,
        origin: String,
        timestamp: DateTime<Utc>,
    },
}

impl InvalidationEvent {
    /// Create a KeyInvalidated event.
    pub fn key_invalidated(key: impl Into<String>, origin: impl Into<String>, sequence: u64) -> Self {
        InvalidationEvent::KeyInvalidated {
            key: key.into(),
            origin: origin.into(),
            sequence,
            timestamp: Utc::now(),
        }
    }

    /// Create a TagInvalidated event.
    pub fn tag_invalidated(tag: impl Into<String>, version: u64, origin: impl Into<String>) -> Self {
        InvalidationEvent::TagInvalidated {
            tag: tag.into(),
            version,
            origin: origin.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            InvalidationEvent::KeyInvalidated { timestamp, .. } => *timestamp,
            InvalidationEvent::TagInvalidated { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            InvalidationEvent::KeyInvalidated { .. } => "KeyInvalidated",
            InvalidationEvent::TagInvalidated { .. } => "TagInvalidated",
        }
    }

    /// Node that emitted the event
    pub fn origin(&self) -> &str {
        match self {
            InvalidationEvent::KeyInvalidated { origin, .. } => origin,
            InvalidationEvent::TagInvalidated { origin, .. } => origin,
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
    fn test_event_serialization_is_tagged() {
        let event = InvalidationEvent::key_invalidated("user:42", "node-a", 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "KeyInvalidated");
        assert_eq!(json["key"], "user:42");
        assert_eq!(json["sequence"], 3);

        let parsed: InvalidationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_accessors() {
        let event = InvalidationEvent::tag_invalidated("products", 4, "node-b");
        assert_eq!(event.event_type(), "TagInvalidated");
        assert_eq!(event.origin(), "node-b");
        assert!(event.timestamp() <= Utc::now());
    }
}
