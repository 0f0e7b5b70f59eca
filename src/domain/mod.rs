//! Domain Layer
//!
//! The contracts the cache engine is written against.
//!
//! - **Ports** (`ports.rs`) - Traits for the shared store, event bus and source of record
//! - **Events** (`events.rs`) - Invalidation messages exchanged between nodes
//!
//! # Usage
//!
//! ```ignore
//! use cachefront::domain::ports::{EventBus, SharedStore};
//!
//! async fn warm<S: SharedStore>(store: &S) -> Result<()> {
//!     store.set("user:1", Bytes::from_static(b"{}"), Duration::from_secs(60)).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::InvalidationEvent;
pub use ports::{
    EventBus, EventHandler, FnSource, LockToken, SharedStore, Source, StoredValue, SubscriptionId,
};
