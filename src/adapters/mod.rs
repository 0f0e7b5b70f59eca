//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            SharedStore │ EventBus │ Source<V>              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemorySharedStore │ InMemoryEventBus │ LoggingEventBus   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cachefront::adapters::{InMemoryEventBus, InMemorySharedStore};
//!
//! let store = Arc::new(InMemorySharedStore::new());
//! let bus = Arc::new(InMemoryEventBus::new());
//! let node_a = CacheManager::<User>::new(config.clone(), store.clone(), bus.clone()).await?;
//! let node_b = CacheManager::<User>::new(config, store, bus).await?;
//! ```

mod event_bus;
mod memory_store;

pub use event_bus::{InMemoryEventBus, LoggingEventBus};
pub use memory_store::{InMemorySharedStore, StoreOpCounts};
