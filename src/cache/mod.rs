//! Two-Tier Cache-Aside Engine
//!
//! A process-local L1 in front of a shared L2, with single-flight fills and
//! cluster-wide invalidation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         Cache Manager (facade)                           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 (LocalCache)      │ L2 (RemoteCache)     │ Invalidation              │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐    │
//! │  │ N × EntryStore │   │ │ SharedStore    │   │ │ EventBus topic     │    │
//! │  │ LRU/LFU/FIFO/  │   │ │ + JSON codec   │   │ │ + tag versions     │    │
//! │  │ Random         │   │ │ + deadlines    │   │ │   in L2            │    │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘    │
//! │         │             │         │            │           │               │
//! │         └─────────────┴─────────┴────────────┴───────────┘               │
//! │                              │                                           │
//! │                 Stampede Guard (lock:{key} in L2)                        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one source call per key per lease, cluster-wide
//! - L1 never holds more than `maxEntries` entries or `maxBytes` bytes
//! - An expired entry is never returned as fresh
//! - A failing L2 degrades to source reads instead of failing requests

mod entry;
mod invalidation;
mod l1;
mod l2;
mod manager;
mod metrics;
mod policy;
mod stampede;
mod store;

pub use entry::{shard_index, CacheEntry, CacheKey, Lookup};
pub use invalidation::{InvalidationCoordinator, InvalidationOutcome};
pub use l1::{L1Stats, LocalCache};
pub use l2::{lock_key, tag_version_key, L2Stats, RemoteCache, RemoteValue};
pub use manager::{CacheManager, CacheValue, Origin};
pub use metrics::{render_prometheus, CacheMetrics, MetricsSnapshot};
pub use policy::{EvictionPolicy, EvictionTracker};
pub use stampede::{Acquisition, StampedeConfig, StampedeGuard, WaitOutcome};
pub use store::{EntryStore, StoreConfig, StoreStats};
