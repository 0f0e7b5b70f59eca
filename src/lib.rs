//! Cachefront - Distributed Cache-Aside Engine
//!
//! Sits between application code and a slow source of record. Reads are
//! answered from a process-local L1, then a shared L2, and only then from the
//! source, with at most one source call per key in flight across the cluster.
//!
//! # Architecture
//!
//! ```text
//! caller → CacheManager → L1 (LocalCache) → L2 (RemoteCache) → Source<V>
//!                 │                               ▲
//!                 └── StampedeGuard ──────────────┘
//!                 └── InvalidationCoordinator ─── EventBus
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory shared store and event bus implementations
//! - [`cache`] - Entry store, eviction, L1/L2 tiers, stampede guard, facade
//! - [`config`] - Engine configuration
//! - [`domain`] - Ports and invalidation events
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheManager, CacheValue, EvictionPolicy, MetricsSnapshot, Origin};
pub use config::CacheConfig;
pub use error::{BoxError, Error, Result};
