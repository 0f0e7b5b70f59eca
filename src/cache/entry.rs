//! Cache Entry Types
//!
//! Keys, entries and the lookup result shared by the L1 tiers.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Cache key - `{namespace}:{id}`, optionally suffixed with a tag version
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Namespace (entity type)
    namespace: String,
    /// Identifier within the namespace
    id: String,
    /// Tag version suffix
    version: Option<u64>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Parse a plain `{namespace}:{id}` string; a key without `:` has an empty namespace
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((namespace, id)) => Self::new(namespace, id),
            None => Self::new("", raw),
        }
    }

    /// Compose with a tag version: `{namespace}:{id}:v{version}`
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Get namespace
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get identifier
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get tag version suffix, if composed
    #[inline]
    pub fn version(&self) -> Option<u64> {
        self.version
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.namespace.is_empty() {
            write!(f, "{}:", self.namespace)?;
        }
        write!(f, "{}", self.id)?;
        if let Some(version) = self.version {
            write!(f, ":v{}", version)?;
        }
        Ok(())
    }
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Shard index for a key (`shard_count` must be a power of two)
#[inline]
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    (fx_hash(key.as_bytes()) as usize) & (shard_count - 1)
}

/// Cache entry owned by an [`EntryStore`](super::store::EntryStore)
#[derive(Clone)]
pub struct CacheEntry<V> {
    key: String,
    value: V,
    inserted_at: Instant,
    expires_at: Option<Instant>,
    version: u64,
    access_count: u64,
    last_access: Instant,
    size: u64,
}

impl<V> CacheEntry<V> {
    /// Create an entry at `now`; a zero TTL yields `None`
    pub fn new(
        key: impl Into<String>,
        value: V,
        size: u64,
        ttl: Option<Duration>,
        version: u64,
        now: Instant,
    ) -> Option<Self> {
        if matches!(ttl, Some(ttl) if ttl.is_zero()) {
            return None;
        }
        Some(Self {
            key: key.into(),
            value,
            inserted_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            version,
            access_count: 0,
            last_access: now,
            size,
        })
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consume the entry, returning its value
    pub fn into_value(self) -> V {
        self.value
    }

    #[inline]
    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    #[inline]
    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&mut self, now: Instant) -> u64 {
        self.last_access = now;
        self.access_count += 1;
        self.access_count
    }

    /// Expired at or after `expires_at`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(now))
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("version", &self.version)
            .field("access_count", &self.access_count)
            .finish()
    }
}

/// Result of an L1 lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Live entry
    Hit(V),
    /// Entry had expired; it was removed and its last value is handed back
    Expired(V),
    /// Nothing stored
    Miss,
}

impl<V> Lookup<V> {
    /// Value of a live hit only
    pub fn hit(self) -> Option<V> {
        match self {
            Lookup::Hit(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

// =============================================================================
// Tests
// =============================================================================
