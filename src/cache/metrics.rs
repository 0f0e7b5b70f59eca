//! Cache Metrics Collection
//!
//! Read-path counters for monitoring cache health, plus rendering of
//! snapshots in the Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::l1::L1Stats;
use super::l2::L2Stats;
use crate::error::Result;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Read outcomes
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,

    // Source traffic
    source_fetches: AtomicU64,
    source_errors: AtomicU64,
    direct_fetches: AtomicU64,
    source_latency_us: AtomicU64,

    // Stampede guard
    locks_acquired: AtomicU64,
    locks_contended: AtomicU64,
    waits_filled: AtomicU64,
    wait_timeouts: AtomicU64,
    lock_takeovers: AtomicU64,
    stale_served: AtomicU64,
    cancellations: AtomicU64,

    // Invalidation
    invalidations: AtomicU64,
    tag_invalidations: AtomicU64,
    events_applied: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_error(&self) {
        self.l2_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A source call finished; `direct` marks calls made outside the fill lock
    pub fn record_source_fetch(&self, elapsed: Duration, ok: bool, direct: bool) {
        self.source_fetches.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.source_errors.fetch_add(1, Ordering::Relaxed);
        }
        if direct {
            self.direct_fetches.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.source_latency_us, elapsed);
    }

    pub fn record_lock_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contended(&self) {
        self.locks_contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_filled(&self) {
        self.waits_filled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_takeover(&self) {
        self.lock_takeovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_invalidation(&self) {
        self.tag_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn source_fetches(&self) -> u64 {
        self.source_fetches.load(Ordering::Relaxed)
    }

    pub fn source_latency(&self) -> Duration {
        Duration::from_micros(self.source_latency_us.load(Ordering::Relaxed))
    }

    /// Snapshot of the counters merged with tier statistics
    pub fn snapshot(&self, l1: &L1Stats, l2: &L2Stats) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let l1_hits = load(&self.l1_hits);
        let l2_hits = load(&self.l2_hits);
        let served = l1_hits + l2_hits + load(&self.waits_filled);
        let requests = l1_hits + load(&self.l1_misses);

        MetricsSnapshot {
            l1_hits,
            l1_misses: load(&self.l1_misses),
            l1_entries: l1.entries as u64,
            l1_size_bytes: l1.size_bytes,
            l1_evictions: l1.evictions,
            l1_expirations: l1.expirations,

            l2_hits,
            l2_misses: load(&self.l2_misses),
            l2_errors: load(&self.l2_errors),
            l2_timeouts: l2.timeouts,
            malformed_entries: l2.malformed,

            source_fetches: load(&self.source_fetches),
            source_errors: load(&self.source_errors),
            direct_fetches: load(&self.direct_fetches),
            source_latency_us: load(&self.source_latency_us),

            locks_acquired: load(&self.locks_acquired),
            locks_contended: load(&self.locks_contended),
            waits_filled: load(&self.waits_filled),
            wait_timeouts: load(&self.wait_timeouts),
            lock_takeovers: load(&self.lock_takeovers),
            stale_served: load(&self.stale_served),
            cancellations: load(&self.cancellations),

            invalidations: load(&self.invalidations),
            tag_invalidations: load(&self.tag_invalidations),
            events_applied: load(&self.events_applied),

            hit_ratio: if requests == 0 {
                0.0
            } else {
                served as f64 / requests as f64
            },
        }
    }
}

/// Snapshot of one node's cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    // L1
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_entries: u64,
    pub l1_size_bytes: u64,
    pub l1_evictions: u64,
    pub l1_expirations: u64,

    // L2
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    pub l2_timeouts: u64,
    pub malformed_entries: u64,

    // Source
    pub source_fetches: u64,
    pub source_errors: u64,
    pub direct_fetches: u64,
    pub source_latency_us: u64,

    // Stampede guard
    pub locks_acquired: u64,
    pub locks_contended: u64,
    pub waits_filled: u64,
    pub wait_timeouts: u64,
    pub lock_takeovers: u64,
    pub stale_served: u64,
    pub cancellations: u64,

    // Invalidation
    pub invalidations: u64,
    pub tag_invalidations: u64,
    pub events_applied: u64,

    /// Share of reads answered without calling the source
    pub hit_ratio: f64,
}

impl MetricsSnapshot {
    /// Render this snapshot alone, labelled with `node`
    pub fn to_prometheus(&self, node: &str) -> Result<String> {
        render_prometheus(&[(node.to_string(), self.clone())])
    }
}

type Field = (&'static str, &'static str, fn(&MetricsSnapshot) -> f64);

const EXPORTED: &[Field] = &[
    ("cache_l1_hits", "L1 hits", |s| s.l1_hits as f64),
    ("cache_l1_misses", "L1 misses", |s| s.l1_misses as f64),
    ("cache_l1_entries", "Entries held in L1", |s| s.l1_entries as f64),
    ("cache_l1_size_bytes", "Bytes held in L1", |s| s.l1_size_bytes as f64),
    ("cache_l1_evictions", "L1 evictions", |s| s.l1_evictions as f64),
    ("cache_l2_hits", "L2 hits", |s| s.l2_hits as f64),
    ("cache_l2_misses", "L2 misses", |s| s.l2_misses as f64),
    ("cache_l2_errors", "L2 calls that failed or timed out", |s| s.l2_errors as f64),
    ("cache_malformed_entries", "L2 entries discarded as undecodable", |s| {
        s.malformed_entries as f64
    }),
    ("cache_source_fetches", "Calls to the source of record", |s| s.source_fetches as f64),
    ("cache_source_errors", "Source calls that failed", |s| s.source_errors as f64),
    ("cache_direct_fetches", "Source calls made without the fill lock", |s| {
        s.direct_fetches as f64
    }),
    ("cache_source_latency_seconds", "Smoothed source latency", |s| {
        s.source_latency_us as f64 / 1_000_000.0
    }),
    ("cache_locks_acquired", "Fill locks acquired", |s| s.locks_acquired as f64),
    ("cache_locks_contended", "Fill lock attempts that found a holder", |s| {
        s.locks_contended as f64
    }),
    ("cache_wait_timeouts", "Waiters that gave up", |s| s.wait_timeouts as f64),
    ("cache_stale_served", "Expired values served after a wait timeout", |s| {
        s.stale_served as f64
    }),
    ("cache_invalidations", "Direct key invalidations", |s| s.invalidations as f64),
    ("cache_tag_invalidations", "Tag version bumps", |s| s.tag_invalidations as f64),
    ("cache_hit_ratio", "Share of reads served without the source", |s| s.hit_ratio),
];

/// Render per-node snapshots in the Prometheus text format, labelled by node
pub fn render_prometheus(nodes: &[(String, MetricsSnapshot)]) -> Result<String> {
    let registry = Registry::new();
    for (name, help, value) in EXPORTED {
        let gauge = GaugeVec::new(Opts::new(*name, *help), &["node"])?;
        registry.register(Box::new(gauge.clone()))?;
        for (node, snapshot) in nodes {
            gauge.with_label_values(&[node.as_str()]).set(value(snapshot));
        }
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::error::Error::Internal(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        let snapshot = metrics.snapshot(&L1Stats::default(), &L2Stats::default());
        assert_eq!(snapshot, MetricsSnapshot::default());
    }

    #[test]
    fn test_hit_ratio_counts_cached_answers() {
        let metrics = CacheMetrics::new();
        metrics.record_l1_hit();
        metrics.record_l1_miss();
        metrics.record_l2_hit();
        metrics.record_l1_miss();
        metrics.record_source_fetch(Duration::from_millis(5), true, false);

        let snapshot = metrics.snapshot(&L1Stats::default(), &L2Stats::default());
        assert_eq!(snapshot.l1_hits, 1);
        assert_eq!(snapshot.l1_misses, 2);
        assert!((snapshot.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_source_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.record_source_fetch(Duration::from_micros(100), true, false);
        assert_eq!(metrics.source_latency(), Duration::from_micros(100));

        metrics.record_source_fetch(Duration::from_micros(200), false, true);
        let latency = metrics.source_latency().as_micros();
        assert!(latency > 100 && latency < 200);

        let snapshot = metrics.snapshot(&L1Stats::default(), &L2Stats::default());
        assert_eq!(snapshot.source_fetches, 2);
        assert_eq!(snapshot.source_errors, 1);
        assert_eq!(snapshot.direct_fetches, 1);
    }

    #[test]
    fn test_snapshot_merges_tier_stats() {
        let metrics = CacheMetrics::new();
        let l1 = L1Stats {
            entries: 3,
            size_bytes: 120,
            evictions: 2,
            ..Default::default()
        };
        let l2 = L2Stats {
            malformed: 1,
            timeouts: 4,
            ..Default::default()
        };
        let snapshot = metrics.snapshot(&l1, &l2);
        assert_eq!(snapshot.l1_entries, 3);
        assert_eq!(snapshot.l1_evictions, 2);
        assert_eq!(snapshot.malformed_entries, 1);
        assert_eq!(snapshot.l2_timeouts, 4);
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = CacheMetrics::new();
        metrics.record_l1_hit();
        let a = metrics.snapshot(&L1Stats::default(), &L2Stats::default());
        let b = MetricsSnapshot::default();

        let text =
            render_prometheus(&[("node-a".to_string(), a), ("node-b".to_string(), b)]).unwrap();
        assert!(text.contains("# TYPE cache_l1_hits gauge"));
        assert!(text.contains("cache_l1_hits{node=\"node-a\"} 1"));
        assert!(text.contains("cache_l1_hits{node=\"node-b\"} 0"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsSnapshot::default()).unwrap();
        assert_eq!(json["l1_hits"], 0);
        assert_eq!(json["hit_ratio"], 0.0);
    }
}
