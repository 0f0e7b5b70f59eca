//! Engine Configuration
//!
//! All recognized options with defaults, YAML loading and validation.
//! Durations are written as Go-style strings (`250ms`, `5s`, `1m30s`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EvictionPolicy;
use crate::error::{Error, Result};

/// Cache engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of L1 entries (0 = unbounded)
    pub max_entries: usize,

    /// Maximum L1 size in bytes (0 = unbounded)
    pub max_bytes: u64,

    /// TTL applied when a write does not carry one
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,

    /// Victim selection strategy for L1
    pub eviction_policy: EvictionPolicy,

    /// Lease on the per-key fill lock
    #[serde(with = "duration_str")]
    pub lock_lease_ttl: Duration,

    /// How long a waiter polls for another caller's fill
    #[serde(with = "duration_str")]
    pub stampede_wait_timeout: Duration,

    /// Whether a timed-out waiter may call the source directly
    pub allow_thundering_fallback: bool,

    /// Deadline for every shared store call
    #[serde(with = "duration_str")]
    pub l2_timeout: Duration,

    /// Enable `{type}:{id}:v{version}` key composition
    pub tag_versioning_enabled: bool,

    /// Number of L1 shards (power of two)
    pub shard_count: usize,

    /// Background expiry sweep interval (None = lazy expiry only)
    #[serde(with = "duration_str::option")]
    pub sweep_interval: Option<Duration>,

    /// Upper bound for TTLs held in L1
    #[serde(with = "duration_str::option")]
    pub local_ttl_cap: Option<Duration>,

    /// Base delay between waiter polls
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Maximum random delay added to each poll
    #[serde(with = "duration_str")]
    pub poll_jitter: Duration,

    /// Subscribe L1 to key invalidation events
    pub event_invalidation_enabled: bool,

    /// Event bus topic for invalidation events
    pub invalidation_topic: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 256 * 1024 * 1024, // 256MB
            default_ttl: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Lru,
            lock_lease_ttl: Duration::from_secs(5),
            stampede_wait_timeout: Duration::from_secs(3),
            allow_thundering_fallback: true,
            l2_timeout: Duration::from_millis(50),
            tag_versioning_enabled: true,
            shard_count: 16,
            sweep_interval: Some(Duration::from_secs(30)),
            local_ttl_cap: None,
            poll_interval: Duration::from_millis(25),
            poll_jitter: Duration::from_millis(10),
            event_invalidation_enabled: true,
            invalidation_topic: "cache.invalidation".to_string(),
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(Error::Config(
                "defaultTtl must be greater than zero".to_string(),
            ));
        }
        if self.lock_lease_ttl.is_zero() {
            return Err(Error::Config(
                "lockLeaseTtl must be greater than zero".to_string(),
            ));
        }
        if self.l2_timeout.is_zero() {
            return Err(Error::Config(
                "l2Timeout must be greater than zero".to_string(),
            ));
        }
        if self.stampede_wait_timeout.is_zero() {
            return Err(Error::Config(
                "stampedeWaitTimeout must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.poll_interval >= self.stampede_wait_timeout {
            return Err(Error::Config(format!(
                "pollInterval {:?} must be non-zero and shorter than stampedeWaitTimeout {:?}",
                self.poll_interval, self.stampede_wait_timeout
            )));
        }
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "shardCount must be a power of two, got {}",
                self.shard_count
            )));
        }
        if matches!(self.local_ttl_cap, Some(cap) if cap.is_zero()) {
            return Err(Error::Config(
                "localTtlCap must be greater than zero".to_string(),
            ));
        }
        if matches!(self.sweep_interval, Some(interval) if interval.is_zero()) {
            return Err(Error::Config(
                "sweepInterval must be greater than zero".to_string(),
            ));
        }
        if self.invalidation_topic.trim().is_empty() {
            return Err(Error::Config(
                "invalidationTopic must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL to hold locally, honoring the local cap
    pub fn local_ttl(&self, ttl: Duration) -> Duration {
        match self.local_ttl_cap {
            Some(cap) => ttl.min(cap),
            None => ttl,
        }
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "250ms", "30s", "1h30m")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars
            .peek()
            .copied()
            .filter(|c| c.is_ascii_alphabetic() || *c == 'µ')
        {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }

        let num: u64 = num_buf.parse().map_err(|_| {
            Error::DurationParse(format!("invalid number in duration: {}", s))
        })?;

        let overflow = || Error::DurationParse(format!("duration out of range: {}", s));

        // Trailing number without a unit is seconds
        let part = match unit.as_str() {
            "ns" => Duration::from_nanos(num),
            "us" | "µs" => Duration::from_micros(num),
            "ms" => Duration::from_millis(num),
            "s" | "" => Duration::from_secs(num),
            "m" => Duration::from_secs(num.checked_mul(60).ok_or_else(overflow)?),
            "h" => Duration::from_secs(num.checked_mul(3600).ok_or_else(overflow)?),
            "d" => Duration::from_secs(num.checked_mul(86400).ok_or_else(overflow)?),
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total = total.checked_add(part).ok_or_else(overflow)?;
    }

    if total.is_zero() {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(total)
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos % 1_000 != 0 {
        format!("{}ns", nanos)
    } else if nanos % 1_000_000 != 0 {
        format!("{}us", d.as_micros())
    } else if nanos % 1_000_000_000 != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            d: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => serializer.serialize_some(&super::super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| super::super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600)); // uppercase
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_duration_raw_seconds() {
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("  90  ").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("ms").is_err());
        assert_matches!(
            parse_duration("9999999999999999999h"),
            Err(Error::DurationParse(_))
        );
        assert_matches!(
            parse_duration("18446744073709551615s1s"),
            Err(Error::DurationParse(_))
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(60)), "60s");
        assert_eq!(
            parse_duration(&format_duration(Duration::from_millis(1500))).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_format_duration_sub_millisecond_round_trips() {
        assert_eq!(format_duration(Duration::from_micros(500)), "500us");
        assert_eq!(format_duration(Duration::from_nanos(1_500)), "1500ns");
        for d in [
            Duration::from_micros(500),
            Duration::from_nanos(1_500),
            Duration::from_micros(2_250),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
        assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
    }

    // =========================================================================
    // CacheConfig Tests
    // =========================================================================

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.allow_thundering_fallback);
        assert!(config.tag_versioning_enabled);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
maxEntries: 500
maxBytes: 1048576
defaultTtl: 60s
evictionPolicy: lfu
lockLeaseTtl: 2s
stampedeWaitTimeout: 1s
allowThunderingFallback: false
l2Timeout: 20ms
tagVersioningEnabled: true
localTtlCap: 10s
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_entries, 500);
        assert_eq!(config.max_bytes, 1_048_576);
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.lock_lease_ttl, Duration::from_secs(2));
        assert!(!config.allow_thundering_fallback);
        assert_eq!(config.l2_timeout, Duration::from_millis(20));
        assert_eq!(config.local_ttl_cap, Some(Duration::from_secs(10)));
        // Unspecified fields keep defaults
        assert_eq!(config.shard_count, 16);
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let config = CacheConfig {
            eviction_policy: EvictionPolicy::Fifo,
            sweep_interval: None,
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = CacheConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_rejects_bad_duration() {
        let err = CacheConfig::from_yaml_str("defaultTtl: 5x\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_validate_rejects_inconsistent_options() {
        let config = CacheConfig {
            shard_count: 12,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = CacheConfig {
            poll_interval: Duration::from_secs(5),
            stampede_wait_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = CacheConfig {
            invalidation_topic: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_ttl_cap() {
        let config = CacheConfig {
            local_ttl_cap: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        assert_eq!(
            config.local_ttl(Duration::from_secs(60)),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.local_ttl(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
