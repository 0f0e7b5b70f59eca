//! Stampede Guard
//!
//! Ensures that when many callers miss the same key at once, one caller (the
//! filler) loads it from the source while the rest wait for the fill to land
//! in L2.
//!
//! ```text
//!   caller ──acquire──▶ set_if_absent(lock:{key}, owner, lease)
//!                          │
//!              ┌───────────┴────────────┐
//!           acquired                 contended
//!              │                        │
//!           Filler               wait_for_fill: poll L2 every
//!        fetch, write,           interval + jitter, re-trying the
//!        release lock            lock each round until timeout
//! ```
//!
//! Lock release compares the stored owner id, so a filler whose lease already
//! ran out cannot delete a lock that a later caller now holds. A crashed
//! filler is recovered from when its lease expires: waiters cut their pause
//! short at the lease deadline, so one of them takes over no later than the
//! lease after the lock was acquired.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::l2::RemoteCache;
use crate::domain::ports::{LockToken, StoredValue};
use crate::error::{Error, Result};

/// Stampede guard settings
#[derive(Debug, Clone)]
pub struct StampedeConfig {
    /// Lock lease
    pub lease_ttl: Duration,
    /// Total time a waiter polls before giving up
    pub wait_timeout: Duration,
    /// Base delay between polls
    pub poll_interval: Duration,
    /// Upper bound of random delay added to each poll
    pub poll_jitter: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(25),
            poll_jitter: Duration::from_millis(10),
        }
    }
}

/// Result of trying to become the filler
#[derive(Debug)]
pub enum Acquisition {
    /// This caller holds the lock and must fill
    Filler(LockToken),
    /// Someone else is filling
    Contended,
    /// The shared store could not be reached
    Unavailable(Error),
}

/// Result of waiting on another caller's fill
#[derive(Debug)]
pub enum WaitOutcome {
    /// The value showed up in L2
    Filled(StoredValue),
    /// The previous holder went away and this caller now holds the lock
    Acquired(LockToken),
    /// Nothing arrived within the wait timeout
    TimedOut { waited: Duration },
    /// The shared store went away while waiting
    Unavailable(Error),
}

/// Per-key fill lock built on the shared store
#[derive(Debug, Clone)]
pub struct StampedeGuard {
    config: StampedeConfig,
}

impl StampedeGuard {
    pub fn new(config: StampedeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StampedeConfig {
        &self.config
    }

    /// Try to become the filler for `key`
    pub async fn acquire(&self, remote: &RemoteCache, key: &str) -> Acquisition {
        match remote.try_acquire_lock(key, self.config.lease_ttl).await {
            Ok(Some(token)) => {
                trace!(key, owner = %token.owner, "Fill lock acquired");
                Acquisition::Filler(token)
            }
            Ok(None) => Acquisition::Contended,
            Err(err) => Acquisition::Unavailable(err),
        }
    }

    /// Poll L2 until the filler's value appears, the lock frees up, or the wait times out.
    ///
    /// No pause runs past the current holder's lease deadline, so a crashed
    /// holder is replaced as soon as its lease runs out.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` fires.
    pub async fn wait_for_fill(
        &self,
        remote: &RemoteCache,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;
        let mut lease_left = self.lease_left(remote, key).await;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(key, waited = ?now - started, "Gave up waiting for fill");
                return Ok(WaitOutcome::TimedOut {
                    waited: now - started,
                });
            }

            let mut pause = self.next_delay().min(deadline - now);
            if let Some(left) = lease_left {
                pause = pause.min(left);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { key: key.to_string() });
                }
                _ = tokio::time::sleep(pause) => {}
            }

            match remote.get_raw(key).await {
                Ok(Some(stored)) => return Ok(WaitOutcome::Filled(stored)),
                Ok(None) => {}
                Err(err) => return Ok(WaitOutcome::Unavailable(err)),
            }

            // Lease expiry frees the lock; whoever grabs it next takes over the fill
            match remote.try_acquire_lock(key, self.config.lease_ttl).await {
                Ok(Some(token)) => {
                    debug!(key, "Took over fill after previous holder released");
                    return Ok(WaitOutcome::Acquired(token));
                }
                Ok(None) => lease_left = self.lease_left(remote, key).await,
                Err(err) => return Ok(WaitOutcome::Unavailable(err)),
            }
        }
    }

    /// Remaining lease of the current holder, if the store reports one.
    ///
    /// A zero remainder is ignored so a store that rounds expiry down cannot
    /// spin the wait loop.
    async fn lease_left(&self, remote: &RemoteCache, key: &str) -> Option<Duration> {
        match remote.lock_ttl_remaining(key).await {
            Ok(left) => left.filter(|left| !left.is_zero()),
            Err(err) => {
                trace!(key, error = %err, "Could not read fill lock lease");
                None
            }
        }
    }

    /// Release a lock, logging instead of failing
    pub async fn release(&self, remote: &RemoteCache, token: &LockToken) {
        match remote.release_lock(token).await {
            Ok(true) => trace!(key = %token.key, "Fill lock released"),
            Ok(false) => debug!(
                key = %token.key,
                "Fill lock already expired or taken over"
            ),
            Err(err) => warn!(key = %token.key, error = %err, "Failed to release fill lock"),
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.config.poll_interval + jitter
    }
}

// =============================================================================
// Tests
// =============================================================================
