//! Per-client fixed-window quota enforcement.
//!
//! Each client key owns a one-hour window that opens on its first counted
//! request. Up to `quota` requests are allowed inside the window; further
//! requests are denied until the window has fully elapsed, at which point the
//! next request opens a fresh window. Counters live in a [`RecordStore`], so
//! they survive restarts.
//!
//! A check is a read-decide-write sequence against the store. Concurrent
//! checks for the same key are serialized through a per-key async mutex so
//! no two of them can act on the same pre-increment count. Checks for
//! different keys run in parallel.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::store::{RateLimitRecord, RecordStore};

/// Length of every accounting window.
pub const WINDOW: TimeDelta = TimeDelta::hours(1);

/// Outcome of a single quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may be forwarded.
    pub allowed: bool,
    /// Requests left in the current window. Zero on deny.
    pub remaining: i64,
    /// Whole seconds until the current window resets.
    pub reset_secs: i64,
}

/// A thread-safe, per-client fixed-window limiter backed by a
/// [`RecordStore`].
///
/// Constructed once at startup and shared across all request handlers.
/// Cloning is cheap and clones share both the store and the lock table.
#[derive(Clone)]
pub struct QuotaLimiter {
    store: Arc<dyn RecordStore>,
    quota: i64,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("quota", &self.quota)
            .field("locked_keys", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    /// Creates a limiter allowing `quota` requests per client per window.
    pub fn new(store: Arc<dyn RecordStore>, quota: u32) -> Self {
        Self {
            store,
            quota: i64::from(quota),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Returns the configured per-window quota.
    pub fn quota(&self) -> i64 {
        self.quota
    }

    /// Checks `identity` against its quota at the current wall-clock time.
    pub async fn check_now(&self, identity: &str) -> Result<Decision> {
        self.check(identity, Utc::now()).await
    }

    /// Checks `identity` against its quota as of `now`.
    ///
    /// On allow, the incremented count is persisted before returning. On
    /// deny, the store is left untouched. A store failure is returned as
    /// [`crate::ProxyError::Storage`] and never as a decision.
    pub async fn check(&self, identity: &str, now: DateTime<Utc>) -> Result<Decision> {
        let lock = Arc::clone(self.locks.entry(identity.to_owned()).or_default().value());

        let decision = {
            let _guard = lock.lock().await;
            self.decide(identity, now).await
        };

        drop(lock);
        self.locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);

        decision
    }

    /// Removes records whose window ended at or before `now`. Such records
    /// are indistinguishable from absent ones, so this never changes a
    /// decision.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.purge_expired((now - WINDOW).timestamp()).await
    }

    async fn decide(&self, identity: &str, now: DateTime<Utc>) -> Result<Decision> {
        let (mut window_start, mut access_count) = match self.store.load(identity).await? {
            Some(record) => (
                DateTime::from_timestamp(record.window_start, 0).unwrap_or(now),
                record.access_count,
            ),
            None => (now, 0),
        };

        let mut remaining_window = window_start + WINDOW - now;

        if remaining_window <= TimeDelta::zero() {
            debug!(client = identity, "window expired, starting a new one");
            window_start = now;
            access_count = 0;
            remaining_window = WINDOW;
        } else if access_count >= self.quota {
            info!(client = identity, count = access_count, "quota exhausted");
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset_secs: remaining_window.num_seconds(),
            });
        }

        access_count += 1;
        self.store
            .save(&RateLimitRecord {
                identity: identity.to_owned(),
                window_start: window_start.timestamp(),
                access_count,
            })
            .await?;

        Ok(Decision {
            allowed: true,
            remaining: self.quota - access_count,
            reset_secs: remaining_window.num_seconds(),
        })
    }
}
