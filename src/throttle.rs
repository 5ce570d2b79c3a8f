//! Throttling alerts and sliding-window counters.
//!
//! Counters track per-(connection, direction, address) message rates over a
//! one-minute window with ten-second resolution. A throttling alert compares
//! the rate against a limit rescaled to the window resolution and flips
//! between `BelowLimit` and `AboveLimit`; consumers pause consumption while
//! the alert is raised.
//!
//! The counter registry is shared per process; counters are lock-free
//! increments, registry access is key-level atomic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::ConnectionId;

/// Total duration covered by a counter window.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Bucket resolution within the window.
pub const RESOLUTION: Duration = Duration::from_secs(10);

const BUCKETS: usize = (WINDOW.as_millis() / RESOLUTION.as_millis()) as usize;

struct Bucket {
    start_ms: AtomicU64,
    count: AtomicU64,
}

/// Fixed-resolution sliding-window counter.
///
/// The reported rate is the sum over buckets whose start time falls within
/// the last window. During bucket rotation an increment may be attributed to
/// the outgoing bucket; the error is bounded by one resolution step.
pub struct SlidingWindowCounter {
    origin: Instant,
    resolution_ms: u64,
    buckets: Vec<Bucket>,
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new(WINDOW, RESOLUTION)
    }
}

impl SlidingWindowCounter {
    pub fn new(window: Duration, resolution: Duration) -> Self {
        let buckets = (window.as_millis() / resolution.as_millis()).max(1) as usize;
        Self {
            origin: Instant::now(),
            resolution_ms: resolution.as_millis() as u64,
            buckets: (0..buckets)
                .map(|_| Bucket {
                    start_ms: AtomicU64::new(u64::MAX),
                    count: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn window_ms(&self) -> u64 {
        self.resolution_ms * self.buckets.len() as u64
    }

    pub fn increment(&self) {
        self.increment_at(self.now_ms());
    }

    pub fn rate(&self) -> u64 {
        self.rate_at(self.now_ms())
    }

    pub(crate) fn increment_at(&self, now_ms: u64) {
        let start = now_ms - now_ms % self.resolution_ms;
        let index = (now_ms / self.resolution_ms) as usize % self.buckets.len();
        let bucket = &self.buckets[index];

        let seen = bucket.start_ms.load(Ordering::Acquire);
        if seen != start
            && bucket
                .start_ms
                .compare_exchange(seen, start, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.count.store(0, Ordering::Release);
        }

        bucket.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn rate_at(&self, now_ms: u64) -> u64 {
        self.buckets
            .iter()
            .filter_map(|bucket| {
                let start = bucket.start_ms.load(Ordering::Acquire);
                if start == u64::MAX || start > now_ms {
                    return None;
                }
                (now_ms - start < self.window_ms()).then(|| bucket.count.load(Ordering::Acquire))
            })
            .sum()
    }
}

/// Alert state of a throttled flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    BelowLimit,
    AboveLimit,
}

/// Rescales a per-interval limit to the counter's window resolution.
///
/// `effective = floor(limit * (resolution / interval) * (1 - tolerance))`
pub fn effective_limit(limit: u64, interval: Duration, tolerance: f64) -> u64 {
    let interval_ms = interval.as_millis().max(1) as f64;
    let scaled = limit as f64 * (RESOLUTION.as_millis() as f64 / interval_ms) * (1.0 - tolerance);
    scaled.floor() as u64
}

/// Flips between [`AlertState`]s as the observed rate crosses the limit.
pub struct ThrottlingAlert {
    counter: Arc<SlidingWindowCounter>,
    /// `None` means unthrottled: the alert never raises.
    limit: Option<u64>,
    above: AtomicBool,
}

impl ThrottlingAlert {
    pub fn new(counter: Arc<SlidingWindowCounter>, limit: u64) -> Self {
        Self {
            counter,
            limit: Some(limit),
            above: AtomicBool::new(false),
        }
    }

    /// An alert that never raises, for connection types without throttling.
    pub fn unlimited(counter: Arc<SlidingWindowCounter>) -> Self {
        Self {
            counter,
            limit: None,
            above: AtomicBool::new(false),
        }
    }

    pub fn counter(&self) -> &Arc<SlidingWindowCounter> {
        &self.counter
    }

    pub fn state(&self) -> AlertState {
        if self.above.load(Ordering::Acquire) {
            AlertState::AboveLimit
        } else {
            AlertState::BelowLimit
        }
    }

    /// Re-evaluates the alert against the current rate.
    pub fn check(&self) -> AlertState {
        self.check_at(self.counter.now_ms())
    }

    pub(crate) fn check_at(&self, now_ms: u64) -> AlertState {
        let Some(limit) = self.limit else {
            return AlertState::BelowLimit;
        };

        let rate = self.counter.rate_at(now_ms);
        let above = rate > limit;
        let was_above = self.above.swap(above, Ordering::AcqRel);

        if above != was_above {
            if above {
                tracing::info!(rate, limit, "throttling limit exceeded, pausing");
            } else {
                tracing::info!(rate, limit, "throttling recovered, resuming");
            }
        }

        self.state()
    }
}

/// Message flow direction of a counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Key of one counter in the shared registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub connection: ConnectionId,
    pub direction: Direction,
    pub address: String,
}

/// Process-wide counter registry.
#[derive(Default)]
pub struct CounterRegistry {
    counters: papaya::HashMap<CounterKey, Arc<SlidingWindowCounter>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `key`, creating it on first use.
    pub fn counter(&self, key: CounterKey) -> Arc<SlidingWindowCounter> {
        self.counters
            .pin()
            .get_or_insert_with(key, || Arc::new(SlidingWindowCounter::default()))
            .clone()
    }

    /// Current rates of all known counters.
    pub fn snapshot(&self) -> Vec<(CounterKey, u64)> {
        self.counters
            .pin()
            .iter()
            .map(|(key, counter)| (key.clone(), counter.rate()))
            .collect()
    }

    /// Drops all counters belonging to `connection`.
    pub fn remove_connection(&self, connection: &ConnectionId) {
        let counters = self.counters.pin();
        let stale: Vec<CounterKey> = counters
            .iter()
            .filter(|(key, _)| &key.connection == connection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            counters.remove(&key);
        }
    }
}
