//! Wall-clock abstraction for heartbeat timestamps.
//!
//! [`ClockSource`] lets tests replace the system clock. [`MonotonicClock`]
//! wraps any source and never hands out a value lower than one it already
//! returned, so heartbeats from one instance carry non-decreasing timestamps
//! even if the system clock steps backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in milliseconds since Unix epoch.
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> i64 {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_millis`.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Moves the clock to `millis`, backwards included.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock by `delta_millis`.
    pub fn advance(&self, delta_millis: i64) {
        self.now.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Clock wrapper whose readings never decrease.
pub struct MonotonicClock {
    source: Arc<dyn ClockSource>,
    last: AtomicI64,
}

impl MonotonicClock {
    /// Wraps `source`, never reporting less than the last reading.
    #[must_use]
    pub fn new(source: Arc<dyn ClockSource>) -> Self {
        Self {
            source,
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// Monotonic view over the system clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ClockSource for MonotonicClock {
    fn now_millis(&self) -> i64 {
        let observed = self.source.now_millis();
        let previous = self.last.fetch_max(observed, Ordering::SeqCst);
        observed.max(previous)
    }
}

impl std::fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
