//! Time sources.
//!
//! Wall-clock time stamps samples and alarms; the monotonic clock measures
//! heartbeat ages and escalation delays. Both come from one injectable
//! [`Clock`] so alarm timing can be driven deterministically in tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::platform;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic_ns(&self) -> u64;
}

/// The host's clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ns(&self) -> u64 {
        platform::monotonic_ns()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    wall: Arc<Mutex<DateTime<Utc>>>,
    mono: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall: Arc::new(Mutex::new(start)),
            mono: Arc::new(AtomicU64::new(1_000_000_000)),
        }
    }

    /// Move both clocks forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut wall = self.wall.lock();
        *wall += ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
        self.mono.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.wall.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.wall.lock()
    }

    fn monotonic_ns(&self) -> u64 {
        self.mono.load(Ordering::SeqCst)
    }
}

/// Convert a wall-clock instant to nanoseconds since the Unix epoch, as
/// carried in frames. Instants before the epoch map to zero.
pub fn to_epoch_ns(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt().map(|ns| ns.max(0) as u64).unwrap_or(0)
}

pub fn from_epoch_ns(ns: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(ns.min(i64::MAX as u64) as i64)
}
