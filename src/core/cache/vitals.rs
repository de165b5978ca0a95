//! Time-ordered vitals history.
//!
//! A pre-allocated ring of samples behind a `parking_lot` read-write lock.
//! Appends happen on the real-time thread and never reallocate; readers on
//! other threads copy entries out in small pages, so a slow consumer holds
//! the lock only for one page at a time and never sees a half-applied
//! append.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::Duration;

use super::VitalSample;
use crate::error::{CapacityFault, ValidationFault};

const PAGE_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct VitalsCacheConfig {
    /// Hard limit on retained samples.
    pub capacity: usize,
    /// Samples older than this, relative to the newest, are evicted.
    pub retention: Duration,
    /// Consecutive evictions of unpersisted samples tolerated before a
    /// pressure warning is raised.
    pub pressure_threshold: u64,
}

impl Default for VitalsCacheConfig {
    fn default() -> Self {
        Self {
            // 72 h at one sample per second.
            capacity: 72 * 3600,
            retention: Duration::from_secs(72 * 3600),
            pressure_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    ordinal: u64,
    sample: VitalSample,
}

/// Position in the cache up to which samples have been stored. Obtained
/// from [`VitalsCache::unpersisted`], so samples appended after the copy
/// was taken are never covered by it, whatever their timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PersistMark(u64);

/// Samples awaiting storage, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PendingSamples {
    samples: Vec<VitalSample>,
    through: Option<PersistMark>,
}

impl PendingSamples {
    pub fn samples(&self) -> &[VitalSample] {
        &self.samples
    }

    /// Mark covering exactly these samples; `None` when there are none.
    pub fn mark(&self) -> Option<PersistMark> {
        self.through
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Entry>,
    next_ordinal: u64,
    persisted_through: Option<u64>,
    pressure: u64,
    pressure_raised: bool,
}

#[derive(Debug)]
pub struct VitalsCache {
    inner: RwLock<Inner>,
    config: VitalsCacheConfig,
}

impl VitalsCache {
    pub fn new(config: VitalsCacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_ordinal: 0,
                persisted_through: None,
                pressure: 0,
                pressure_raised: false,
            }),
            config: VitalsCacheConfig { capacity, ..config },
        }
    }

    /// Append a sample. Returns a pressure warning the first time
    /// unpersisted samples have been evicted for too long.
    pub fn append(&self, sample: VitalSample) -> Result<Option<CapacityFault>, ValidationFault> {
        let mut inner = self.inner.write();

        if let Some(newest) = inner.entries.back() {
            if sample.timestamp < newest.sample.timestamp {
                return Err(ValidationFault::OutOfOrder {
                    timestamp_ms: sample.timestamp.timestamp_millis(),
                    newest_ms: newest.sample.timestamp.timestamp_millis(),
                });
            }
        }

        // Time-based eviction first.
        let retention = ChronoDuration::from_std(self.config.retention).unwrap_or(ChronoDuration::MAX);
        if let Some(horizon) = sample.timestamp.checked_sub_signed(retention) {
            while inner
                .entries
                .front()
                .map(|e| e.sample.timestamp < horizon)
                .unwrap_or(false)
            {
                inner.entries.pop_front();
            }
        }

        let mut evicted_unpersisted = false;
        if inner.entries.len() >= self.config.capacity {
            if let Some(evicted) = inner.entries.pop_front() {
                evicted_unpersisted = !is_persisted(inner.persisted_through, &evicted);
            }
        }

        let ordinal = inner.next_ordinal;
        inner.next_ordinal += 1;
        inner.entries.push_back(Entry { ordinal, sample });

        if !evicted_unpersisted {
            inner.pressure = 0;
            inner.pressure_raised = false;
            return Ok(None);
        }

        inner.pressure += 1;
        if inner.pressure > self.config.pressure_threshold && !inner.pressure_raised {
            inner.pressure_raised = true;
            return Ok(Some(CapacityFault::EvictionPressure {
                evicted: inner.pressure,
            }));
        }
        Ok(None)
    }

    /// Lazily iterate samples with `start <= timestamp <= end` that were
    /// present when the range was created.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> VitalsRange<'_> {
        let limit = self.inner.read().next_ordinal;
        VitalsRange {
            cache: self,
            start,
            end,
            limit,
            resume: None,
            page: VecDeque::with_capacity(PAGE_SIZE),
            done: false,
        }
    }

    /// Copy of every sample not yet confirmed by storage, oldest first.
    ///
    /// Copied a page at a time so the real-time appender never waits on
    /// more than one page. Samples appended after the call are left for the
    /// next one.
    pub fn unpersisted(&self) -> PendingSamples {
        let (mut resume, limit) = {
            let inner = self.inner.read();
            (inner.persisted_through.map(|o| o + 1).unwrap_or(0), inner.next_ordinal)
        };
        let mut pending = PendingSamples::default();
        loop {
            let inner = self.inner.read();
            let from = inner.entries.partition_point(|e| e.ordinal < resume);
            let mut copied = 0;
            for entry in inner
                .entries
                .range(from..)
                .take_while(|e| e.ordinal < limit)
                .take(PAGE_SIZE)
            {
                pending.samples.push(entry.sample);
                pending.through = Some(PersistMark(entry.ordinal));
                resume = entry.ordinal + 1;
                copied += 1;
            }
            if copied < PAGE_SIZE {
                break;
            }
        }
        pending
    }

    /// Mark every sample up to and including `upto` as stored.
    pub fn mark_persisted(&self, upto: PersistMark) {
        let mut inner = self.inner.write();
        if inner.persisted_through.map(|p| upto.0 > p).unwrap_or(true) {
            inner.persisted_through = Some(upto.0);
        }
        inner.pressure = 0;
        inner.pressure_raised = false;
    }

    pub fn latest(&self) -> Option<VitalSample> {
        self.inner.read().entries.back().map(|e| e.sample)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.pressure = 0;
        inner.pressure_raised = false;
    }
}

fn is_persisted(through: Option<u64>, entry: &Entry) -> bool {
    through.map(|t| entry.ordinal <= t).unwrap_or(false)
}

/// Lazy, finite iterator over a time range of the cache.
///
/// Entries are copied a page at a time under the read lock. Samples evicted
/// between pages are skipped, never yielded twice.
#[derive(Debug)]
pub struct VitalsRange<'a> {
    cache: &'a VitalsCache,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: u64,
    resume: Option<u64>,
    page: VecDeque<VitalSample>,
    done: bool,
}

impl VitalsRange<'_> {
    /// Start over from the beginning of the range.
    pub fn restart(&mut self) {
        self.resume = None;
        self.page.clear();
        self.done = false;
    }

    fn fill_page(&mut self) {
        let inner = self.cache.inner.read();
        let entries = &inner.entries;
        let from = match self.resume {
            Some(ordinal) => entries.partition_point(|e| e.ordinal < ordinal),
            None => entries.partition_point(|e| e.sample.timestamp < self.start),
        };

        for entry in entries.range(from..).take(PAGE_SIZE) {
            if entry.ordinal >= self.limit || entry.sample.timestamp > self.end {
                self.done = true;
                break;
            }
            self.resume = Some(entry.ordinal + 1);
            if entry.sample.timestamp >= self.start {
                self.page.push_back(entry.sample);
            }
        }
        if self.page.is_empty() {
            self.done = true;
        }
    }
}

impl Iterator for VitalsRange<'_> {
    type Item = VitalSample;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            self.fill_page();
        }
        self.page.pop_front()
    }
}
