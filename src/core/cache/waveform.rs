//! Fixed-capacity waveform ring.
//!
//! One writer (the real-time thread) and any number of readers. Each slot is
//! a tiny seqlock: its stamp is cleared while the writer fills it and then
//! set to `index + 1`. A reader that finds an unexpected stamp has been
//! lapped and starts over from the newest sample.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{ChannelId, WaveformSample};
use crate::core::clock::{from_epoch_ns, to_epoch_ns};

const MAX_RETRIES: usize = 3;

#[derive(Debug, Default)]
struct Slot {
    stamp: AtomicU64,
    timestamp_ns: AtomicU64,
    // value bits in the low half, sample rate bits in the high half
    payload: AtomicU64,
    channel: AtomicU32,
}

#[derive(Debug)]
pub struct WaveformCache {
    slots: Box<[Slot]>,
    cursor: AtomicU64,
}

enum Scan {
    Complete,
    Lapped,
}

impl WaveformCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            cursor: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Samples currently held, never more than `capacity()`.
    pub fn len(&self) -> usize {
        (self.cursor.load(Ordering::Acquire) as usize).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.load(Ordering::Acquire) == 0
    }

    /// Total samples ever appended.
    pub fn total_written(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Overwrite the oldest slot. Must only be called from one thread.
    pub fn append(&self, sample: WaveformSample) {
        let index = self.cursor.load(Ordering::Relaxed);
        let slot = &self.slots[(index % self.slots.len() as u64) as usize];

        slot.stamp.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.timestamp_ns.store(to_epoch_ns(sample.timestamp), Ordering::Relaxed);
        let payload = sample.value.to_bits() as u64 | (sample.sample_rate_hz.to_bits() as u64) << 32;
        slot.payload.store(payload, Ordering::Relaxed);
        slot.channel.store(sample.channel.0 as u32, Ordering::Relaxed);
        slot.stamp.store(index + 1, Ordering::Release);

        self.cursor.store(index + 1, Ordering::Release);
    }

    /// Samples from the last `window` of signal time, oldest first.
    pub fn last_seconds(&self, window: Duration) -> Vec<WaveformSample> {
        self.window(window, None)
    }

    /// Like [`last_seconds`](Self::last_seconds), restricted to one channel.
    pub fn channel_window(&self, channel: ChannelId, window: Duration) -> Vec<WaveformSample> {
        self.window(window, Some(channel))
    }

    fn window(&self, window: Duration, channel: Option<ChannelId>) -> Vec<WaveformSample> {
        let mut out = Vec::new();
        for _ in 0..MAX_RETRIES {
            out.clear();
            if let Scan::Complete = self.scan(window, channel, &mut out) {
                break;
            }
        }
        // After the last retry `out` still holds the newest part of the
        // window, which is what a lagging reader should see.
        out.reverse();
        out
    }

    /// Walk backwards from the newest sample, pushing newest first.
    fn scan(&self, window: Duration, channel: Option<ChannelId>, out: &mut Vec<WaveformSample>) -> Scan {
        let end = self.cursor.load(Ordering::Acquire);
        if end == 0 {
            return Scan::Complete;
        }
        let oldest = end.saturating_sub(self.slots.len() as u64);

        let Some(newest) = self.read(end - 1) else {
            return Scan::Lapped;
        };
        let cutoff = to_epoch_ns(newest.timestamp).saturating_sub(window.as_nanos() as u64);

        let mut index = end;
        while index > oldest {
            index -= 1;
            let Some(sample) = self.read(index) else {
                return Scan::Lapped;
            };
            if to_epoch_ns(sample.timestamp) < cutoff {
                break;
            }
            if channel.map(|c| c == sample.channel).unwrap_or(true) {
                out.push(sample);
            }
        }
        Scan::Complete
    }

    fn read(&self, index: u64) -> Option<WaveformSample> {
        let slot = &self.slots[(index % self.slots.len() as u64) as usize];
        let expected = index + 1;

        if slot.stamp.load(Ordering::Acquire) != expected {
            return None;
        }
        let timestamp_ns = slot.timestamp_ns.load(Ordering::Relaxed);
        let payload = slot.payload.load(Ordering::Relaxed);
        let channel = slot.channel.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if slot.stamp.load(Ordering::Relaxed) != expected {
            return None;
        }

        Some(WaveformSample {
            timestamp: from_epoch_ns(timestamp_ns),
            channel: ChannelId(channel as u8),
            sample_rate_hz: f32::from_bits((payload >> 32) as u32),
            value: f32::from_bits(payload as u32),
        })
    }
}
