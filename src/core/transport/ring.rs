//! Single-writer, single-reader frame ring over a [`SharedRegion`].
//!
//! The writer never waits for the reader. A reader that falls a full lap
//! behind jumps to the newest frame. Slot contents are copied with relaxed
//! loads between fences and are discarded when the write index shows the
//! writer may have touched the slot during the copy.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use super::frame::{Frame, FRAME_SIZE};
use super::region::{SharedRegion, SLOT_WORDS};
use crate::error::TransportFault;

/// Producer half. Only one may exist per region.
#[derive(Debug)]
pub struct RingWriter {
    region: Arc<SharedRegion>,
    next: u64,
}

impl RingWriter {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        let next = region.write_index().load(Ordering::Acquire);
        Self { region, next }
    }

    /// Index the next published frame will get.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Copy `frame` into its slot, then publish it and refresh the heartbeat.
    pub fn publish(&mut self, frame: &Frame, now_ns: u64) {
        let mut bytes = [0u8; FRAME_SIZE];
        frame.encode(&mut bytes);
        self.publish_raw(&bytes, now_ns);
    }

    /// Publish pre-encoded bytes as-is. Exposed so tests can inject corrupt
    /// frames.
    pub fn publish_raw(&mut self, bytes: &[u8; FRAME_SIZE], now_ns: u64) {
        let index = self.next;
        let slot = self.region.slot(index);

        // Pairs with the reader's acquire fence: a reader that sees any of
        // these words also sees the write index that announced this lap.
        fence(Ordering::Release);
        for (word, chunk) in slot.iter().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            word.store(u64::from_le_bytes(raw), Ordering::Relaxed);
        }

        self.next = index + 1;
        self.region.write_index().store(self.next, Ordering::Release);
        self.beat(now_ns);
    }

    /// Refresh the heartbeat without publishing a frame.
    pub fn beat(&self, now_ns: u64) {
        self.region.heartbeat().store(now_ns, Ordering::Release);
    }
}

/// Counters kept by the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_read: u64,
    pub frames_dropped: u64,
    pub checksum_failures: u64,
    pub malformed: u64,
    pub lapped_copies: u64,
}

/// Consumer half.
#[derive(Debug)]
pub struct RingReader {
    region: Arc<SharedRegion>,
    read_index: u64,
    stats: TransportStats,
}

impl RingReader {
    /// Start reading at the writer's current position.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        let read_index = region.write_index().load(Ordering::Acquire);
        Self {
            region,
            read_index,
            stats: TransportStats::default(),
        }
    }

    pub fn read_index(&self) -> u64 {
        self.read_index
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn heartbeat_ns(&self) -> u64 {
        self.region.heartbeat().load(Ordering::Acquire)
    }

    /// Skip everything already published.
    pub fn resync(&mut self) -> u64 {
        let latest = self.region.write_index().load(Ordering::Acquire);
        let skipped = latest.saturating_sub(self.read_index);
        self.read_index = latest;
        skipped
    }

    /// Take the next frame, if any. Never blocks.
    ///
    /// A checksum or decode failure consumes the slot and is returned as an
    /// error; the caller simply polls again.
    pub fn poll(&mut self) -> Result<Option<Frame>, TransportFault> {
        let slots = self.region.slot_count() as u64;
        let written = self.region.write_index().load(Ordering::Acquire);
        let index = self.read_index;

        if written == index {
            return Ok(None);
        }
        if written < index {
            // The producer restarted with a fresh region header.
            self.read_index = written;
            return Ok(None);
        }
        if written - index >= slots {
            return Err(self.jump_to_latest(written));
        }

        let mut bytes = [0u8; FRAME_SIZE];
        let slot = self.region.slot(index);
        debug_assert_eq!(slot.len(), SLOT_WORDS);
        for (word, chunk) in slot.iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        fence(Ordering::Acquire);

        let written_after = self.region.write_index().load(Ordering::Relaxed);
        if written_after.saturating_sub(index) >= slots {
            self.stats.lapped_copies += 1;
            return Err(self.jump_to_latest(written_after));
        }

        self.read_index = index + 1;
        match Frame::decode(&bytes, index) {
            Ok(frame) => {
                self.stats.frames_read += 1;
                Ok(Some(frame))
            }
            Err(fault @ TransportFault::ChecksumMismatch { .. }) => {
                self.stats.checksum_failures += 1;
                Err(fault)
            }
            Err(fault) => {
                self.stats.malformed += 1;
                Err(fault)
            }
        }
    }

    fn jump_to_latest(&mut self, written: u64) -> TransportFault {
        let latest = written - 1;
        let skipped = latest - self.read_index;
        self.read_index = latest;
        self.stats.frames_dropped += skipped;
        TransportFault::FrameDropped { skipped }
    }
}
